// dbbackup/src/backup/dumper/mysql.rs
use crate::backup::dumper::{
    ensure_parent_dirs, finish_child, pipe_into_seven_zip, spawn_piped, stream_stdout,
    DumpArtifact, Dumper,
};
use crate::backup::limiter;
use crate::backup::pipeline::FanoutWriter;
use crate::config::{DumpFormat, JobConfig, SourceConfig};
use crate::errors::{BackupError, Result};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{error, info};
use sqlx::mysql::MySqlConnection;
use sqlx::Connection;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use url::Url;

/// Schemas that are never worth backing up. The `mysql` schema itself stays
/// in the list because its `user` table is.
const SKIPPED_SCHEMAS: [&str; 3] = ["information_schema", "performance_schema", "sys"];

#[derive(Clone)]
pub struct MySqlDumper {
    source: SourceConfig,
    format: DumpFormat,
    archive_pass: Option<String>,
    dump_command: String,
}

impl MySqlDumper {
    pub fn new(config: &JobConfig) -> Self {
        // MariaDB installs its own dump binary; prefer it when present.
        let dump_command = match which::which("mariadb-dump") {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(_) => "mysqldump".to_string(),
        };
        MySqlDumper {
            source: config.source.clone(),
            format: config.format,
            archive_pass: config.archive_pass.clone(),
            dump_command,
        }
    }

    fn server_url(&self) -> Result<Url> {
        let mut url = Url::parse("mysql://localhost/")?;
        if let Some(host) = &self.source.host {
            url.set_host(Some(host.as_str()))?;
        }
        if let Some(port) = self.source.port {
            url.set_port(Some(port))
                .map_err(|_| BackupError::Connection("Couldn't set port on URL".to_string()))?;
        }
        if let Some(user) = &self.source.user {
            url.set_username(user)
                .map_err(|_| BackupError::Connection("Couldn't set user on URL".to_string()))?;
        }
        if let Some(password) = &self.source.password {
            url.set_password(Some(password.as_str())).map_err(|_| {
                BackupError::Connection("Couldn't set password on URL".to_string())
            })?;
        }
        Ok(url)
    }

    fn connection_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(host) = &self.source.host {
            args.push(format!("-h{}", host));
            if let Some(port) = self.source.port {
                args.push(format!("--port={}", port));
            }
        }
        if let Some(user) = &self.source.user {
            args.push(format!("-u{}", user));
        }
        if let Some(password) = &self.source.password {
            args.push(format!("-p{}", password));
        }
        args
    }

    fn dump_args(&self, db: &str, table: Option<&str>) -> Vec<String> {
        let mut args = self.connection_args();
        args.extend(
            [
                "--single-transaction",
                "--quick",
                "--skip-lock-tables",
                "--routines",
                "--triggers",
                "--events",
            ]
            .map(String::from),
        );
        args.push(db.to_string());
        match table {
            Some(table) => args.push(table.to_string()),
            // The grants live in mysql.user; the rest of the mysql schema
            // is server internals.
            None if db == "mysql" => args.push("user".to_string()),
            None => {}
        }
        args
    }

    async fn charset_and_tables(&self, db: &str) -> Result<(Vec<String>, String)> {
        let url = self.server_url()?;
        let mut conn = MySqlConnection::connect(url.as_str()).await?;
        let tables: Vec<String> = sqlx::query_scalar(&format!("SHOW TABLES FROM `{}`", db))
            .fetch_all(&mut conn)
            .await?;
        let (charset, collation): (String, String) = sqlx::query_as(
            "SELECT DEFAULT_CHARACTER_SET_NAME, DEFAULT_COLLATION_NAME \
             FROM INFORMATION_SCHEMA.SCHEMATA WHERE SCHEMA_NAME = ?",
        )
        .bind(db)
        .fetch_one(&mut conn)
        .await?;
        Ok((tables, format!("{} {}", charset, collation)))
    }

    /// Dumps one database (or one table of it) into `dir` under `name` plus
    /// the compression extension.
    async fn dump_one(
        &self,
        db: &str,
        table: Option<&str>,
        dir: &Path,
        name: &str,
    ) -> Result<DumpArtifact> {
        let _permit = limiter::acquire().await;
        let args = self.dump_args(db, table);

        match (self.format, &self.archive_pass) {
            (DumpFormat::Gzip, None) => {
                let name = format!("{}.sql.gz", name);
                let path = dir.join(&name);
                ensure_parent_dirs(&path).await?;
                let mut cmd = Command::new(&self.dump_command);
                cmd.args(&args);
                let mut child = spawn_piped(cmd, &self.dump_command)?;
                let mut stdout = child.stdout.take().ok_or_else(|| {
                    BackupError::Dump(format!("{} has no stdout pipe", self.dump_command))
                })?;
                let file = std::fs::File::create(&path).map_err(|e| {
                    BackupError::Dump(format!("Couldn't create {}: {}", path.display(), e))
                })?;
                let mut encoder = GzEncoder::new(file, Compression::default());
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let n = stdout
                        .read(&mut buf)
                        .await
                        .map_err(|e| BackupError::Dump(e.to_string()))?;
                    if n == 0 {
                        break;
                    }
                    encoder
                        .write_all(&buf[..n])
                        .map_err(|e| BackupError::Compression(e.to_string()))?;
                }
                encoder
                    .finish()
                    .map_err(|e| BackupError::Compression(e.to_string()))?;
                finish_child(child, &self.dump_command, true).await?;
                Ok(DumpArtifact { path, name })
            }
            (_, pass) => {
                let name = format!("{}.sql.7z", name);
                let path = dir.join(&name);
                ensure_parent_dirs(&path).await?;
                let mut cmd = Command::new(&self.dump_command);
                cmd.args(&args);
                let child = spawn_piped(cmd, &self.dump_command)?;
                pipe_into_seven_zip(
                    child,
                    &path,
                    pass.as_deref(),
                    false,
                    &self.dump_command,
                    true,
                )
                .await?;
                Ok(DumpArtifact { path, name })
            }
        }
    }
}

#[async_trait]
impl Dumper for MySqlDumper {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let url = self.server_url()?;
        let mut conn = MySqlConnection::connect(url.as_str()).await?;
        let databases: Vec<String> = sqlx::query_scalar("SHOW DATABASES")
            .fetch_all(&mut conn)
            .await?;
        Ok(databases
            .into_iter()
            .filter(|db| !SKIPPED_SCHEMAS.contains(&db.as_str()))
            .collect())
    }

    async fn dump_to_file(&self, db: &str, dir: &Path, name: &str) -> Result<DumpArtifact> {
        info!(
            "MySQL backup started. DB: {} - Compression algorithm: {} - Encrypted: {}",
            db,
            match self.format {
                DumpFormat::Gzip => "gzip",
                DumpFormat::SevenZip => "7zip",
            },
            self.archive_pass.is_some()
        );
        let artifact = self.dump_one(db, None, dir, name).await?;
        info!(
            "Successfully backed up {} at: {}",
            db,
            artifact.path.display()
        );
        Ok(artifact)
    }

    async fn dump_to_stream(&self, db: &str, sink: &mut FanoutWriter) -> Result<()> {
        let _permit = limiter::acquire().await;
        info!("MySQL streaming backup started. DB: {}", db);
        let mut cmd = Command::new(&self.dump_command);
        cmd.args(self.dump_args(db, None));
        let child = spawn_piped(cmd, &self.dump_command)?;
        stream_stdout(child, sink, &self.dump_command, true, true).await
    }

    fn supports_streaming(&self) -> bool {
        // 7z archiving needs a seekable output file.
        self.format == DumpFormat::Gzip && self.archive_pass.is_none()
    }

    fn streaming_extension(&self) -> &'static str {
        ".sql.gz"
    }

    async fn dump_tables(
        &self,
        db: &str,
        dir: &Path,
        name_for_table: &(dyn for<'a> Fn(&'a str) -> String + Send + Sync),
        meta_name: &str,
    ) -> Result<Vec<DumpArtifact>> {
        let (tables, charset) = self.charset_and_tables(db).await?;

        let meta_path = dir.join(meta_name);
        ensure_parent_dirs(&meta_path).await?;
        tokio::fs::write(&meta_path, &charset).await.map_err(|e| {
            BackupError::Dump(format!(
                "Couldn't write {}: {}",
                meta_path.display(),
                e
            ))
        })?;
        let mut artifacts = vec![DumpArtifact {
            path: meta_path,
            name: meta_name.to_string(),
        }];

        let mut handles = Vec::new();
        for table in tables {
            if db == "mysql" && table != "user" {
                continue;
            }
            let this = self.clone();
            let db = db.to_string();
            let dir: PathBuf = dir.to_path_buf();
            let name = name_for_table(&table);
            handles.push(tokio::spawn(async move {
                info!("MySQL backup started. DB: {} Table: {}", db, table);
                let result = this.dump_one(&db, Some(&table), &dir, &name).await;
                (table, result)
            }));
        }

        let mut first_error = None;
        for handle in handles {
            let (table, result) = handle
                .await
                .map_err(|e| BackupError::Dump(format!("table dump task panicked: {}", e)))?;
            match result {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => {
                    error!("Couldn't dump table {} of {} - Error: {}", table, db, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(artifacts),
        }
    }

    fn supports_table_dumps(&self) -> bool {
        true
    }
}
