// dbbackup/src/backup/dumper/postgres.rs
use crate::backup::dumper::{
    ensure_parent_dirs, finish_child, pipe_into_seven_zip, spawn_piped, stream_stdout,
    DumpArtifact, Dumper,
};
use crate::backup::limiter;
use crate::backup::pipeline::FanoutWriter;
use crate::config::{JobConfig, SourceConfig};
use crate::errors::{BackupError, Result};
use async_trait::async_trait;
use log::info;
use sqlx::Connection;
use sqlx::postgres::PgConnection;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use url::Url;

pub struct PostgresDumper {
    source: SourceConfig,
    archive_pass: Option<String>,
}

impl PostgresDumper {
    pub fn new(config: &JobConfig) -> Self {
        PostgresDumper {
            source: config.source.clone(),
            archive_pass: config.archive_pass.clone(),
        }
    }

    /// Connection URL against the maintenance database. Url handles
    /// percent-encoding of credentials.
    fn admin_url(&self) -> Result<Url> {
        let mut url = Url::parse("postgresql://localhost/postgres")?;
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

    /// What pg_dump connects to: a full URL for remote servers, a bare
    /// database name (peer auth) otherwise.
    fn dump_target(&self, db: &str) -> Result<String> {
        if self.source.is_remote() {
            let mut url = self.admin_url()?;
            url.set_path(db);
            Ok(url.to_string())
        } else {
            Ok(db.to_string())
        }
    }
}

#[async_trait]
impl Dumper for PostgresDumper {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let url = self.admin_url()?;
        let mut conn = PgConnection::connect(url.as_str()).await?;
        let databases: Vec<String> = sqlx::query_scalar(
            "SELECT datname FROM pg_database \
             WHERE NOT datistemplate AND datname <> 'postgres' ORDER BY datname",
        )
        .fetch_all(&mut conn)
        .await?;
        Ok(databases)
    }

    async fn dump_to_file(&self, db: &str, dir: &Path, name: &str) -> Result<DumpArtifact> {
        let _permit = limiter::acquire().await;
        info!(
            "PostgreSQL backup started. DB: {} - Encrypted: {}",
            db,
            self.archive_pass.is_some()
        );
        let target = self.dump_target(db)?;

        let artifact = match &self.archive_pass {
            None => {
                let name = format!("{}.dump", name);
                let path = dir.join(&name);
                ensure_parent_dirs(&path).await?;
                let mut cmd = Command::new("pg_dump");
                cmd.arg(&target)
                    .arg("-Fc")
                    .arg("-f")
                    .arg(&path)
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped());
                let child = cmd
                    .spawn()
                    .map_err(|e| BackupError::Dump(format!("Couldn't start pg_dump: {}", e)))?;
                finish_child(child, "pg_dump", false).await?;
                DumpArtifact { path, name }
            }
            Some(pass) => {
                let name = format!("{}.dump.7z", name);
                let path = dir.join(&name);
                ensure_parent_dirs(&path).await?;
                let mut cmd = Command::new("pg_dump");
                cmd.arg(&target).arg("-Fc");
                let child = spawn_piped(cmd, "pg_dump")?;
                // The custom format is already compressed; 7z only wraps it
                // for encryption.
                pipe_into_seven_zip(child, &path, Some(pass), true, "pg_dump", false).await?;
                DumpArtifact { path, name }
            }
        };
        info!(
            "Successfully backed up {} at: {}",
            db,
            artifact.path.display()
        );
        Ok(artifact)
    }

    async fn dump_to_stream(&self, db: &str, sink: &mut FanoutWriter) -> Result<()> {
        let _permit = limiter::acquire().await;
        info!("PostgreSQL streaming backup started. DB: {}", db);
        let target = self.dump_target(db)?;
        let mut cmd = Command::new("pg_dump");
        cmd.arg(&target).arg("-Fc");
        let child = spawn_piped(cmd, "pg_dump")?;
        stream_stdout(child, sink, "pg_dump", false, false).await
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn streaming_extension(&self) -> &'static str {
        ".dump"
    }
}
