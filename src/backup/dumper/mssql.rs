// dbbackup/src/backup/dumper/mssql.rs
use crate::backup::dumper::{ensure_parent_dirs, DumpArtifact, Dumper};
use crate::backup::limiter;
use crate::config::{JobConfig, SourceConfig};
use crate::errors::{BackupError, Result};
use async_trait::async_trait;
use log::info;
use std::path::Path;
use tokio::process::Command;

/// SQL Server backups go through sqlcmd and the server's own BACKUP
/// DATABASE statement, so the .bak lands wherever the server can write.
/// Buffered only: there is no dump-to-stdout equivalent.
pub struct MsSqlDumper {
    source: SourceConfig,
}

impl MsSqlDumper {
    pub fn new(config: &JobConfig) -> Self {
        MsSqlDumper {
            source: config.source.clone(),
        }
    }

    fn sqlcmd(&self) -> Result<Command> {
        let user = self.source.user.as_deref().ok_or_else(|| {
            BackupError::Connection("MSSQL backups require a source user".to_string())
        })?;
        let password = self.source.password.as_deref().ok_or_else(|| {
            BackupError::Connection("MSSQL backups require a source password".to_string())
        })?;
        let server = match (&self.source.host, self.source.port) {
            (Some(host), Some(port)) => format!("{},{}", host, port),
            (Some(host), None) => host.clone(),
            (None, _) => "localhost".to_string(),
        };
        let mut cmd = Command::new("sqlcmd");
        cmd.arg("-S")
            .arg(server)
            .arg("-U")
            .arg(user)
            .arg("-P")
            .arg(password)
            .arg("-C");
        Ok(cmd)
    }

    async fn run_query(&self, query: &str) -> Result<String> {
        let mut cmd = self.sqlcmd()?;
        cmd.arg("-h").arg("-1").arg("-W").arg("-Q").arg(query);
        let output = cmd
            .output()
            .await
            .map_err(|e| BackupError::Dump(format!("Couldn't start sqlcmd: {}", e)))?;
        if !output.status.success() {
            return Err(BackupError::Dump(format!(
                "sqlcmd exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Dumper for MsSqlDumper {
    async fn list_databases(&self) -> Result<Vec<String>> {
        // database_id <= 4 are master/tempdb/model/msdb.
        let out = self
            .run_query(
                "SET NOCOUNT ON; SELECT name FROM sys.databases WHERE database_id > 4;",
            )
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn dump_to_file(&self, db: &str, dir: &Path, name: &str) -> Result<DumpArtifact> {
        let _permit = limiter::acquire().await;
        info!("MSSQL backup started. DB: {}", db);
        let name = format!("{}.bak", name);
        let path = dir.join(&name);
        ensure_parent_dirs(&path).await?;
        self.run_query(&format!(
            "BACKUP DATABASE [{}] TO DISK = N'{}' WITH COMPRESSION;",
            db,
            path.display()
        ))
        .await?;
        info!("Successfully backed up {} at: {}", db, path.display());
        Ok(DumpArtifact { path, name })
    }
}
