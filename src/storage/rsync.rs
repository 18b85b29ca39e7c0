// dbbackup/src/storage/rsync.rs
use crate::errors::{BackupError, Result};
use crate::storage::{BackupFileRecord, StorageBackend};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use log::{error, info};
use std::path::Path;
use tokio::process::Command;

/// Legacy host keys stay accepted so older appliances keep working as
/// rsync targets.
const SSH_OPTS: [&str; 2] = [
    "-oHostKeyAlgorithms=+ssh-rsa",
    "-oPubkeyAcceptedKeyTypes=+ssh-rsa",
];

/// Rsync-over-SSH destination. Every operation shells out: rsync for the
/// transfer itself, plain ssh for directory setup, listing, deletion and
/// rotation copies.
pub struct RsyncBackend {
    host: String,
    user: String,
    base: String,
    flags: String,
    id: String,
}

impl RsyncBackend {
    pub fn new(host: String, user: String, base: String, flags: String) -> Self {
        let id = format!("rsync:{}@{}:{}", user, host, base);
        RsyncBackend {
            host,
            user,
            base: base.trim_end_matches('/').to_string(),
            flags,
            id,
        }
    }

    fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn full_path(&self, key: &str) -> String {
        format!("{}/{}", self.base, key)
    }

    fn upload_error(&self, message: impl std::fmt::Display) -> BackupError {
        BackupError::Upload {
            destination: self.id.clone(),
            message: message.to_string(),
        }
    }

    /// Runs a command on the remote host and returns its stdout.
    async fn remote(&self, command: &str) -> Result<String> {
        let output = Command::new("ssh")
            .args(SSH_OPTS)
            .arg(self.target())
            .arg(command)
            .output()
            .await
            .map_err(|e| self.upload_error(format!("Couldn't run ssh: {}", e)))?;
        if !output.status.success() {
            return Err(self.upload_error(format!(
                "Remote command `{}` failed: {}",
                command,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl StorageBackend for RsyncBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn put_file(&self, src: &Path, key: &str) -> Result<()> {
        let dst = self.full_path(key);
        if let Some((dir, _)) = dst.rsplit_once('/') {
            self.remote(&format!("mkdir -p '{}'", dir)).await?;
        }
        info!(
            "Rsync transfer started. Source: {} - Destination: {}:{}",
            src.display(),
            self.host,
            dst
        );
        let mut cmd = Command::new("rsync");
        for flag in self.flags.split_whitespace() {
            cmd.arg(flag);
        }
        let output = cmd
            .arg("-e")
            .arg(format!("ssh {}", SSH_OPTS.join(" ")))
            .arg(src)
            .arg(format!("{}:{}", self.target(), dst))
            .output()
            .await
            .map_err(|e| self.upload_error(format!("Couldn't run rsync: {}", e)))?;
        if !output.status.success() {
            return Err(self.upload_error(format!(
                "rsync exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!("Successfully copied {} to {}", src.display(), self.id);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BackupFileRecord>> {
        let root = self.full_path(prefix);
        // %T@ is the epoch mtime; depth 2 picks up per-table subdirectories.
        let listing = match self
            .remote(&format!(
                "[ -d '{root}' ] && find '{root}' -maxdepth 2 -type f -printf '%T@ %p\\n' || true"
            ))
            .await
        {
            Ok(listing) => listing,
            Err(e) => return Err(BackupError::Cleanup(e.to_string())),
        };

        let mut records = Vec::new();
        for line in listing.lines() {
            let Some((epoch, path)) = line.split_once(' ') else {
                continue;
            };
            let secs = epoch.split('.').next().unwrap_or("0");
            let Ok(secs) = secs.parse::<i64>() else {
                continue;
            };
            let name = path.rsplit('/').next().unwrap_or(path).to_string();
            records.push(BackupFileRecord {
                name,
                key: path.to_string(),
                modified: Utc.timestamp_opt(secs, 0).single().unwrap_or_default(),
            });
        }
        Ok(records)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            match self.remote(&format!("rm -f '{}'", key)).await {
                Ok(_) => info!("Deleted old backup: {}", key),
                Err(e) => error!("Failed to delete old backup {}: {}", key, e),
            }
        }
        Ok(())
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<()> {
        let src = self.full_path(src_key);
        let dst = self.full_path(dst_key);
        let mut command = String::new();
        if let Some((dir, _)) = dst.rsplit_once('/') {
            command.push_str(&format!("mkdir -p '{}' && ", dir));
        }
        command.push_str(&format!("cp '{}' '{}'", src, dst));
        self.remote(&command)
            .await
            .map_err(|e| BackupError::Rotation(format!(
                "Couldn't create rotation copy of {}: {}",
                src_key, e
            )))?;
        Ok(())
    }
}
