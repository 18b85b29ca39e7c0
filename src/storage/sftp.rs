// dbbackup/src/storage/sftp.rs
use crate::errors::{BackupError, Result};
use crate::storage::{BackupFileRecord, StorageBackend};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use log::{error, info};
use ssh2::{Session, Sftp};
use std::io;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

/// SFTP destination authenticated through the local SSH agent. ssh2 is a
/// blocking library, so every operation opens a fresh session inside
/// `spawn_blocking`, mirroring the one-connection-per-transfer behavior of
/// command-line sftp.
pub struct SftpBackend {
    host: String,
    port: u16,
    user: String,
    base: String,
    id: String,
}

impl SftpBackend {
    pub fn new(host: String, port: u16, user: String, base: String) -> Self {
        let id = format!("sftp:{}@{}:{}", user, host, base);
        SftpBackend {
            host,
            port,
            user,
            base: base.trim_end_matches('/').to_string(),
            id,
        }
    }

    fn upload_error(&self, message: impl std::fmt::Display) -> BackupError {
        BackupError::Upload {
            destination: self.id.clone(),
            message: message.to_string(),
        }
    }

    fn connect_blocking(host: &str, port: u16, user: &str) -> io::Result<(Session, Sftp)> {
        let tcp = TcpStream::connect((host, port))?;
        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;
        session.userauth_agent(user)?;
        let sftp = session.sftp()?;
        Ok((session, sftp))
    }

    fn mkdir_all_blocking(sftp: &Sftp, path: &Path) -> io::Result<()> {
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            // Already-existing directories are fine; a real permission
            // problem resurfaces when the file itself is created.
            let _ = sftp.mkdir(&current, 0o770);
        }
        Ok(())
    }

    fn full_path(&self, key: &str) -> PathBuf {
        PathBuf::from(format!("{}/{}", self.base, key))
    }
}

#[async_trait]
impl StorageBackend for SftpBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn put_file(&self, src: &Path, key: &str) -> Result<()> {
        let host = self.host.clone();
        let port = self.port;
        let user = self.user.clone();
        let src = src.to_path_buf();
        let dst = self.full_path(key);
        info!(
            "SFTP transfer started. Source: {} - Destination: {}:{}",
            src.display(),
            host,
            dst.display()
        );
        let local_path = src.clone();
        let result = tokio::task::spawn_blocking(move || -> io::Result<()> {
            let (_session, sftp) = Self::connect_blocking(&host, port, &user)?;
            if let Some(parent) = dst.parent() {
                Self::mkdir_all_blocking(&sftp, parent)?;
            }
            let mut local = std::fs::File::open(&local_path)?;
            let mut remote = sftp.create(&dst)?;
            io::copy(&mut local, &mut remote)?;
            Ok(())
        })
        .await
        .map_err(|e| self.upload_error(e))?;
        result.map_err(|e| self.upload_error(e))?;
        info!("Successfully copied {} to {}", src.display(), self.id);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BackupFileRecord>> {
        let host = self.host.clone();
        let port = self.port;
        let user = self.user.clone();
        let root = self.full_path(prefix);
        let listing = tokio::task::spawn_blocking(move || -> io::Result<Vec<(PathBuf, Option<u64>)>> {
            let (_session, sftp) = Self::connect_blocking(&host, port, &user)?;
            let mut out = Vec::new();
            let entries = match sftp.readdir(&root) {
                Ok(entries) => entries,
                // Missing bucket directory means nothing to clean up.
                Err(_) => return Ok(out),
            };
            for (path, stat) in entries {
                if stat.is_dir() {
                    if let Ok(sub) = sftp.readdir(&path) {
                        for (sub_path, sub_stat) in sub {
                            if !sub_stat.is_dir() {
                                out.push((sub_path, sub_stat.mtime));
                            }
                        }
                    }
                } else {
                    out.push((path, stat.mtime));
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| BackupError::Cleanup(e.to_string()))?
        .map_err(|e| BackupError::Cleanup(e.to_string()))?;

        let records = listing
            .into_iter()
            .filter_map(|(path, mtime)| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                let modified = Utc
                    .timestamp_opt(mtime.unwrap_or(0) as i64, 0)
                    .single()
                    .unwrap_or_default();
                Some(BackupFileRecord {
                    name,
                    key: path.to_string_lossy().into_owned(),
                    modified,
                })
            })
            .collect();
        Ok(records)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let host = self.host.clone();
        let port = self.port;
        let user = self.user.clone();
        let keys = keys.to_vec();
        let deleted = tokio::task::spawn_blocking(move || -> io::Result<Vec<(String, Option<String>)>> {
            let (_session, sftp) = Self::connect_blocking(&host, port, &user)?;
            let mut results = Vec::with_capacity(keys.len());
            for key in keys {
                let outcome = sftp.unlink(Path::new(&key)).err().map(|e| e.to_string());
                results.push((key, outcome));
            }
            Ok(results)
        })
        .await
        .map_err(|e| BackupError::Cleanup(e.to_string()))?
        .map_err(|e| BackupError::Cleanup(e.to_string()))?;

        for (key, failure) in deleted {
            match failure {
                None => info!("Deleted old backup: {}", key),
                Some(e) => error!("Failed to delete old backup {}: {}", key, e),
            }
        }
        Ok(())
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<()> {
        let host = self.host.clone();
        let port = self.port;
        let user = self.user.clone();
        let src = self.full_path(src_key);
        let dst = self.full_path(dst_key);
        let result = tokio::task::spawn_blocking(move || -> io::Result<()> {
            // SFTP has no server-side copy; stream the object back through
            // this host instead.
            let (_session, sftp) = Self::connect_blocking(&host, port, &user)?;
            if let Some(parent) = dst.parent() {
                Self::mkdir_all_blocking(&sftp, parent)?;
            }
            let mut remote_src = sftp.open(&src)?;
            let mut remote_dst = sftp.create(&dst)?;
            io::copy(&mut remote_src, &mut remote_dst)?;
            Ok(())
        })
        .await
        .map_err(|e| BackupError::Rotation(e.to_string()))?;
        result.map_err(|e| BackupError::Rotation(format!(
            "Couldn't create rotation copy of {}: {}",
            src_key, e
        )))?;
        Ok(())
    }
}
