// dbbackup/src/storage/local.rs
use crate::errors::{BackupError, Result};
use crate::storage::{BackupFileRecord, StorageBackend};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info};
use std::path::{Path, PathBuf};
use tokio::fs;

pub struct LocalBackend {
    base: PathBuf,
    id: String,
}

impl LocalBackend {
    pub fn new(base: PathBuf) -> Self {
        let id = format!("local:{}", base.display());
        LocalBackend { base, id }
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base.join(key)
    }

    async fn record_for(path: &Path) -> Option<BackupFileRecord> {
        let meta = fs::metadata(path).await.ok()?;
        let modified: DateTime<Utc> = meta.modified().ok()?.into();
        Some(BackupFileRecord {
            name: path.file_name()?.to_string_lossy().into_owned(),
            key: path.to_string_lossy().into_owned(),
            modified,
        })
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn put_file(&self, src: &Path, key: &str) -> Result<()> {
        let dst = self.full_path(key);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(src, &dst).await.map_err(|e| BackupError::Upload {
            destination: self.id.clone(),
            message: format!(
                "Couldn't copy {} to {}: {}",
                src.display(),
                dst.display(),
                e
            ),
        })?;
        info!(
            "Successfully copied {} to {}",
            src.display(),
            dst.display()
        );
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BackupFileRecord>> {
        let root = self.full_path(prefix);
        let mut records = Vec::new();
        let mut entries = match fs::read_dir(&root).await {
            Ok(entries) => entries,
            // A bucket directory that was never written is simply empty.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(BackupError::Cleanup(e.to_string())),
        };

        let mut subdirs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackupError::Cleanup(e.to_string()))?
        {
            let path = entry.path();
            if path.is_dir() {
                subdirs.push(path);
            } else if let Some(record) = Self::record_for(&path).await {
                records.push(record);
            }
        }

        // One level of recursion for per-table layouts (<bucket>/<db>/...).
        for subdir in subdirs {
            let Ok(mut sub_entries) = fs::read_dir(&subdir).await else {
                continue;
            };
            while let Ok(Some(entry)) = sub_entries.next_entry().await {
                let path = entry.path();
                if path.is_dir() {
                    continue;
                }
                if let Some(record) = Self::record_for(&path).await {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        // Best effort per entry: one stubborn file must not keep the rest of
        // the batch alive.
        for key in keys {
            match fs::remove_file(key).await {
                Ok(()) => info!("Deleted old local backup: {}", key),
                Err(e) => error!("Failed to delete old local backup {}: {}", key, e),
            }
        }
        Ok(())
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<()> {
        let src = self.full_path(src_key);
        let dst = self.full_path(dst_key);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&src, &dst)
            .await
            .map_err(|e| BackupError::Rotation(format!(
                "Couldn't create copy of {} at {}: {}",
                src.display(),
                dst.display(),
                e
            )))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_list_and_copy() {
        let staging = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let backend = LocalBackend::new(target.path().to_path_buf());

        let src = staging.path().join("orders-Mon.sql.gz");
        std::fs::write(&src, b"dump bytes").unwrap();

        backend
            .put_file(&src, "Daily/Mon/orders-Mon.sql.gz")
            .await
            .unwrap();
        backend
            .copy("Daily/Mon/orders-Mon.sql.gz", "Weekly/orders-week_36.sql.gz")
            .await
            .unwrap();

        let daily = backend.list("Daily").await.unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].name, "orders-Mon.sql.gz");

        let weekly = backend.list("Weekly").await.unwrap();
        assert_eq!(weekly.len(), 1);

        backend
            .delete(&[daily[0].key.clone()])
            .await
            .unwrap();
        assert!(backend.list("Daily").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_recurses_one_level() {
        let target = TempDir::new().unwrap();
        let backend = LocalBackend::new(target.path().to_path_buf());
        let nested = target.path().join("Daily/orders");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("orders_items-Mon.sql.gz"), b"x").unwrap();
        std::fs::write(target.path().join("Daily/billing-Mon.sql.gz"), b"y").unwrap();

        let records = backend.list("Daily").await.unwrap();
        let mut names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["billing-Mon.sql.gz", "orders_items-Mon.sql.gz"]);
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let target = TempDir::new().unwrap();
        let backend = LocalBackend::new(target.path().to_path_buf());
        assert!(backend.list("Monthly").await.unwrap().is_empty());
    }
}
