// dbbackup/src/storage/mod.rs
use crate::backup::pipeline::DumpStream;
use crate::config::{Destination, DestinationConfig};
use crate::errors::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

pub mod local;
pub mod rsync;
pub mod s3;
pub mod sftp;

/// One listed file/object, as seen by a cleanup pass.
#[derive(Debug, Clone)]
pub struct BackupFileRecord {
    /// Bare file name, used for grouping by database.
    pub name: String,
    /// Full key/path within the backend, used for deletion.
    pub key: String,
    pub modified: DateTime<Utc>,
}

/// A configured upload target. Keys passed in are always relative to the
/// backend's configured base path; each implementation applies its own
/// prefix internally.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Stable identity for logs and rotation markers, e.g. `s3:endpoint/bucket`.
    fn id(&self) -> &str;

    /// Whether `put_stream` is available for this backend.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Uploads a local file under `key`.
    async fn put_file(&self, src: &Path, key: &str) -> Result<()>;

    /// Consumes a live dump stream and persists it under `key`.
    async fn put_stream(&self, stream: DumpStream, key: &str) -> Result<()> {
        drop(stream);
        Err(BackupError::Upload {
            destination: self.id().to_string(),
            message: format!("{} does not support streaming uploads", key),
        })
    }

    /// Lists files below `prefix`, recursing one level into per-database
    /// subdirectories where the backend organizes by table.
    async fn list(&self, prefix: &str) -> Result<Vec<BackupFileRecord>>;

    /// Deletes the given keys. Object-storage backends batch internally.
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Server-side copy used for rotation, so promotion into a retention
    /// bucket never re-uploads the dump.
    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<()>;
}

/// A backend together with its rotation/retention flag.
#[derive(Clone)]
pub struct BoundDestination {
    pub backend: Arc<dyn StorageBackend>,
    pub rotate: bool,
}

/// Builds backend instances for every configured destination. Fails fast on
/// backends that cannot even be constructed (bad credentials/config).
pub async fn build_destinations(destinations: &[Destination]) -> Result<Vec<BoundDestination>> {
    let mut bound = Vec::with_capacity(destinations.len());
    for dest in destinations {
        let backend: Arc<dyn StorageBackend> = match &dest.kind {
            DestinationConfig::S3 {
                endpoint,
                region,
                bucket,
                path,
                access_key,
                secret_key,
            } => Arc::new(
                s3::S3Backend::connect(
                    endpoint.clone(),
                    region.clone(),
                    bucket.clone(),
                    path.clone(),
                    access_key.clone(),
                    secret_key.clone(),
                )
                .await?,
            ),
            DestinationConfig::Sftp {
                host,
                port,
                user,
                path,
            } => Arc::new(sftp::SftpBackend::new(
                host.clone(),
                *port,
                user.clone(),
                path.clone(),
            )),
            DestinationConfig::Rsync {
                host,
                user,
                path,
                flags,
            } => Arc::new(rsync::RsyncBackend::new(
                host.clone(),
                user.clone(),
                path.clone(),
                flags.clone(),
            )),
            DestinationConfig::Local { path } => Arc::new(local::LocalBackend::new(path.clone())),
        };
        bound.push(BoundDestination {
            backend,
            rotate: dest.rotate,
        });
    }
    Ok(bound)
}

/// Streaming mode requires every destination to accept piped uploads.
pub fn all_support_streaming(destinations: &[BoundDestination]) -> bool {
    destinations.iter().all(|d| d.backend.supports_streaming())
}
