// dbbackup/src/storage/s3.rs
use crate::backup::pipeline::DumpStream;
use crate::errors::{BackupError, Result};
use crate::storage::{BackupFileRecord, StorageBackend};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytes::{Bytes, BytesMut};
use chrono::{TimeZone, Utc};
use log::{info, warn};
use s3::config::Region;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use std::path::Path;

/// Multipart part size for streaming uploads. S3 requires every part except
/// the last to be at least 5 MiB.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// S3's DeleteObjects call accepts at most this many keys per request.
const DELETE_BATCH_SIZE: usize = 1000;

pub struct S3Backend {
    client: s3::Client,
    bucket: String,
    prefix: Option<String>,
    id: String,
}

impl S3Backend {
    pub async fn connect(
        endpoint: Option<String>,
        region: String,
        bucket: String,
        prefix: Option<String>,
        access_key: String,
        secret_key: String,
    ) -> Result<Self> {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(s3::config::Credentials::new(
                access_key, secret_key, None, None, "Static",
            ));
        if let Some(url) = &endpoint {
            loader = loader.endpoint_url(url);
        }
        let sdk_config = loader.load().await;

        // Path-style addressing keeps custom endpoints (MinIO and friends)
        // working without virtual-host DNS.
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();
        let client = s3::Client::from_conf(s3_config);

        let id = format!(
            "s3:{}/{}",
            endpoint.as_deref().unwrap_or("aws"),
            bucket
        );
        Ok(S3Backend {
            client,
            bucket,
            prefix,
            id,
        })
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
            None => key.to_string(),
        }
    }

    fn upload_error(&self, message: impl std::fmt::Display) -> BackupError {
        BackupError::Upload {
            destination: self.id.clone(),
            message: message.to_string(),
        }
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        if let Err(e) = result {
            warn!(
                "Couldn't abort multipart upload for {} - Error: {}",
                key, e
            );
        }
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart> {
        let part = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| self.upload_error(e))?;
        Ok(CompletedPart::builder()
            .part_number(part_number)
            .set_e_tag(part.e_tag().map(str::to_string))
            .build())
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn put_file(&self, src: &Path, key: &str) -> Result<()> {
        let key = self.full_key(key);
        let body = ByteStream::from_path(src).await.map_err(|e| {
            self.upload_error(format!(
                "Couldn't open file {} to read: {}",
                src.display(),
                e
            ))
        })?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| self.upload_error(e))?;
        info!(
            "Successfully uploaded {} to bucket {} key {}",
            src.display(),
            self.bucket,
            key
        );
        Ok(())
    }

    async fn put_stream(&self, mut stream: DumpStream, key: &str) -> Result<()> {
        let key = self.full_key(key);
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| self.upload_error(e))?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| self.upload_error("missing multipart upload id"))?
            .to_string();

        let mut parts: Vec<CompletedPart> = Vec::new();
        let mut buf = BytesMut::with_capacity(PART_SIZE);
        let mut part_number = 1;

        loop {
            match stream.next_chunk().await {
                Some(Ok(chunk)) => {
                    buf.extend_from_slice(&chunk);
                    if buf.len() >= PART_SIZE {
                        let body = buf.split().freeze();
                        match self.upload_part(&key, &upload_id, part_number, body).await {
                            Ok(part) => parts.push(part),
                            Err(e) => {
                                self.abort_multipart(&key, &upload_id).await;
                                return Err(e);
                            }
                        }
                        part_number += 1;
                    }
                }
                Some(Err(e)) => {
                    // The dump producer failed; nothing may be persisted.
                    self.abort_multipart(&key, &upload_id).await;
                    return Err(self.upload_error(format!("dump stream failed: {}", e)));
                }
                None => break,
            }
        }

        if !buf.is_empty() || parts.is_empty() {
            let body = buf.split().freeze();
            match self.upload_part(&key, &upload_id, part_number, body).await {
                Ok(part) => parts.push(part),
                Err(e) => {
                    self.abort_multipart(&key, &upload_id).await;
                    return Err(e);
                }
            }
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| self.upload_error(e))?;
        info!(
            "Successfully uploaded stream to bucket {} key {}",
            self.bucket, key
        );
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BackupFileRecord>> {
        let full_prefix = self.full_key(prefix);
        let mut records = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&full_prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| BackupError::Cleanup(e.to_string()))?;
            for obj in page.contents() {
                let (Some(key), Some(modified)) = (obj.key(), obj.last_modified()) else {
                    continue;
                };
                let name = key.rsplit('/').next().unwrap_or(key).to_string();
                let modified = Utc
                    .timestamp_opt(modified.secs(), modified.subsec_nanos())
                    .single()
                    .unwrap_or_default();
                records.push(BackupFileRecord {
                    name,
                    key: key.to_string(),
                    modified,
                });
            }
        }
        Ok(records)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            let objects = batch
                .iter()
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|e| BackupError::Cleanup(e.to_string()))
                })
                .collect::<Result<Vec<_>>>()?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| BackupError::Cleanup(e.to_string()))?;
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| BackupError::Cleanup(e.to_string()))?;
            info!(
                "Deleted {} old backups from bucket {}",
                batch.len(),
                self.bucket
            );
        }
        Ok(())
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<()> {
        let src = self.full_key(src_key);
        let dst = self.full_key(dst_key);
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, src))
            .key(&dst)
            .send()
            .await
            .map_err(|e| BackupError::Rotation(format!(
                "Couldn't create copy of {} at {}: {}",
                src, dst, e
            )))?;
        Ok(())
    }
}
