// dbbackup/src/backup/dumper.rs
use crate::backup::pipeline::FanoutWriter;
use crate::config::{Engine, JobConfig};
use crate::errors::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

pub mod mssql;
pub mod mysql;
pub mod postgres;

/// mysqldump prints this to stderr on every password-authenticated run.
const PASSWORD_WARNING: &str =
    "[Warning] Using a password on the command line interface can be insecure.";

const STREAM_CHUNK: usize = 64 * 1024;

/// One dump file produced on local disk, together with the
/// destination-relative name it should be uploaded under.
#[derive(Debug, Clone)]
pub struct DumpArtifact {
    pub path: PathBuf,
    pub name: String,
}

/// Engine-specific dump behavior. `dump_to_file` is the buffered path every
/// engine supports; streaming and per-table dumps are opt-in.
#[async_trait]
pub trait Dumper: Send + Sync {
    /// All databases on the server worth backing up (system databases
    /// already filtered out).
    async fn list_databases(&self) -> Result<Vec<String>>;

    /// Dumps `db` into `dir`, deriving the file name from the
    /// destination-relative base `name` plus the engine's extension.
    async fn dump_to_file(&self, db: &str, dir: &Path, name: &str) -> Result<DumpArtifact>;

    /// Dumps `db` straight into the fan-out sink without touching disk.
    async fn dump_to_stream(&self, db: &str, sink: &mut FanoutWriter) -> Result<()> {
        let _ = sink;
        Err(BackupError::Dump(format!(
            "streaming dump of {} is not supported for this engine",
            db
        )))
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Extension a streamed dump is stored under.
    fn streaming_extension(&self) -> &'static str {
        ".dump"
    }

    /// Dumps every table of `db` as its own artifact. `name_for_table` maps
    /// a table to its destination-relative base name; `meta_name` is where
    /// the database's charset/collation sidecar goes.
    async fn dump_tables(
        &self,
        db: &str,
        dir: &Path,
        name_for_table: &(dyn for<'a> Fn(&'a str) -> String + Send + Sync),
        meta_name: &str,
    ) -> Result<Vec<DumpArtifact>> {
        let _ = (dir, name_for_table, meta_name);
        Err(BackupError::Dump(format!(
            "per-table dump of {} is not supported for this engine",
            db
        )))
    }

    fn supports_table_dumps(&self) -> bool {
        false
    }
}

/// Picks the dumper for the configured engine.
pub fn build_dumper(config: &JobConfig) -> Arc<dyn Dumper> {
    match config.engine {
        Engine::Postgres => Arc::new(postgres::PostgresDumper::new(config)),
        Engine::MySql => Arc::new(mysql::MySqlDumper::new(config)),
        Engine::MsSql => Arc::new(mssql::MsSqlDumper::new(config)),
    }
}

/// Drops stderr lines that are pure noise (the mysqldump password warning)
/// and returns whatever remains.
pub(crate) fn meaningful_stderr(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let lines: Vec<&str> = text
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.contains(PASSWORD_WARNING))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Reaps the child and turns a non-zero exit (or, with `strict_stderr`, any
/// unexplained stderr output) into a dump error. Children are always waited
/// on so no zombie is left behind.
pub(crate) async fn finish_child(child: Child, label: &str, strict_stderr: bool) -> Result<()> {
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| BackupError::Dump(format!("Couldn't wait for {}: {}", label, e)))?;
    let stderr = meaningful_stderr(&output.stderr);
    if !output.status.success() {
        return Err(BackupError::Dump(format!(
            "{} exited with {}: {}",
            label,
            output.status,
            stderr.unwrap_or_default()
        )));
    }
    if strict_stderr {
        if let Some(stderr) = stderr {
            return Err(BackupError::Dump(format!("{}: {}", label, stderr)));
        }
    }
    Ok(())
}

pub(crate) fn spawn_piped(mut cmd: Command, label: &str) -> Result<Child> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BackupError::Dump(format!("Couldn't start {}: {}", label, e)))
}

/// Hands one child's stdout to another child as its stdin, by file
/// descriptor, so the bytes never pass through this process.
pub(crate) fn stdout_to_stdin(stdout: tokio::process::ChildStdout) -> Result<Stdio> {
    let fd = stdout
        .into_owned_fd()
        .map_err(|e| BackupError::Compression(format!("Couldn't wire child stdout: {}", e)))?;
    Ok(Stdio::from(fd))
}

/// Forwards a dump subprocess's stdout into the fan-out sink, optionally
/// gzip-compressing on the way through, then reaps the child.
pub(crate) async fn stream_stdout(
    mut child: Child,
    sink: &mut FanoutWriter,
    label: &str,
    compress: bool,
    strict_stderr: bool,
) -> Result<()> {
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| BackupError::Dump(format!("{} has no stdout pipe", label)))?;
    let mut buf = vec![0u8; STREAM_CHUNK];

    if compress {
        let mut encoder = GzEncoder::new(Vec::with_capacity(STREAM_CHUNK), Compression::default());
        loop {
            let n = stdout
                .read(&mut buf)
                .await
                .map_err(|e| BackupError::Dump(format!("{}: {}", label, e)))?;
            if n == 0 {
                break;
            }
            encoder
                .write_all(&buf[..n])
                .map_err(|e| BackupError::Compression(e.to_string()))?;
            if encoder.get_ref().len() >= STREAM_CHUNK {
                let compressed = std::mem::take(encoder.get_mut());
                sink.write_chunk(Bytes::from(compressed)).await;
            }
        }
        let tail = encoder
            .finish()
            .map_err(|e| BackupError::Compression(e.to_string()))?;
        if !tail.is_empty() {
            sink.write_chunk(Bytes::from(tail)).await;
        }
    } else {
        loop {
            let n = stdout
                .read(&mut buf)
                .await
                .map_err(|e| BackupError::Dump(format!("{}: {}", label, e)))?;
            if n == 0 {
                break;
            }
            sink.write_chunk(Bytes::copy_from_slice(&buf[..n])).await;
        }
    }

    finish_child(child, label, strict_stderr).await
}

/// Pipes a dump subprocess's stdout into `7z a -si <dump_path>`, waiting on
/// both children. `store_only` skips re-compression for dump formats that
/// are already compressed.
pub(crate) async fn pipe_into_seven_zip(
    mut producer: Child,
    dump_path: &Path,
    passphrase: Option<&str>,
    store_only: bool,
    label: &str,
    strict_stderr: bool,
) -> Result<()> {
    let stdout = producer
        .stdout
        .take()
        .ok_or_else(|| BackupError::Dump(format!("{} has no stdout pipe", label)))?;
    let stdin = stdout_to_stdin(stdout)?;

    let mut cmd = Command::new("7z");
    cmd.arg("a").arg("-t7z");
    if store_only {
        cmd.arg("-mx0");
    } else {
        cmd.arg("-ms=on");
    }
    if let Some(pass) = passphrase {
        cmd.arg("-mhe=on");
        cmd.arg(format!("-p{}", pass));
    }
    cmd.arg("-si").arg(dump_path);
    cmd.stdin(stdin).stdout(Stdio::null()).stderr(Stdio::piped());
    let archiver = cmd
        .spawn()
        .map_err(|e| BackupError::Compression(format!("Couldn't start 7z: {}", e)))?;

    let archive_result = archiver
        .wait_with_output()
        .await
        .map_err(|e| BackupError::Compression(format!("Couldn't wait for 7z: {}", e)))?;
    // The producer is reaped even when 7z already failed.
    let producer_result = finish_child(producer, label, strict_stderr).await;
    if !archive_result.status.success() {
        return Err(BackupError::Compression(format!(
            "7z exited with {}: {}",
            archive_result.status,
            String::from_utf8_lossy(&archive_result.stderr).trim()
        )));
    }
    producer_result
}

pub(crate) async fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            BackupError::Dump(format!(
                "Couldn't create parent directories at backup destination {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    Ok(())
}
