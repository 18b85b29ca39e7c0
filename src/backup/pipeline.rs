// dbbackup/src/backup/pipeline.rs
//
// Streaming mode: one dump subprocess feeds every configured destination at
// once, without materializing the artifact on local disk. Each destination
// gets its own unidirectional byte stream and its own outcome; one slow or
// broken destination never hides the others' results.
use crate::backup::dumper::Dumper;
use crate::errors::{BackupError, Result};
use crate::storage::StorageBackend;
use bytes::Bytes;
use log::{error, info};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

const CHANNEL_DEPTH: usize = 16;

/// Forwards every chunk the dump producer emits to all attached streams.
/// Dropping the writer is a clean EOF for every consumer; `fail` propagates
/// the dump error instead so consumers abort rather than persist a
/// truncated object.
pub struct FanoutWriter {
    senders: Vec<Option<mpsc::Sender<io::Result<Bytes>>>>,
}

impl FanoutWriter {
    /// Creates a writer fanned out to `n` independent streams.
    pub fn channels(n: usize) -> (FanoutWriter, Vec<DumpStream>) {
        let mut senders = Vec::with_capacity(n);
        let mut streams = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
            senders.push(Some(tx));
            streams.push(DumpStream { rx });
        }
        (FanoutWriter { senders }, streams)
    }

    /// Sends the chunk to every stream still being consumed. A consumer that
    /// already hung up (its upload failed early) is skipped from then on.
    pub async fn write_chunk(&mut self, chunk: Bytes) {
        for slot in self.senders.iter_mut() {
            if let Some(tx) = slot {
                if tx.send(Ok(chunk.clone())).await.is_err() {
                    *slot = None;
                }
            }
        }
    }

    /// Propagates a dump failure to every consumer and closes the streams.
    pub async fn fail(mut self, message: String) {
        for slot in self.senders.iter_mut() {
            if let Some(tx) = slot.take() {
                let _ = tx
                    .send(Err(io::Error::other(message.clone())))
                    .await;
            }
        }
    }
}

/// Consumer end of one fan-out stream.
pub struct DumpStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl DumpStream {
    /// Next chunk of dump output; `None` is clean EOF, `Some(Err(..))` means
    /// the producer failed and nothing should be persisted.
    pub async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        self.rx.recv().await
    }
}

/// Result of delivering one artifact to one destination.
#[derive(Debug)]
pub struct UploadOutcome {
    pub destination: String,
    pub result: Result<()>,
}

/// Dumps `db` once and uploads it to every destination concurrently under a
/// single per-database deadline.
///
/// Returns `Err` only for a dump failure (the whole database failed, upload
/// outcomes are moot). On dump success every destination's outcome is
/// reported: success, upload error, or timeout. The deadline is enforced
/// inside each upload task: a destination that stops draining its stream is
/// dropped when the deadline elapses, which also releases the producer's
/// blocked fan-out send instead of wedging the dump.
pub async fn stream_to_all(
    dumper: &dyn Dumper,
    db: &str,
    destinations: &[Arc<dyn StorageBackend>],
    key: &str,
    deadline: Duration,
) -> Result<Vec<UploadOutcome>> {
    let started = Instant::now();
    let expires_at = started + deadline;

    let (mut writer, streams) = FanoutWriter::channels(destinations.len());

    let mut handles = Vec::with_capacity(destinations.len());
    for (backend, stream) in destinations.iter().zip(streams) {
        let backend = Arc::clone(backend);
        let key = key.to_string();
        handles.push(tokio::spawn(async move {
            match timeout_at(expires_at, backend.put_stream(stream, &key)).await {
                Ok(result) => result,
                // Dropping the stream half-way unblocks the producer.
                Err(_) => Err(BackupError::Timeout(backend.id().to_string())),
            }
        }));
    }

    if let Err(e) = dumper.dump_to_stream(db, &mut writer).await {
        error!("Error during dump of {} - Error: {}", db, e);
        writer.fail(e.to_string()).await;
        // The database failed as a whole; individual upload outcomes are not
        // collected. Consumers unwind on the propagated stream error.
        return Err(e);
    }

    // Clean EOF for every consumer.
    drop(writer);

    let mut outcomes = Vec::with_capacity(destinations.len());
    for (i, mut handle) in handles.into_iter().enumerate() {
        let destination = destinations[i].id().to_string();
        let result = match timeout_at(expires_at, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(BackupError::Upload {
                destination: destination.clone(),
                message: format!("upload task panicked: {}", join_err),
            }),
            Err(_) => {
                // A task still alive past its own deadline is wedged inside
                // the backend; don't leave it uploading detached.
                handle.abort();
                Err(BackupError::Timeout(destination.clone()))
            }
        };
        match &result {
            Ok(()) => info!(
                "{}) {} - Successfully uploaded to {}",
                i + 1,
                db,
                destination
            ),
            Err(e) => error!("{}) {} - {}", i + 1, db, e),
        }
        outcomes.push(UploadOutcome {
            destination,
            result,
        });
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::dumper::DumpArtifact;
    use crate::storage::BackupFileRecord;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    struct ChunkDumper {
        chunks: Vec<&'static [u8]>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl Dumper for ChunkDumper {
        async fn list_databases(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn dump_to_file(&self, _db: &str, _dir: &Path, _name: &str) -> Result<DumpArtifact> {
            unimplemented!("not used in streaming tests")
        }

        async fn dump_to_stream(&self, _db: &str, sink: &mut FanoutWriter) -> Result<()> {
            for (i, chunk) in self.chunks.iter().enumerate() {
                if self.fail_after == Some(i) {
                    return Err(BackupError::Dump("pg_dump exited with status 1".into()));
                }
                sink.write_chunk(Bytes::from_static(chunk)).await;
            }
            Ok(())
        }

        fn streaming_extension(&self) -> &'static str {
            ".dump"
        }
    }

    enum Mode {
        Collect,
        FailImmediately,
        Stall,
        StallAfterFirst,
    }

    struct MockBackend {
        name: String,
        mode: Mode,
        received: Mutex<Vec<u8>>,
    }

    impl MockBackend {
        fn new(name: &str, mode: Mode) -> Arc<Self> {
            Arc::new(MockBackend {
                name: name.to_string(),
                mode,
                received: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StorageBackend for MockBackend {
        fn id(&self) -> &str {
            &self.name
        }

        fn supports_streaming(&self) -> bool {
            true
        }

        async fn put_stream(&self, mut stream: DumpStream, _key: &str) -> Result<()> {
            match self.mode {
                Mode::FailImmediately => {
                    return Err(BackupError::Upload {
                        destination: self.name.clone(),
                        message: "connection refused".into(),
                    });
                }
                Mode::Stall => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
                Mode::StallAfterFirst => {
                    let _ = stream.next_chunk().await;
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
                Mode::Collect => {
                    while let Some(chunk) = stream.next_chunk().await {
                        let chunk = chunk.map_err(|e| BackupError::Upload {
                            destination: self.name.clone(),
                            message: e.to_string(),
                        })?;
                        self.received.lock().unwrap().extend_from_slice(&chunk);
                    }
                    Ok(())
                }
            }
        }

        async fn put_file(&self, _src: &Path, _key: &str) -> Result<()> {
            unimplemented!()
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<BackupFileRecord>> {
            Ok(vec![])
        }

        async fn delete(&self, _keys: &[String]) -> Result<()> {
            Ok(())
        }

        async fn copy(&self, _src_key: &str, _dst_key: &str) -> Result<()> {
            Ok(())
        }
    }

    fn as_dyn(backends: Vec<Arc<MockBackend>>) -> Vec<Arc<dyn StorageBackend>> {
        backends
            .into_iter()
            .map(|b| b as Arc<dyn StorageBackend>)
            .collect()
    }

    #[tokio::test]
    async fn test_all_destinations_receive_identical_bytes() {
        let dumper = ChunkDumper {
            chunks: vec![b"PGDMP", b"payload-1", b"payload-2"],
            fail_after: None,
        };
        let b1 = MockBackend::new("dest-1", Mode::Collect);
        let b2 = MockBackend::new("dest-2", Mode::Collect);
        let dests = as_dyn(vec![Arc::clone(&b1), Arc::clone(&b2)]);

        let outcomes = stream_to_all(&dumper, "orders", &dests, "k", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert_eq!(&*b1.received.lock().unwrap(), b"PGDMPpayload-1payload-2");
        assert_eq!(
            &*b1.received.lock().unwrap(),
            &*b2.received.lock().unwrap()
        );
    }

    #[tokio::test]
    async fn test_one_failing_destination_does_not_affect_siblings() {
        let dumper = ChunkDumper {
            chunks: vec![b"chunk"],
            fail_after: None,
        };
        let b1 = MockBackend::new("dest-1", Mode::Collect);
        let b2 = MockBackend::new("dest-2", Mode::FailImmediately);
        let b3 = MockBackend::new("dest-3", Mode::Collect);
        let dests = as_dyn(vec![b1, b2, b3]);

        let outcomes = stream_to_all(&dumper, "orders", &dests, "k", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_err());
        assert!(outcomes[2].result.is_ok());
        assert_eq!(outcomes[1].destination, "dest-2");
    }

    #[tokio::test]
    async fn test_stalled_destination_reports_timeout_only_for_itself() {
        let dumper = ChunkDumper {
            chunks: vec![b"chunk"],
            fail_after: None,
        };
        let b1 = MockBackend::new("dest-1", Mode::Collect);
        let b2 = MockBackend::new("dest-2", Mode::Stall);
        let dests = as_dyn(vec![b1, b2]);

        let outcomes = stream_to_all(&dumper, "orders", &dests, "k", Duration::from_millis(200))
            .await
            .unwrap();
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(
            outcomes[1].result,
            Err(BackupError::Timeout(ref d)) if d == "dest-2"
        ));
    }

    #[tokio::test]
    async fn test_consumer_that_stops_draining_cannot_wedge_the_dump() {
        // Enough chunks to fill the stalled consumer's bounded channel and
        // block the producer mid-dump.
        let dumper = ChunkDumper {
            chunks: vec![b"chunk".as_slice(); CHANNEL_DEPTH + 8],
            fail_after: None,
        };
        let b1 = MockBackend::new("dest-1", Mode::StallAfterFirst);
        let b2 = MockBackend::new("dest-2", Mode::Collect);
        let dests = as_dyn(vec![b1, b2]);

        let outcomes = tokio::time::timeout(
            Duration::from_secs(3),
            stream_to_all(&dumper, "orders", &dests, "k", Duration::from_millis(200)),
        )
        .await
        .expect("deadline must unblock the pipeline")
        .unwrap();

        // Every destination still gets an outcome, with the stalled one
        // reported as the timeout it is.
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(
            outcomes[0].result,
            Err(BackupError::Timeout(ref d)) if d == "dest-1"
        ));
    }

    #[tokio::test]
    async fn test_dump_failure_fails_whole_database() {
        let dumper = ChunkDumper {
            chunks: vec![b"chunk-0", b"chunk-1"],
            fail_after: Some(1),
        };
        let b1 = MockBackend::new("dest-1", Mode::Collect);
        let dests = as_dyn(vec![b1]);

        let err = stream_to_all(&dumper, "orders", &dests, "k", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Dump(_)));
    }
}
