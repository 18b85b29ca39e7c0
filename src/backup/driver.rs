// dbbackup/src/backup/driver.rs
//
// Orchestrates one backup run: resolve the database list, dump and deliver
// each database to every destination, promote rotation copies, apply
// retention, and report the outcome. Databases are processed one at a time;
// concurrency lives inside the per-table dumps and the destination fan-out.
use crate::backup::cleanup;
use crate::backup::dumper::{self, Dumper};
use crate::backup::limiter;
use crate::backup::naming;
use crate::backup::pipeline;
use crate::backup::rotation::MarkerStore;
use crate::config::{Engine, JobConfig};
use crate::errors::Result;
use crate::notify::Notifier;
use crate::storage::{self, local::LocalBackend, BoundDestination, StorageBackend};
use chrono::{DateTime, Local};
use log::{error, info};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Outcome of a whole run. Every attempted database lands in exactly one of
/// the two partitions; the entry strings carry destination and error detail
/// for the notification summary.
#[derive(Debug, Default)]
pub struct RunReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    /// Bare database names that failed, for the retry pass.
    pub failed_dbs: Vec<String>,
}

impl RunReport {
    fn note_failed_db(&mut self, db: &str) {
        if !self.failed_dbs.iter().any(|d| d == db) {
            self.failed_dbs.push(db.to_string());
        }
    }
}

/// Entries are formatted `<db> to <destination>`; the first token is the
/// database they report on.
fn database_of_entry(entry: &str) -> &str {
    entry.split(' ').next().unwrap_or(entry)
}

/// What the hourly status reporter sees.
struct StatusBoard {
    app_start: Instant,
    current: Option<(String, Instant)>,
}

impl StatusBoard {
    fn describe(&self) -> String {
        let uptime = self.app_start.elapsed().as_secs();
        let mut message = format!("Uptime: {}s. ", uptime);
        match &self.current {
            Some((db, started)) => {
                message.push_str(&format!(
                    "Currently backing up: {} (started {}s ago).",
                    db,
                    started.elapsed().as_secs()
                ));
            }
            None => message.push_str("Currently idle."),
        }
        message
    }

    fn uptime_hours(&self) -> u64 {
        self.app_start.elapsed().as_secs() / 3600
    }
}

pub struct JobDriver {
    config: JobConfig,
    dumper: Arc<dyn Dumper>,
    destinations: Vec<BoundDestination>,
    markers: MarkerStore,
    notifier: Notifier,
    status: Arc<Mutex<StatusBoard>>,
}

impl JobDriver {
    /// Builds the driver with live backends. Fails fast on destinations that
    /// cannot even be constructed.
    pub async fn connect(config: JobConfig) -> Result<JobDriver> {
        limiter::init(config.max_concurrent_processes);
        let destinations = storage::build_destinations(&config.destinations).await?;
        let dumper = dumper::build_dumper(&config);
        Ok(Self::assemble(config, dumper, destinations))
    }

    pub fn assemble(
        config: JobConfig,
        dumper: Arc<dyn Dumper>,
        destinations: Vec<BoundDestination>,
    ) -> JobDriver {
        let markers = MarkerStore::new(config.rotation.state_file.clone());
        let notifier = Notifier::new(&config);
        JobDriver {
            config,
            dumper,
            destinations,
            markers,
            notifier,
            status: Arc::new(Mutex::new(StatusBoard {
                app_start: Instant::now(),
                current: None,
            })),
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Hourly heartbeat. Escalates to an alarm once the process has been
    /// alive longer than the configured limit, which usually means a run is
    /// wedged.
    pub fn spawn_status_reporter(&self) -> tokio::task::JoinHandle<()> {
        let status = Arc::clone(&self.status);
        let notifier = self.notifier.clone();
        let limit_hours = self.config.notify.uptime_alarm_hours;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            interval.tick().await;
            loop {
                interval.tick().await;
                let (message, uptime_hours) = {
                    let board = match status.lock() {
                        Ok(board) => board,
                        Err(_) => return,
                    };
                    (board.describe(), board.uptime_hours())
                };
                info!("Hourly Status: {}", message);
                if uptime_hours > limit_hours {
                    notifier.send_alarm(&message, true).await;
                }
            }
        })
    }

    fn set_current(&self, db: Option<&str>) {
        if let Ok(mut board) = self.status.lock() {
            board.current = db.map(|db| (db.to_string(), Instant::now()));
        }
    }

    /// Runs the job: one full pass, then at most one retry pass over the
    /// databases that failed, then the aggregated notification.
    pub async fn run(&self) -> RunReport {
        info!("Backup job started.");
        let mut report = self.run_pass(None).await;

        if self.config.retry_failed && !report.failed_dbs.is_empty() {
            info!(
                "Retrying {} failed database(s): {}",
                report.failed_dbs.len(),
                report.failed_dbs.join(", ")
            );
            let retry = self.run_pass(Some(report.failed_dbs.clone())).await;
            // Retry outcomes supersede the whole first pass for the retried
            // databases, including their partial per-destination successes;
            // otherwise a destination shows up twice in the summary.
            {
                let retried: HashSet<&str> =
                    report.failed_dbs.iter().map(String::as_str).collect();
                report
                    .succeeded
                    .retain(|entry| !retried.contains(database_of_entry(entry)));
            }
            report.succeeded.extend(retry.succeeded);
            report.failed = retry.failed;
            report.failed_dbs = retry.failed_dbs;
        }

        self.notifier
            .send_run_summary(&report.succeeded, &report.failed)
            .await;
        info!(
            "Backup job finished. {} succeeded, {} failed.",
            report.succeeded.len(),
            report.failed.len()
        );
        report
    }

    async fn run_pass(&self, only: Option<Vec<String>>) -> RunReport {
        let mut report = RunReport::default();
        let now = Local::now();

        let mut databases = match only {
            Some(dbs) => dbs,
            None if !self.config.databases.is_empty() => self.config.databases.clone(),
            None => {
                info!("Getting database list...");
                match self.dumper.list_databases().await {
                    Ok(dbs) => dbs,
                    Err(e) => {
                        error!("Couldn't get the list of databases - Error: {}", e);
                        self.notifier
                            .send_alarm(
                                &format!("Couldn't get the list of databases - Error: {}", e),
                                true,
                            )
                            .await;
                        report
                            .failed
                            .push(format!("Couldn't get the list of databases - Error: {}", e));
                        return report;
                    }
                }
            }
        };
        if !self.config.exclude.is_empty() {
            let excluded: HashSet<&str> =
                self.config.exclude.iter().map(String::as_str).collect();
            databases.retain(|db| !excluded.contains(db.as_str()));
        }

        let streaming = self.dumper.supports_streaming()
            && self.config.archive_pass.is_none()
            && !self.config.backup_as_tables
            && storage::all_support_streaming(&self.destinations);

        for db in &databases {
            self.set_current(Some(db));
            if streaming {
                self.back_up_streaming(db, now, &mut report).await;
            } else {
                self.back_up_buffered(db, now, &mut report).await;
            }
        }
        self.set_current(None);

        if self.config.rotation.keep.any_enabled() {
            self.apply_retention(streaming).await;
        }
        report
    }

    /// `mysql` is backed up as its grants table only, so its artifacts are
    /// named after what they contain.
    fn display_name(&self, db: &str) -> String {
        if db == "mysql" && self.config.engine == Engine::MySql {
            "mysql_users".to_string()
        } else {
            db.to_string()
        }
    }

    fn whole_db_name(&self, base: &str, now: DateTime<Local>) -> String {
        let rotation = &self.config.rotation;
        if rotation.enabled {
            naming::name_with_path(
                &naming::rotating_name(base, rotation.suffix, now),
                rotation.suffix,
                now,
            )
        } else {
            naming::timestamped_name(base, now)
        }
    }

    async fn back_up_streaming(&self, db: &str, now: DateTime<Local>, report: &mut RunReport) {
        info!("Backup started for {}", db);
        let base = self.display_name(db);
        let name = format!(
            "{}{}",
            self.whole_db_name(&base, now),
            self.dumper.streaming_extension()
        );
        let backends: Vec<Arc<dyn StorageBackend>> = self
            .destinations
            .iter()
            .map(|d| Arc::clone(&d.backend))
            .collect();
        let deadline = Duration::from_secs(self.config.timeout_hours * 3600);

        match pipeline::stream_to_all(&*self.dumper, db, &backends, &name, deadline).await {
            Err(e) => {
                report.failed.push(format!("{} - Dump Error: {}", db, e));
                report.note_failed_db(db);
            }
            Ok(outcomes) => {
                for (outcome, dest) in outcomes.iter().zip(&self.destinations) {
                    match &outcome.result {
                        Ok(()) => {
                            report
                                .succeeded
                                .push(format!("{} to {}", db, outcome.destination));
                            if dest.rotate {
                                self.promote_if_due(&base, dest, &name, now).await;
                            }
                        }
                        Err(e) => {
                            report
                                .failed
                                .push(format!("{} to {} - Error: {}", db, outcome.destination, e));
                            report.note_failed_db(db);
                        }
                    }
                }
            }
        }
    }

    async fn back_up_buffered(&self, db: &str, now: DateTime<Local>, report: &mut RunReport) {
        let dir = self.config.backup_destination.clone();
        let per_table = self.config.backup_as_tables
            && db != "mysql"
            && self.dumper.supports_table_dumps();

        let artifacts = if per_table {
            let rotation = self.config.rotation.clone();
            let db_owned = db.to_string();
            let name_for_table = move |table: &str| {
                let unit = format!("{}_{}", db_owned, table);
                if rotation.enabled {
                    naming::name_with_path(
                        &naming::rotating_table_name(&db_owned, &unit, rotation.suffix, now),
                        rotation.suffix,
                        now,
                    )
                } else {
                    naming::timestamped_table_name(&db_owned, &unit, now)
                }
            };
            let meta_name = if self.config.rotation.enabled {
                naming::name_with_path(
                    &format!("{}/{}.meta", db, db),
                    self.config.rotation.suffix,
                    now,
                )
            } else {
                format!(
                    "{}/{}/{}.meta",
                    now.format("%Y/%m"),
                    db,
                    db
                )
            };
            match self
                .dumper
                .dump_tables(db, &dir, &name_for_table, &meta_name)
                .await
            {
                Ok(artifacts) => artifacts,
                Err(e) => {
                    report.failed.push(format!("{} - Error: {}", db, e));
                    report.note_failed_db(db);
                    return;
                }
            }
        } else {
            let base = self.display_name(db);
            let name = self.whole_db_name(&base, now);
            match self.dumper.dump_to_file(db, &dir, &name).await {
                Ok(artifact) => vec![artifact],
                Err(e) => {
                    report.failed.push(format!("{} - Error: {}", db, e));
                    report.note_failed_db(db);
                    return;
                }
            }
        };

        for dest in &self.destinations {
            let backend = &dest.backend;
            let mut delivered = true;
            for artifact in &artifacts {
                if let Err(e) = backend.put_file(&artifact.path, &artifact.name).await {
                    report
                        .failed
                        .push(format!("{} to {} - Error: {}", db, backend.id(), e));
                    report.note_failed_db(db);
                    delivered = false;
                    break;
                }
            }
            if delivered {
                report.succeeded.push(format!("{} to {}", db, backend.id()));
                // Rotation promotion only tracks whole-database artifacts;
                // per-table layouts keep their history via retention alone.
                if dest.rotate && !per_table {
                    let base = self.display_name(db);
                    self.promote_if_due(&base, dest, &artifacts[0].name, now).await;
                }
            }
        }

        if self.config.remove_local {
            for artifact in &artifacts {
                match tokio::fs::remove_file(&artifact.path).await {
                    Ok(()) => info!(
                        "Dump file at {} successfully deleted.",
                        artifact.path.display()
                    ),
                    Err(e) => error!(
                        "Couldn't delete dump file at {} - Error: {}",
                        artifact.path.display(),
                        e
                    ),
                }
            }
        }
    }

    /// Creates the Weekly/Monthly rotation copy when the pair's 23-hour
    /// marker window has lapsed on a boundary day. Promotion troubles are
    /// logged, not failed: the primary upload already succeeded.
    async fn promote_if_due(
        &self,
        db: &str,
        dest: &BoundDestination,
        uploaded_key: &str,
        now: DateTime<Local>,
    ) {
        let rotation = &self.config.rotation;
        if !rotation.enabled {
            return;
        }
        let backend = &dest.backend;
        let Some(bucket) = self
            .markers
            .rotate_at(db, backend.id(), rotation.period, now)
        else {
            return;
        };
        let target = format!("{}{}", bucket, naming::extension_suffix(uploaded_key));
        match backend.copy(uploaded_key, &target).await {
            Ok(()) => {
                info!(
                    "Successfully created a copy of {} for rotation at {}",
                    uploaded_key, target
                );
                if let Err(e) = self.markers.update_rotated_timestamp_at(db, backend.id(), now) {
                    error!("Failed to update rotated timestamp: {}", e);
                }
            }
            Err(e) => error!(
                "Couldn't create rotation copy of {} at {} - Error: {}",
                uploaded_key, target, e
            ),
        }
    }

    /// Retention pass over every rotating destination, plus the local
    /// staging directory when dumps are kept around.
    async fn apply_retention(&self, streaming: bool) {
        if !self.config.rotation.enabled {
            return;
        }
        let keep = &self.config.rotation.keep;
        for dest in &self.destinations {
            if !dest.rotate {
                continue;
            }
            if let Err(e) = cleanup::run_cleanup(&*dest.backend, keep).await {
                error!("Error during cleanup on {}: {}", dest.backend.id(), e);
            }
        }
        if !streaming && !self.config.remove_local {
            let local = LocalBackend::new(self.config.backup_destination.clone());
            if let Err(e) = cleanup::run_cleanup(&local, keep).await {
                error!("Error during local cleanup: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::dumper::DumpArtifact;
    use crate::backup::pipeline::DumpStream;
    use crate::config::build_job_config;
    use crate::errors::BackupError;
    use crate::storage::BackupFileRecord;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;

    /// Fails the configured databases for their first N attempts.
    struct FlakyDumper {
        fail_first: HashMap<String, usize>,
        attempts: Mutex<HashMap<String, usize>>,
    }

    impl FlakyDumper {
        fn new(fail_first: &[(&str, usize)]) -> Arc<Self> {
            Arc::new(FlakyDumper {
                fail_first: fail_first
                    .iter()
                    .map(|(db, n)| (db.to_string(), *n))
                    .collect(),
                attempts: Mutex::new(HashMap::new()),
            })
        }

        fn attempt(&self, db: &str) -> usize {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(db.to_string()).or_insert(0);
            *count += 1;
            *count
        }

        fn attempts_for(&self, db: &str) -> usize {
            *self.attempts.lock().unwrap().get(db).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl Dumper for FlakyDumper {
        async fn list_databases(&self) -> crate::errors::Result<Vec<String>> {
            Ok(vec!["alpha".into(), "beta".into(), "gamma".into()])
        }

        async fn dump_to_file(
            &self,
            db: &str,
            _dir: &Path,
            name: &str,
        ) -> crate::errors::Result<DumpArtifact> {
            let attempt = self.attempt(db);
            if attempt <= self.fail_first.get(db).copied().unwrap_or(0) {
                return Err(BackupError::Dump("pg_dump exited with status 1".to_string()));
            }
            Ok(DumpArtifact {
                path: Path::new("/tmp").join(db),
                name: format!("{}.dump", name),
            })
        }
    }

    struct RecordingBackend {
        name: String,
        uploads: Mutex<Vec<String>>,
        fail_once_matching: Option<String>,
        tripped: Mutex<bool>,
    }

    impl RecordingBackend {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(RecordingBackend {
                name: name.to_string(),
                uploads: Mutex::new(Vec::new()),
                fail_once_matching: None,
                tripped: Mutex::new(false),
            })
        }

        /// Rejects the first upload whose key contains `pattern`.
        fn failing_once(name: &str, pattern: &str) -> Arc<Self> {
            Arc::new(RecordingBackend {
                name: name.to_string(),
                uploads: Mutex::new(Vec::new()),
                fail_once_matching: Some(pattern.to_string()),
                tripped: Mutex::new(false),
            })
        }
    }

    #[async_trait]
    impl StorageBackend for RecordingBackend {
        fn id(&self) -> &str {
            &self.name
        }

        async fn put_file(&self, _src: &Path, key: &str) -> crate::errors::Result<()> {
            if let Some(pattern) = &self.fail_once_matching {
                if key.contains(pattern.as_str()) {
                    let mut tripped = self.tripped.lock().unwrap();
                    if !*tripped {
                        *tripped = true;
                        return Err(BackupError::Upload {
                            destination: self.name.clone(),
                            message: "connection reset by peer".to_string(),
                        });
                    }
                }
            }
            self.uploads.lock().unwrap().push(key.to_string());
            Ok(())
        }

        async fn put_stream(&self, _stream: DumpStream, _key: &str) -> crate::errors::Result<()> {
            unimplemented!()
        }

        async fn list(&self, _prefix: &str) -> crate::errors::Result<Vec<BackupFileRecord>> {
            Ok(vec![])
        }

        async fn delete(&self, _keys: &[String]) -> crate::errors::Result<()> {
            Ok(())
        }

        async fn copy(&self, _src_key: &str, _dst_key: &str) -> crate::errors::Result<()> {
            Ok(())
        }
    }

    fn test_config(databases: &[&str], retry: bool) -> JobConfig {
        let raw = serde_json::from_str(&format!(
            r#"{{
                "databases": {},
                "retry_failed": {},
                "backup_destination": "/tmp/dbbackup-test",
                "destinations": [{{"type": "local", "path": "/mnt/unused"}}]
            }}"#,
            serde_json::to_string(databases).unwrap(),
            retry
        ))
        .unwrap();
        build_job_config(raw).unwrap()
    }

    fn driver_with(
        config: JobConfig,
        dumper: Arc<dyn Dumper>,
        backend: Arc<RecordingBackend>,
    ) -> JobDriver {
        JobDriver::assemble(
            config,
            dumper,
            vec![BoundDestination {
                backend,
                rotate: true,
            }],
        )
    }

    fn db_of(entry: &str) -> &str {
        entry.split(' ').next().unwrap()
    }

    #[tokio::test]
    async fn test_partition_without_retry() {
        let dumper = FlakyDumper::new(&[("beta", 1)]);
        let backend = RecordingBackend::new("dest-1");
        let driver = driver_with(
            test_config(&["alpha", "beta", "gamma"], false),
            dumper.clone(),
            backend.clone(),
        );

        let report = driver.run().await;
        let succeeded: Vec<_> = report.succeeded.iter().map(|e| db_of(e)).collect();
        assert_eq!(succeeded, vec!["alpha", "gamma"]);
        assert_eq!(report.failed_dbs, vec!["beta"]);
        // Every attempted database is in exactly one partition.
        for db in ["alpha", "beta", "gamma"] {
            let in_success = succeeded.contains(&db);
            let in_failure = report.failed_dbs.iter().any(|d| d == db);
            assert!(in_success != in_failure, "{} must be in exactly one", db);
        }
        assert_eq!(backend.uploads.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_pass_only_covers_failed_databases() {
        let dumper = FlakyDumper::new(&[("beta", 1)]);
        let backend = RecordingBackend::new("dest-1");
        let driver = driver_with(
            test_config(&["alpha", "beta", "gamma"], true),
            dumper.clone(),
            backend.clone(),
        );

        let report = driver.run().await;
        assert!(report.failed.is_empty());
        assert!(report.failed_dbs.is_empty());
        let succeeded: Vec<_> = report.succeeded.iter().map(|e| db_of(e)).collect();
        assert!(succeeded.contains(&"beta"));
        // The healthy databases were not re-dumped by the retry pass.
        assert_eq!(dumper.attempts_for("alpha"), 1);
        assert_eq!(dumper.attempts_for("gamma"), 1);
        assert_eq!(dumper.attempts_for("beta"), 2);
    }

    #[tokio::test]
    async fn test_retry_does_not_duplicate_partial_successes() {
        // beta reaches dest-1 on the first pass but loses dest-2; the retry
        // re-delivers beta everywhere, and the summary must list each
        // (database, destination) pair once.
        let dumper = FlakyDumper::new(&[]);
        let b1 = RecordingBackend::new("dest-1");
        let b2 = RecordingBackend::failing_once("dest-2", "beta");
        let driver = JobDriver::assemble(
            test_config(&["alpha", "beta"], true),
            dumper.clone(),
            vec![
                BoundDestination {
                    backend: b1.clone(),
                    rotate: true,
                },
                BoundDestination {
                    backend: b2.clone(),
                    rotate: true,
                },
            ],
        );

        let report = driver.run().await;
        assert!(report.failed.is_empty());
        assert!(report.failed_dbs.is_empty());
        assert_eq!(report.succeeded.len(), 4);
        let beta_on_dest1 = report
            .succeeded
            .iter()
            .filter(|entry| entry.as_str() == "beta to dest-1")
            .count();
        assert_eq!(beta_on_dest1, 1);
    }

    #[tokio::test]
    async fn test_persistent_failure_survives_retry() {
        let dumper = FlakyDumper::new(&[("beta", 2)]);
        let backend = RecordingBackend::new("dest-1");
        let driver = driver_with(
            test_config(&["alpha", "beta"], true),
            dumper.clone(),
            backend.clone(),
        );

        let report = driver.run().await;
        assert_eq!(report.failed_dbs, vec!["beta"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(dumper.attempts_for("beta"), 2);
    }

    #[tokio::test]
    async fn test_exclusion_filters_discovered_databases() {
        let dumper = FlakyDumper::new(&[]);
        let backend = RecordingBackend::new("dest-1");
        let mut config = test_config(&[], false);
        config.exclude = vec!["beta".to_string()];
        let driver = driver_with(config, dumper.clone(), backend.clone());

        let report = driver.run().await;
        let succeeded: Vec<_> = report.succeeded.iter().map(|e| db_of(e)).collect();
        assert_eq!(succeeded, vec!["alpha", "gamma"]);
        assert_eq!(dumper.attempts_for("beta"), 0);
    }
}
