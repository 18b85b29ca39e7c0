// dbbackup/src/backup/rotation.rs
use crate::backup::naming;
use crate::config::RotationPeriod;
use crate::errors::{BackupError, Result};
use chrono::{DateTime, Datelike, Duration, Local};
use log::{info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

/// The job may fire at a slightly different wall-clock time each day, so the
/// rotation window is 23 hours rather than 24: up to an hour of scheduling
/// drift still yields at most one rotation per calendar boundary.
const ROTATION_WINDOW_HOURS: i64 = 23;

/// Durable record of the last successful rotation per (database, destination)
/// pair. Persisted as a single JSON document so it survives process restarts;
/// the read-then-write per pair is not atomic, which is acceptable because a
/// collision only produces a duplicate rotation copy.
pub struct MarkerStore {
    path: PathBuf,
}

impl MarkerStore {
    pub fn new(path: PathBuf) -> Self {
        MarkerStore { path }
    }

    fn marker_key(db: &str, destination_id: &str) -> String {
        format!("{}@{}", db, destination_id)
    }

    fn load(&self) -> HashMap<String, String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(
                    "Rotation state file {} is not valid JSON, starting fresh: {}",
                    self.path.display(),
                    e
                );
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }

    fn save(&self, markers: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BackupError::Rotation(format!("Couldn't create {}: {}", parent.display(), e)))?;
        }
        let content = serde_json::to_string_pretty(markers)?;
        fs::write(&self.path, content)
            .map_err(|e| BackupError::Rotation(format!("Couldn't write rotation state: {}", e)))?;
        Ok(())
    }

    /// Returns the persisted last-rotation time for the pair, if any.
    pub fn last_rotated_at(&self, db: &str, destination_id: &str) -> Option<DateTime<Local>> {
        let markers = self.load();
        let raw = markers.get(&Self::marker_key(db, destination_id))?;
        match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => Some(ts.with_timezone(&Local)),
            Err(e) => {
                info!("Failed to parse rotated timestamp for {}: {}", db, e);
                None
            }
        }
    }

    /// True when the pair was rotated within the current 23-hour window. An
    /// absent or unreadable marker counts as not rotated.
    pub fn is_rotated_at(&self, db: &str, destination_id: &str, now: DateTime<Local>) -> bool {
        match self.last_rotated_at(db, destination_id) {
            Some(ts) => ts + Duration::hours(ROTATION_WINDOW_HOURS) > now,
            None => false,
        }
    }

    /// Decides whether a rotation copy is due for the pair and, if so,
    /// returns the bucket-relative target path (extension-less).
    pub fn rotate_at(
        &self,
        db: &str,
        destination_id: &str,
        period: Option<RotationPeriod>,
        now: DateTime<Local>,
    ) -> Option<String> {
        if self.is_rotated_at(db, destination_id, now) {
            return None;
        }
        match period? {
            RotationPeriod::Month => {
                // First day of a new month: yesterday belonged to another one.
                let yesterday = now - Duration::days(1);
                if yesterday.month() != now.month() {
                    Some(naming::monthly_bucket(db, now))
                } else {
                    None
                }
            }
            RotationPeriod::Week => {
                if now.weekday() == chrono::Weekday::Mon {
                    Some(naming::weekly_bucket(db, now))
                } else {
                    None
                }
            }
        }
    }

    /// Persists `now` for the pair. Called only after the rotation copy has
    /// actually succeeded.
    pub fn update_rotated_timestamp_at(
        &self,
        db: &str,
        destination_id: &str,
        now: DateTime<Local>,
    ) -> Result<()> {
        let mut markers = self.load();
        markers.insert(Self::marker_key(db, destination_id), now.to_rfc3339());
        self.save(&markers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn store() -> (TempDir, MarkerStore) {
        let dir = TempDir::new().unwrap();
        let store = MarkerStore::new(dir.path().join("rotation-state.json"));
        (dir, store)
    }

    fn monday() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 9, 2, 3, 0, 0).unwrap()
    }

    fn first_of_month() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 9, 1, 3, 0, 0).unwrap()
    }

    #[test]
    fn test_weekly_boundary_rotates_with_iso_week() {
        let (_dir, store) = store();
        let target = store.rotate_at("orders", "s3:bucket", Some(RotationPeriod::Week), monday());
        assert_eq!(target.as_deref(), Some("Weekly/orders-week_36"));
    }

    #[test]
    fn test_no_rotation_midweek() {
        let (_dir, store) = store();
        let wednesday = Local.with_ymd_and_hms(2024, 9, 4, 3, 0, 0).unwrap();
        assert_eq!(
            store.rotate_at("orders", "s3:bucket", Some(RotationPeriod::Week), wednesday),
            None
        );
    }

    #[test]
    fn test_monthly_boundary() {
        let (_dir, store) = store();
        let target = store.rotate_at("orders", "s3:bucket", Some(RotationPeriod::Month), first_of_month());
        assert_eq!(target.as_deref(), Some("Monthly/orders-Sep"));

        let mid_month = Local.with_ymd_and_hms(2024, 9, 15, 3, 0, 0).unwrap();
        assert_eq!(
            store.rotate_at("orders", "s3:bucket", Some(RotationPeriod::Month), mid_month),
            None
        );
    }

    #[test]
    fn test_rotation_is_idempotent_within_window() {
        let (_dir, store) = store();
        let now = monday();
        assert!(store.rotate_at("orders", "s3:bucket", Some(RotationPeriod::Week), now).is_some());
        store.update_rotated_timestamp_at("orders", "s3:bucket", now).unwrap();

        // Same window, even hours later: already rotated.
        let later = now + Duration::hours(5);
        assert!(store.is_rotated_at("orders", "s3:bucket", later));
        assert_eq!(
            store.rotate_at("orders", "s3:bucket", Some(RotationPeriod::Week), later),
            None
        );
    }

    #[test]
    fn test_window_expires_after_23_hours() {
        let (_dir, store) = store();
        let now = monday();
        store.update_rotated_timestamp_at("orders", "s3:bucket", now).unwrap();
        let next_day = now + Duration::hours(24);
        assert!(!store.is_rotated_at("orders", "s3:bucket", next_day));
    }

    #[test]
    fn test_markers_are_scoped_per_destination() {
        let (_dir, store) = store();
        let now = monday();
        store.update_rotated_timestamp_at("orders", "s3:one", now).unwrap();
        assert!(store.is_rotated_at("orders", "s3:one", now));
        assert!(!store.is_rotated_at("orders", "s3:two", now));
        assert!(!store.is_rotated_at("billing", "s3:one", now));
    }

    #[test]
    fn test_marker_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rotation-state.json");
        let now = monday();
        MarkerStore::new(path.clone())
            .update_rotated_timestamp_at("orders", "s3:bucket", now)
            .unwrap();

        // A fresh store instance simulates a process restart.
        let reopened = MarkerStore::new(path);
        assert!(reopened.is_rotated_at("orders", "s3:bucket", now + Duration::hours(1)));
    }

    #[test]
    fn test_corrupt_state_file_counts_as_not_rotated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rotation-state.json");
        std::fs::write(&path, b"not json").unwrap();
        let store = MarkerStore::new(path);
        assert!(!store.is_rotated_at("orders", "s3:bucket", monday()));
    }

    #[test]
    fn test_no_period_means_no_rotation() {
        let (_dir, store) = store();
        assert_eq!(store.rotate_at("orders", "s3:bucket", None, monday()), None);
    }
}
