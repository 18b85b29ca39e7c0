// dbbackup/src/backup/cleanup.rs
//
// Retention: Daily backups age out after a number of days, Weekly/Monthly
// keep the newest N copies per database. Grouping by database matters; a
// flat "keep newest N in the bucket" would let a chatty database evict its
// siblings' history.
use crate::config::KeepPolicy;
use crate::errors::Result;
use crate::storage::{BackupFileRecord, StorageBackend};
use chrono::{DateTime, Duration, Utc};
use log::info;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionLaw {
    /// Delete everything older than `keep` days.
    Age,
    /// Keep only the newest `keep` entries.
    Count,
}

/// Strips the rotation suffix off a backup file name to recover the
/// database it belongs to: `orders-week_36.sql.gz` -> `orders`,
/// `billing-Mon-15.dump` -> `billing`.
fn database_of(file_name: &str) -> &str {
    static SUFFIX: OnceLock<Regex> = OnceLock::new();
    let re = SUFFIX.get_or_init(|| {
        Regex::new(
            r"(.+)-(week_\d+|Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec|Mon|Tue|Wed|Thu|Fri|Sat|Sun)",
        )
        .unwrap_or_else(|_| unreachable!("suffix pattern is valid"))
    });
    match re.captures(file_name) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or(file_name),
        None => file_name,
    }
}

/// Applies one retention law to one database's files and returns what to
/// delete. `keep == 0` means retention is disabled for this bucket.
pub fn files_to_delete(
    mut files: Vec<BackupFileRecord>,
    law: RetentionLaw,
    keep: u32,
    now: DateTime<Utc>,
) -> Vec<BackupFileRecord> {
    if keep == 0 {
        return Vec::new();
    }
    match law {
        RetentionLaw::Age => {
            let cutoff = now - Duration::days(i64::from(keep));
            files.retain(|f| f.modified < cutoff);
            files
        }
        RetentionLaw::Count => {
            if files.len() <= keep as usize {
                return Vec::new();
            }
            // Newest first; everything past the keep mark goes.
            files.sort_by(|a, b| b.modified.cmp(&a.modified));
            files.split_off(keep as usize)
        }
    }
}

fn group_by_database(files: Vec<BackupFileRecord>) -> HashMap<String, Vec<BackupFileRecord>> {
    let mut grouped: HashMap<String, Vec<BackupFileRecord>> = HashMap::new();
    for file in files {
        let db = database_of(&file.name).to_string();
        grouped.entry(db).or_default().push(file);
    }
    grouped
}

/// Runs the full retention pass against one backend.
pub async fn run_cleanup(backend: &dyn StorageBackend, keep: &KeepPolicy) -> Result<()> {
    run_cleanup_at(backend, keep, Utc::now()).await
}

pub async fn run_cleanup_at(
    backend: &dyn StorageBackend,
    keep: &KeepPolicy,
    now: DateTime<Utc>,
) -> Result<()> {
    let buckets = [
        ("Daily", keep.daily, RetentionLaw::Age),
        ("Weekly", keep.weekly, RetentionLaw::Count),
        ("Monthly", keep.monthly, RetentionLaw::Count),
    ];
    for (prefix, keep, law) in buckets {
        if keep == 0 {
            continue;
        }
        let files = backend.list(prefix).await?;
        let mut keys = Vec::new();
        for (_, group) in group_by_database(files) {
            keys.extend(
                files_to_delete(group, law, keep, now)
                    .into_iter()
                    .map(|f| f.key),
            );
        }
        if keys.is_empty() {
            continue;
        }
        info!(
            "Cleaning up {} old backups under {} on {}",
            keys.len(),
            prefix,
            backend.id()
        );
        backend.delete(&keys).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(name: &str, days_old: i64, now: DateTime<Utc>) -> BackupFileRecord {
        BackupFileRecord {
            name: name.to_string(),
            key: format!("Weekly/{}", name),
            modified: now - Duration::days(days_old),
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_database_of_strips_rotation_suffixes() {
        assert_eq!(database_of("orders-week_36.sql.gz"), "orders");
        assert_eq!(database_of("orders-Sep.dump.7z"), "orders");
        assert_eq!(database_of("billing-Mon-15.dump"), "billing");
        assert_eq!(database_of("no-suffix-here.bak"), "no-suffix-here.bak");
    }

    #[test]
    fn test_count_law_keeps_newest() {
        let now = fixed_now();
        let files: Vec<_> = (0..10)
            .map(|i| record(&format!("orders-week_{}.dump", 40 - i), i, now))
            .collect();
        let deleted = files_to_delete(files, RetentionLaw::Count, 4, now);
        assert_eq!(deleted.len(), 6);
        // The oldest six go; week_40..week_37 (ages 0..3) survive.
        assert!(deleted.iter().all(|f| f.modified < now - Duration::days(3)));
    }

    #[test]
    fn test_count_law_under_limit_deletes_nothing() {
        let now = fixed_now();
        let files: Vec<_> = (0..3)
            .map(|i| record(&format!("orders-week_{}.dump", i), i as i64, now))
            .collect();
        assert!(files_to_delete(files, RetentionLaw::Count, 4, now).is_empty());
    }

    #[test]
    fn test_age_law_deletes_older_than_keep_days() {
        let now = fixed_now();
        let files: Vec<_> = (1..=10)
            .map(|i| record(&format!("orders-{}.dump", i), i, now))
            .collect();
        let deleted = files_to_delete(files, RetentionLaw::Age, 7, now);
        assert_eq!(deleted.len(), 3);
        assert!(deleted.iter().all(|f| f.modified < now - Duration::days(7)));
    }

    #[test]
    fn test_zero_keep_disables_retention() {
        let now = fixed_now();
        let files = vec![record("orders-week_1.dump", 400, now)];
        assert!(files_to_delete(files.clone(), RetentionLaw::Age, 0, now).is_empty());
        assert!(files_to_delete(files, RetentionLaw::Count, 0, now).is_empty());
    }

    #[test]
    fn test_grouping_isolates_databases() {
        let now = fixed_now();
        let mut files = Vec::new();
        for i in 0..5 {
            files.push(record(&format!("orders-week_{}.dump", 40 - i), i, now));
            files.push(record(&format!("billing-week_{}.dump", 40 - i), i, now));
        }
        let grouped = group_by_database(files);
        assert_eq!(grouped.len(), 2);
        let total_deleted: usize = grouped
            .into_values()
            .map(|group| files_to_delete(group, RetentionLaw::Count, 4, now).len())
            .sum();
        // One per database, not six from a flat pool.
        assert_eq!(total_deleted, 2);
    }
}
