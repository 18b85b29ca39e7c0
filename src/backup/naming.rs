// dbbackup/src/backup/naming.rs
//
// All object/file naming lives here so every backend produces identical
// layouts. The formats are load-bearing: rotation and retention grouping
// parse them back.
use crate::config::RotationSuffix;
use chrono::{DateTime, Datelike, Local};

/// Non-rotating path: `<year>/<month>/<db>-<YYYY-MM-DD-HHMMSS>`.
pub fn timestamped_name(db: &str, now: DateTime<Local>) -> String {
    format!(
        "{}/{}/{}-{}",
        now.format("%Y"),
        now.format("%m"),
        db,
        now.format("%Y-%m-%d-%H%M%S")
    )
}

/// Non-rotating per-table path: `<year>/<month>/<db>/<unit>-<timestamp>`.
pub fn timestamped_table_name(db: &str, unit: &str, now: DateTime<Local>) -> String {
    format!(
        "{}/{}/{}/{}-{}",
        now.format("%Y"),
        now.format("%m"),
        db,
        unit,
        now.format("%Y-%m-%d-%H%M%S")
    )
}

/// Rotating name: `<db>-<Mon>`, `<db>-<Mon-15>` or `<db>-<Mon-15_04>`
/// depending on the configured suffix granularity.
pub fn rotating_name(db: &str, suffix: RotationSuffix, now: DateTime<Local>) -> String {
    match suffix {
        RotationSuffix::Day => format!("{}-{}", db, now.format("%a")),
        RotationSuffix::Hour => format!("{}-{}", db, now.format("%a-%H")),
        RotationSuffix::Minute => format!("{}-{}", db, now.format("%a-%H_%M")),
    }
}

/// Rotating per-table name keeps the database as a directory:
/// `<db>/<unit>-<suffix>`.
pub fn rotating_table_name(
    db: &str,
    unit: &str,
    suffix: RotationSuffix,
    now: DateTime<Local>,
) -> String {
    format!("{}/{}", db, rotating_name(unit, suffix, now))
}

/// Prefixes a rotating name with its retention bucket directory.
pub fn name_with_path(name: &str, suffix: RotationSuffix, now: DateTime<Local>) -> String {
    match suffix {
        RotationSuffix::Day => format!("Daily/{}/{}", now.format("%a"), name),
        RotationSuffix::Hour => {
            format!("Hourly/{}/{}/{}", now.format("%a"), now.format("%a-%H"), name)
        }
        RotationSuffix::Minute => {
            format!("Custom/{}/{}/{}", now.format("%a"), now.format("%a-%H"), name)
        }
    }
}

/// Monthly promotion target: `Monthly/<db>-<MonthAbbrev>`.
pub fn monthly_bucket(db: &str, now: DateTime<Local>) -> String {
    format!("Monthly/{}-{}", db, now.format("%b"))
}

/// Weekly promotion target: `Weekly/<db>-week_<ISOWeekNumber>`.
pub fn weekly_bucket(db: &str, now: DateTime<Local>) -> String {
    format!("Weekly/{}-week_{}", db, now.iso_week().week())
}

/// Everything after the first dot of the file name, with the leading dot:
/// `2026/08/db-....sql.gz` -> `.sql.gz`. Rotation copies re-attach this to
/// the bucket name.
pub fn extension_suffix(key: &str) -> String {
    let file_name = key.rsplit('/').next().unwrap_or(key);
    match file_name.find('.') {
        Some(idx) => file_name[idx..].to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn monday_morning() -> DateTime<Local> {
        // 2024-09-02 was a Monday.
        Local.with_ymd_and_hms(2024, 9, 2, 15, 4, 5).unwrap()
    }

    #[test]
    fn test_timestamped_name() {
        let name = timestamped_name("orders", monday_morning());
        assert_eq!(name, "2024/09/orders-2024-09-02-150405");
    }

    #[test]
    fn test_timestamped_table_name() {
        let name = timestamped_table_name("orders", "orders_items", monday_morning());
        assert_eq!(name, "2024/09/orders/orders_items-2024-09-02-150405");
    }

    #[test]
    fn test_rotating_name_suffixes() {
        let now = monday_morning();
        assert_eq!(rotating_name("orders", RotationSuffix::Day, now), "orders-Mon");
        assert_eq!(
            rotating_name("orders", RotationSuffix::Hour, now),
            "orders-Mon-15"
        );
        assert_eq!(
            rotating_name("orders", RotationSuffix::Minute, now),
            "orders-Mon-15_04"
        );
    }

    #[test]
    fn test_rotating_table_name() {
        let name = rotating_table_name("orders", "orders_items", RotationSuffix::Day, monday_morning());
        assert_eq!(name, "orders/orders_items-Mon");
    }

    #[test]
    fn test_name_with_path() {
        let now = monday_morning();
        assert_eq!(
            name_with_path("orders-Mon", RotationSuffix::Day, now),
            "Daily/Mon/orders-Mon"
        );
        assert_eq!(
            name_with_path("orders-Mon-15", RotationSuffix::Hour, now),
            "Hourly/Mon/Mon-15/orders-Mon-15"
        );
        assert_eq!(
            name_with_path("orders-Mon-15_04", RotationSuffix::Minute, now),
            "Custom/Mon/Mon-15/orders-Mon-15_04"
        );
    }

    #[test]
    fn test_bucket_paths() {
        let now = monday_morning();
        assert_eq!(monthly_bucket("orders", now), "Monthly/orders-Sep");
        assert_eq!(weekly_bucket("orders", now), "Weekly/orders-week_36");
    }

    #[test]
    fn test_extension_suffix() {
        assert_eq!(extension_suffix("2024/09/orders-x.sql.gz"), ".sql.gz");
        assert_eq!(extension_suffix("orders-Mon.dump.7z"), ".dump.7z");
        assert_eq!(extension_suffix("orders-Mon"), "");
        assert_eq!(extension_suffix("a.b/orders"), "");
    }
}
