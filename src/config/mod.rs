// dbbackup/src/config/mod.rs
use crate::errors::{BackupError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_MAX_CONCURRENT_PROCESSES: usize = 10;
const DEFAULT_TIMEOUT_HOURS: u64 = 12;
const DEFAULT_MARKER_FILE: &str = "/var/lib/dbbackup/rotation-state.json";

// Structs for deserializing config.json. Everything optional here; the
// load_* functions below validate and fill defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub engine: Option<String>,
    pub source: Option<RawSourceConfig>,
    pub databases: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub format: Option<String>,
    pub archive_pass: Option<String>,
    pub backup_as_tables: Option<bool>,
    pub remove_local: Option<bool>,
    pub backup_destination: Option<PathBuf>,
    pub max_concurrent_processes: Option<i64>,
    pub timeout_hours: Option<u64>,
    pub run_every_cron: Option<String>,
    pub retry_failed: Option<bool>,
    pub rotation: Option<RawRotationConfig>,
    pub destinations: Option<Vec<RawDestinationConfig>>,
    pub notify: Option<RawNotifyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSourceConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRotationConfig {
    pub enabled: Option<bool>,
    pub period: Option<String>,
    pub suffix: Option<String>,
    pub keep: Option<RawKeepConfig>,
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawKeepConfig {
    pub daily: Option<u32>,
    pub weekly: Option<u32>,
    pub monthly: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDestinationConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub path: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub flags: Option<String>,
    /// Whether rotation/retention applies to this destination.
    pub rotate: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawNotifyConfig {
    pub webhook: Option<RawWebhookConfig>,
    pub uptime_alarm_hours: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawWebhookConfig {
    pub enabled: Option<bool>,
    pub only_on_error: Option<bool>,
    pub server_identifier: Option<String>,
    pub info: Option<Vec<String>>,
    pub error: Option<Vec<String>>,
}

// Application's internal configuration structs.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Postgres,
    MySql,
    MsSql,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    Gzip,
    SevenZip,
}

#[derive(Debug, Clone, Default)]
pub struct SourceConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl SourceConfig {
    pub fn is_remote(&self) -> bool {
        self.host.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPeriod {
    Week,
    Month,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationSuffix {
    Day,
    Hour,
    Minute,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepPolicy {
    /// Days of daily backups to keep (age-based).
    pub daily: u32,
    /// Newest weekly copies to keep per database (count-based).
    pub weekly: u32,
    /// Newest monthly copies to keep per database (count-based).
    pub monthly: u32,
}

impl KeepPolicy {
    pub fn any_enabled(&self) -> bool {
        self.daily > 0 || self.weekly > 0 || self.monthly > 0
    }
}

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub enabled: bool,
    pub period: Option<RotationPeriod>,
    pub suffix: RotationSuffix,
    pub keep: KeepPolicy,
    pub state_file: PathBuf,
}

impl Default for RotationConfig {
    fn default() -> Self {
        RotationConfig {
            enabled: false,
            period: None,
            suffix: RotationSuffix::Day,
            keep: KeepPolicy::default(),
            state_file: PathBuf::from(DEFAULT_MARKER_FILE),
        }
    }
}

/// A configured upload target plus whether rotation/retention applies to it.
#[derive(Debug, Clone)]
pub struct Destination {
    pub rotate: bool,
    pub kind: DestinationConfig,
}

#[derive(Debug, Clone)]
pub enum DestinationConfig {
    S3 {
        endpoint: Option<String>,
        region: String,
        bucket: String,
        path: Option<String>,
        access_key: String,
        secret_key: String,
    },
    Sftp {
        host: String,
        port: u16,
        user: String,
        path: String,
    },
    Rsync {
        host: String,
        user: String,
        path: String,
        flags: String,
    },
    Local {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub only_on_error: bool,
    pub server_identifier: String,
    pub info: Vec<String>,
    pub error: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub webhook: WebhookConfig,
    pub uptime_alarm_hours: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            webhook: WebhookConfig::default(),
            uptime_alarm_hours: 24,
        }
    }
}

/// Configuration snapshot for one run. Immutable once built.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub engine: Engine,
    pub source: SourceConfig,
    pub databases: Vec<String>,
    pub exclude: Vec<String>,
    pub format: DumpFormat,
    pub archive_pass: Option<String>,
    pub backup_as_tables: bool,
    pub remove_local: bool,
    pub backup_destination: PathBuf,
    pub max_concurrent_processes: usize,
    pub timeout_hours: u64,
    pub run_every_cron: Option<String>,
    pub retry_failed: bool,
    pub rotation: RotationConfig,
    pub destinations: Vec<Destination>,
    pub notify: NotifyConfig,
}

pub fn load_from_json(config_path: &Path) -> Result<JobConfig> {
    let config_content = fs::read_to_string(config_path).map_err(|e| {
        BackupError::Config(format!(
            "Failed to read config file at {}: {}",
            config_path.display(),
            e
        ))
    })?;
    let raw: RawJsonConfig = serde_json::from_str(&config_content).map_err(|e| {
        BackupError::Config(format!(
            "Failed to parse JSON from config file at {}: {}",
            config_path.display(),
            e
        ))
    })?;
    build_job_config(raw)
}

pub fn build_job_config(raw: RawJsonConfig) -> Result<JobConfig> {
    let engine = match raw.engine.as_deref() {
        None | Some("") | Some("postgresql") | Some("postgres") => Engine::Postgres,
        Some("mysql") | Some("mariadb") => Engine::MySql,
        Some("mssql") => Engine::MsSql,
        Some(other) => {
            return Err(BackupError::Config(format!(
                "Unsupported database engine: {}",
                other
            )));
        }
    };

    let archive_pass = raw.archive_pass.filter(|p| !p.is_empty());

    // 7z is the only archiver that can carry the passphrase, so it wins
    // whenever encryption is requested.
    let format = match raw.format.as_deref() {
        _ if archive_pass.is_some() => DumpFormat::SevenZip,
        Some("7zip") | Some("7z") => DumpFormat::SevenZip,
        None | Some("") | Some("gzip") | Some("gz") => DumpFormat::Gzip,
        Some(other) => {
            return Err(BackupError::Config(format!(
                "Unsupported dump format: {}",
                other
            )));
        }
    };

    let backup_destination = raw
        .backup_destination
        .ok_or_else(|| BackupError::Config("backup_destination must be set".to_string()))?;
    if backup_destination.as_os_str().is_empty() {
        return Err(BackupError::Config(
            "backup_destination cannot be empty".to_string(),
        ));
    }

    let max_concurrent_processes = match raw.max_concurrent_processes {
        Some(n) if n > 0 => n as usize,
        _ => DEFAULT_MAX_CONCURRENT_PROCESSES,
    };

    let timeout_hours = match raw.timeout_hours {
        Some(0) | None => DEFAULT_TIMEOUT_HOURS,
        Some(n) => n,
    };

    let rotation = build_rotation_config(raw.rotation)?;

    let raw_destinations = raw.destinations.unwrap_or_default();
    if raw_destinations.is_empty() {
        return Err(BackupError::Config(
            "at least one destination must be configured".to_string(),
        ));
    }
    let destinations = raw_destinations
        .into_iter()
        .map(parse_destination)
        .collect::<Result<Vec<_>>>()?;

    let notify = build_notify_config(raw.notify);

    let databases = raw.databases.unwrap_or_default();
    for name in &databases {
        if name.trim().is_empty()
            || name.contains(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
        {
            return Err(BackupError::Config(format!(
                "Invalid character in database name list: {:?}",
                name
            )));
        }
    }

    let source = raw
        .source
        .map(|s| SourceConfig {
            host: s.host.filter(|h| !h.is_empty()),
            port: s.port,
            user: s.user,
            password: s.password,
        })
        .unwrap_or_default();

    Ok(JobConfig {
        engine,
        source,
        databases,
        exclude: raw.exclude.unwrap_or_default(),
        format,
        archive_pass,
        backup_as_tables: raw.backup_as_tables.unwrap_or(false),
        remove_local: raw.remove_local.unwrap_or(false),
        backup_destination,
        max_concurrent_processes,
        timeout_hours,
        run_every_cron: raw.run_every_cron.filter(|c| !c.is_empty()),
        retry_failed: raw.retry_failed.unwrap_or(false),
        rotation,
        destinations,
        notify,
    })
}

fn build_rotation_config(raw: Option<RawRotationConfig>) -> Result<RotationConfig> {
    let Some(raw) = raw else {
        return Ok(RotationConfig::default());
    };

    let period = match raw.period.as_deref() {
        Some("week") => Some(RotationPeriod::Week),
        Some("month") => Some(RotationPeriod::Month),
        None | Some("") => None,
        Some(other) => {
            return Err(BackupError::Config(format!(
                "Unsupported rotation period: {} (expected \"week\" or \"month\")",
                other
            )));
        }
    };

    let suffix = match raw.suffix.as_deref() {
        None | Some("") | Some("day") => RotationSuffix::Day,
        Some("hour") => RotationSuffix::Hour,
        Some("minute") => RotationSuffix::Minute,
        Some(other) => {
            return Err(BackupError::Config(format!(
                "Unsupported rotation suffix: {} (expected \"day\", \"hour\" or \"minute\")",
                other
            )));
        }
    };

    let keep = raw
        .keep
        .map(|k| KeepPolicy {
            daily: k.daily.unwrap_or(0),
            weekly: k.weekly.unwrap_or(0),
            monthly: k.monthly.unwrap_or(0),
        })
        .unwrap_or_default();

    Ok(RotationConfig {
        enabled: raw.enabled.unwrap_or(false),
        period,
        suffix,
        keep,
        state_file: raw
            .state_file
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MARKER_FILE)),
    })
}

fn parse_destination(raw: RawDestinationConfig) -> Result<Destination> {
    let rotate = raw.rotate.unwrap_or(true);
    let kind = raw.kind.clone();
    let require = |field: &str, value: Option<String>| {
        value.filter(|s| !s.is_empty()).ok_or_else(|| {
            BackupError::Config(format!(
                "destination of type {:?} is missing required field {:?}",
                kind, field
            ))
        })
    };
    let kind = match raw.kind.as_str() {
        "s3" | "minio" => Ok(DestinationConfig::S3 {
            endpoint: raw.endpoint.filter(|s| !s.is_empty()),
            region: require("region", raw.region)?,
            bucket: require("bucket", raw.bucket)?,
            path: raw.path.filter(|s| !s.is_empty()),
            access_key: require("access_key", raw.access_key)?,
            secret_key: require("secret_key", raw.secret_key)?,
        }),
        "sftp" => Ok(DestinationConfig::Sftp {
            host: require("host", raw.host)?,
            port: raw.port.unwrap_or(22),
            user: require("user", raw.user)?,
            path: require("path", raw.path)?,
        }),
        "rsync" => Ok(DestinationConfig::Rsync {
            host: require("host", raw.host)?,
            user: require("user", raw.user)?,
            path: require("path", raw.path)?,
            flags: raw.flags.unwrap_or_else(|| "-a".to_string()),
        }),
        "local" => Ok(DestinationConfig::Local {
            path: PathBuf::from(require("path", raw.path)?),
        }),
        other => Err(BackupError::Config(format!(
            "Unsupported destination type: {}",
            other
        ))),
    }?;
    Ok(Destination { rotate, kind })
}

fn build_notify_config(raw: Option<RawNotifyConfig>) -> NotifyConfig {
    let Some(raw) = raw else {
        return NotifyConfig::default();
    };
    let webhook = raw
        .webhook
        .map(|w| WebhookConfig {
            enabled: w.enabled.unwrap_or(false),
            only_on_error: w.only_on_error.unwrap_or(false),
            server_identifier: w.server_identifier.unwrap_or_default(),
            info: w.info.unwrap_or_default(),
            error: w.error.unwrap_or_default(),
        })
        .unwrap_or_default();
    NotifyConfig {
        webhook,
        uptime_alarm_hours: raw.uptime_alarm_hours.unwrap_or(24),
    }
}
