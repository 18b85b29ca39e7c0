// dbbackup/src/main.rs
mod backup;
mod config;
mod errors;
mod notify;
mod storage;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Dumps PostgreSQL, MySQL/MariaDB and MSSQL databases and delivers them to
/// S3-compatible, SFTP, rsync or local destinations, with rotation copies
/// and retention cleanup.
#[derive(Parser)]
#[command(name = "dbbackup", version)]
struct Cli {
    /// Path of the configuration file in JSON format
    #[arg(
        short,
        long,
        default_value = "/etc/dbbackup.json",
        env = "DBBACKUP_CONFIG"
    )]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match run_app(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    let job_config = config::load_from_json(&cli.config).with_context(|| {
        format!("Failed to load configuration from {}", cli.config.display())
    })?;
    info!("dbbackup started.");

    let notifier = notify::Notifier::new(&job_config);
    let driver = match backup::JobDriver::connect(job_config.clone()).await {
        Ok(driver) => driver,
        Err(e) => {
            notifier
                .send_alarm(
                    &format!("Couldn't initialize backup destinations - Error: {}", e),
                    true,
                )
                .await;
            return Err(e.into());
        }
    };
    let _status_reporter = driver.spawn_status_reporter();

    match &job_config.run_every_cron {
        Some(expr) => loop {
            let now = Local::now();
            let next = cron_parser::parse(expr, &now)
                .map_err(|e| anyhow::anyhow!("Invalid cron expression {:?}: {}", expr, e))?;
            info!("Next run scheduled at {}", next);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
            driver.run().await;
        },
        None => {
            let report = driver.run().await;
            if !report.failed.is_empty() {
                anyhow::bail!("{} database backup(s) failed", report.failed.len());
            }
            Ok(())
        }
    }
}
