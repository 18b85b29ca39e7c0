// dbbackup/src/notify/mod.rs
use crate::config::{Engine, JobConfig, WebhookConfig};
use log::error;
use serde_json::json;

/// Webhook notifications. Failures to deliver are logged and swallowed; a
/// broken chat integration must never fail a backup run.
#[derive(Clone)]
pub struct Notifier {
    webhook: WebhookConfig,
    engine: Engine,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(config: &JobConfig) -> Self {
        Notifier {
            webhook: config.notify.webhook.clone(),
            engine: config.engine,
            client: reqwest::Client::new(),
        }
    }

    fn identifier(&self) -> String {
        let engine = match self.engine {
            Engine::Postgres => "PostgreSQL",
            Engine::MySql => "MySQL",
            Engine::MsSql => "MSSQL",
        };
        format!("[ {} - {} ] ", engine, self.webhook.server_identifier)
    }

    /// Posts `message` to the info or error hooks. `force` overrides
    /// `only_on_error` for the success half of a mixed-outcome summary.
    async fn post(&self, message: &str, is_error: bool, force: bool) {
        if !self.webhook.enabled {
            return;
        }
        if self.webhook.only_on_error && !is_error && !force {
            return;
        }
        let (hooks, marker) = if is_error {
            (&self.webhook.error, "[:red_circle:] ")
        } else {
            (&self.webhook.info, "[:check:] ")
        };
        let text = format!("{}{}{}", self.identifier(), marker, message);
        let payload = json!({ "text": text });
        for hook in hooks {
            let result = self.client.post(hook).json(&payload).send().await;
            match result {
                Ok(response) if !response.status().is_success() => {
                    error!(
                        "Webhook {} answered with status {}",
                        hook,
                        response.status()
                    );
                }
                Ok(_) => {}
                Err(e) => error!("Couldn't send message to webhook {}: {}", hook, e),
            }
        }
    }

    pub async fn send_alarm(&self, message: &str, is_error: bool) {
        self.post(message, is_error, false).await;
    }

    /// End-of-run summary: one aggregated message per outcome class instead
    /// of one webhook call per database.
    pub async fn send_run_summary(&self, succeeded: &[String], failed: &[String]) {
        if !failed.is_empty() {
            self.post(
                &format!(
                    "Failed to backup the following databases:\n- {}",
                    failed.join("\n- ")
                ),
                true,
                false,
            )
            .await;
        }
        if !succeeded.is_empty() {
            // A run with failures reports its successes even under
            // only_on_error, so the summary is complete.
            self.post(
                &format!(
                    "Successfully backed up the following databases:\n- {}",
                    succeeded.join("\n- ")
                ),
                false,
                !failed.is_empty(),
            )
            .await;
        }
    }
}
