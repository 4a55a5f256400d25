//! A notifier that posts alerts to an HTTP mail relay.

use crate::core::{AlertEvent, Notifier};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::task;
use tracing::{error, info, instrument};

/// Sends each alert as a `{subject, body}` JSON document to a webhook.
pub struct WebhookNotifier {
    url: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self { url, timeout }
    }

    /// Sends the request in a blocking manner.
    fn send_request(url: &str, timeout: Duration, payload: &Value) -> anyhow::Result<()> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;

        match client.post(url).json(payload).send() {
            Ok(res) => {
                if res.status().is_success() {
                    Ok(())
                } else {
                    let status = res.status();
                    let text = res.text().unwrap_or_default();
                    error!(
                        status = %status,
                        body = %text,
                        "Notification webhook rejected the alert"
                    );
                    anyhow::bail!(
                        "Notification webhook failed: status {}, body: {}",
                        status,
                        text
                    );
                }
            }
            Err(e) => {
                error!(error = %e, "HTTP request to notification webhook failed");
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    #[instrument(skip_all, fields(subject = %event.subject))]
    async fn notify(&self, event: &AlertEvent) -> anyhow::Result<()> {
        let payload = json!({
            "subject": event.subject,
            "body": event.body,
            "fired_at": event.fired_at,
        });

        let url = self.url.clone();
        let timeout = self.timeout;
        let result = task::spawn_blocking(move || Self::send_request(&url, timeout, &payload)).await;

        match result {
            Ok(Ok(())) => {
                info!("Alert notification sent.");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(e) => {
                error!(error = %e, "Notification task failed");
                Err(e.into())
            }
        }
    }
}
