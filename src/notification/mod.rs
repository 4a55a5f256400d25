//! Transports for alert notifications.
//!
//! The dispatchers only see the `Notifier` trait from `core`; which transport
//! backs it is decided once at startup from the configuration.
pub mod logging;
pub mod webhook;

use crate::{config::NotificationConfig, core::Notifier};
use std::{sync::Arc, time::Duration};
use tracing::info;

pub use logging::LoggingNotifier;
pub use webhook::WebhookNotifier;

/// Picks the webhook transport when a URL is configured, otherwise logs alerts.
pub fn from_config(config: &NotificationConfig) -> Arc<dyn Notifier> {
    match config.webhook_url.as_deref().filter(|url| !url.trim().is_empty()) {
        Some(url) => {
            info!("Alert notifications will be posted to the configured webhook.");
            Arc::new(WebhookNotifier::new(
                url.to_string(),
                Duration::from_millis(config.timeout_ms),
            ))
        }
        None => {
            info!("No notification webhook configured; alerts will only be logged.");
            Arc::new(LoggingNotifier)
        }
    }
}
