//! A notifier that writes alerts to the log.
//!
//! Used when no webhook is configured, and handy when running the
//! consumers locally.

use crate::core::{AlertEvent, Notifier};
use async_trait::async_trait;
use tracing::warn;

#[derive(Debug, Default, Clone)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, event: &AlertEvent) -> anyhow::Result<()> {
        warn!("========================================");
        warn!(subject = %event.subject, fired_at = %event.fired_at, "{}", event.body);
        warn!("========================================");
        Ok(())
    }
}
