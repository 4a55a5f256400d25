//! The handler bound to each queue.
//!
//! Decodes a payload, optionally runs the alert rule over it and appends it
//! to the queue's sink file. Any failure along the way is reported as a
//! fatal outcome so the dispatcher stops with the message unacknowledged.

use crate::{
    core::{DeliveryHandle, HandlerOutcome, MessageHandler, MessagePayload, Notifier},
    outputs::CsvSink,
    rules::AlertRule,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// An alert rule together with where its alerts go.
pub struct AlertAction {
    pub rule: AlertRule,
    pub notifier: Arc<dyn Notifier>,
}

/// Writes every processed payload of one queue to a CSV sink.
pub struct SinkHandler {
    queue: String,
    sink: CsvSink,
    alert: Option<AlertAction>,
}

impl SinkHandler {
    pub fn new(queue: impl Into<String>, sink: CsvSink) -> Self {
        Self {
            queue: queue.into(),
            sink,
            alert: None,
        }
    }

    /// Evaluates `rule` on each payload before it is written.
    pub fn with_alert(mut self, rule: AlertRule, notifier: Arc<dyn Notifier>) -> Self {
        self.alert = Some(AlertAction { rule, notifier });
        self
    }

    async fn raise_alert(&self, decoded: &str) -> Result<(), String> {
        let Some(action) = &self.alert else {
            return Ok(());
        };
        let Some(event) = action.rule.evaluate(decoded) else {
            return Ok(());
        };

        warn!("========================================");
        warn!("ALERT! Brewery located in the target area: {}", decoded);
        warn!("========================================");
        metrics::counter!("alerts_fired_total", "queue" => self.queue.clone()).increment(1);

        action.notifier.notify(&event).await.map_err(|e| {
            format!(
                "notification via {} failed: {:#}",
                action.notifier.name(),
                e
            )
        })
    }
}

#[async_trait]
impl MessageHandler for SinkHandler {
    async fn handle(&self, payload: &MessagePayload, delivery: &DeliveryHandle) -> HandlerOutcome {
        let decoded = match payload.as_text() {
            Ok(text) => text.to_uppercase(),
            Err(e) => {
                error!(delivery_tag = delivery.tag(), error = %e, "Payload is not valid UTF-8");
                return HandlerOutcome::Fatal(format!("payload is not valid UTF-8: {}", e));
            }
        };

        if let Err(reason) = self.raise_alert(&decoded).await {
            error!(delivery_tag = delivery.tag(), "{}", reason);
            return HandlerOutcome::Fatal(reason);
        }

        if let Err(e) = self.sink.append_line_async(decoded.clone()).await {
            error!(
                delivery_tag = delivery.tag(),
                sink = %self.sink.path().display(),
                error = %e,
                "Failed to write to sink"
            );
            return HandlerOutcome::Fatal(format!("sink write failed: {:#}", e));
        }

        debug!(sink = %self.sink.path().display(), "Appended row");
        info!(delivery_tag = delivery.tag(), "[x] Processed {}", decoded);
        HandlerOutcome::Success
    }
}
