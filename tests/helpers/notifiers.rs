//! Notification transports that record what they were asked to send.

use async_trait::async_trait;
use brewq::core::{AlertEvent, Notifier};
use std::sync::{Arc, Mutex};

/// Keeps every alert it receives.
#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    pub events: Arc<Mutex<Vec<AlertEvent>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<AlertEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording_mock"
    }

    async fn notify(&self, event: &AlertEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Fails every send, as an unreachable mail relay would.
#[derive(Clone, Debug, Default)]
pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    fn name(&self) -> &str {
        "failing_mock"
    }

    async fn notify(&self, _event: &AlertEvent) -> anyhow::Result<()> {
        anyhow::bail!("mail relay unreachable")
    }
}
