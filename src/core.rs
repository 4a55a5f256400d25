//! Core domain types and service traits for brewq
//!
//! This module defines the records and messages that flow through the
//! pipeline and the trait contracts at each external seam: the broker, the
//! per-queue handlers and the notification transport.

use crate::error::PipelineError;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One row of the brewery dataset, in file column order.
///
/// All fields are kept as text so every projection is total over any
/// well-formed row, including rows with empty coordinates or address lines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SourceRecord {
    pub id: String,
    pub name: String,
    pub brewery_type: String,
    pub address_1: String,
    pub address_2: String,
    pub address_3: String,
    pub city: String,
    pub state_province: String,
    pub postal_code: String,
    pub country: String,
    pub phone: String,
    pub website_url: String,
    pub longitude: String,
    pub latitude: String,
}

/// The opaque body of a queued message.
///
/// Producers build it from text; consumers must decode it themselves, so a
/// body that is not UTF-8 surfaces as a handler fault rather than a
/// transport error.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePayload(Vec<u8>);

impl MessagePayload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decodes the body as UTF-8 text.
    pub fn as_text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.0)
    }
}

impl From<String> for MessagePayload {
    fn from(text: String) -> Self {
        Self(text.into_bytes())
    }
}

impl From<&str> for MessagePayload {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for MessagePayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for MessagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Broker-assigned identifier tying a delivery to its acknowledgment.
///
/// Deliberately neither `Clone` nor `Copy`: acknowledging or rejecting a
/// delivery consumes the handle, so it can be relinquished only once.
#[derive(Debug, PartialEq, Eq)]
pub struct DeliveryHandle {
    tag: u64,
}

impl DeliveryHandle {
    pub fn new(tag: u64) -> Self {
        Self { tag }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }
}

/// A message handed to a dispatcher by the broker.
#[derive(Debug)]
pub struct Delivery {
    pub handle: DeliveryHandle,
    pub payload: MessagePayload,
    /// Set by the broker when this message was delivered before and never acknowledged.
    pub redelivered: bool,
}

/// What a handler reports back to its dispatcher for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Processed; the dispatcher acknowledges the delivery.
    Success,
    /// Failed, but a second attempt may succeed.
    Retryable(String),
    /// Failed; the dispatcher stops and leaves the delivery unacknowledged.
    Fatal(String),
}

/// A notification produced by an alert rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertEvent {
    pub subject: String,
    pub body: String,
    /// RFC 3339 timestamp of when the rule fired
    pub fired_at: String,
}

// =============================================================================
// Service Traits
// =============================================================================

/// An open connection to the message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a new channel owned exclusively by the caller.
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, PipelineError>;

    /// Closes the connection and every channel still open on it.
    async fn close(&self) -> Result<(), PipelineError>;
}

/// A single broker channel. Never shared between execution contexts.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a durable queue. Declaring an existing durable queue is a no-op.
    async fn declare_queue(&self, name: &str) -> Result<(), PipelineError>;

    /// Deletes a queue and any messages still in it.
    async fn delete_queue(&self, name: &str) -> Result<(), PipelineError>;

    /// Publishes a persistent message and waits for the broker to confirm it.
    async fn publish(&self, queue: &str, payload: &MessagePayload) -> Result<(), PipelineError>;

    /// Caps the number of unacknowledged deliveries outstanding on this channel.
    async fn set_prefetch(&self, limit: u16) -> Result<(), PipelineError>;

    /// Starts a manual-acknowledgment consumer on `queue`.
    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn DeliveryStream>, PipelineError>;

    /// Acknowledges a delivery, removing it from the queue permanently.
    async fn ack(&self, handle: DeliveryHandle) -> Result<(), PipelineError>;

    /// Rejects a delivery, optionally returning it to the queue.
    async fn nack(&self, handle: DeliveryHandle, requeue: bool) -> Result<(), PipelineError>;

    /// Closes the channel. Unacknowledged deliveries go back to their queues.
    async fn close(&self) -> Result<(), PipelineError>;
}

/// The stream of deliveries for one subscription.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Waits for the next delivery.
    ///
    /// # Returns
    /// * `Some(Ok(Delivery))` for each message
    /// * `Some(Err(_))` if the transport failed
    /// * `None` if the broker cancelled the consumer or the channel closed
    async fn next_delivery(&mut self) -> Option<Result<Delivery, PipelineError>>;
}

/// Processes the messages of one queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one delivered payload. The dispatcher does not deliver another
    /// message until this returns.
    async fn handle(&self, payload: &MessagePayload, delivery: &DeliveryHandle) -> HandlerOutcome;
}

/// Sends alert notifications to an external transport
#[async_trait]
pub trait Notifier: Send + Sync {
    /// A short, descriptive name for the transport (e.g., "webhook", "log").
    fn name(&self) -> &str;

    /// Sends one alert. Failures are reported, never retried.
    async fn notify(&self, event: &AlertEvent) -> Result<()>;
}
