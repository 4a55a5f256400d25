//! The fixed set of named durable queues and the message shape each carries.
//!
//! Both the distributor and the dispatchers bind to queues through a
//! `Topology`, so a queue name only has to be spelled once. Bindings that
//! come from configuration are cross-checked at startup.

use crate::{
    config::QueueConfig,
    core::{MessagePayload, SourceRecord},
    error::PipelineError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const TYPE_QUEUE: &str = "01-type";
pub const LOCATION_QUEUE: &str = "02-location";

/// How a source record is turned into the payload for one queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    /// `Name: .., Type: .., Website: ..`
    Type,
    /// `Name: .., City: .., State: .., Country: ..`
    Location,
}

impl Projection {
    /// Builds the payload for `record`. Total over every record.
    pub fn apply(&self, record: &SourceRecord) -> MessagePayload {
        let text = match self {
            Projection::Type => format!(
                "Name: {}, Type: {}, Website: {}",
                record.name, record.brewery_type, record.website_url
            ),
            Projection::Location => format!(
                "Name: {}, City: {}, State: {}, Country: {}",
                record.name, record.city, record.state_province, record.country
            ),
        };
        MessagePayload::from(text)
    }
}

/// One named queue in the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub name: String,
    pub durable: bool,
    pub projection: Projection,
}

impl QueueDescriptor {
    pub fn durable(name: impl Into<String>, projection: Projection) -> Self {
        Self {
            name: name.into(),
            durable: true,
            projection,
        }
    }
}

/// The validated, immutable list of queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    queues: Vec<QueueDescriptor>,
}

impl Topology {
    /// Creates a topology, rejecting empty lists, blank names and duplicates.
    pub fn new(queues: Vec<QueueDescriptor>) -> Result<Self, PipelineError> {
        if queues.is_empty() {
            return Err(PipelineError::Configuration(
                "topology must declare at least one queue".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for queue in &queues {
            if queue.name.trim().is_empty() {
                return Err(PipelineError::Configuration(
                    "queue names must not be empty".to_string(),
                ));
            }
            if !seen.insert(queue.name.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "queue '{}' is declared more than once",
                    queue.name
                )));
            }
        }

        Ok(Self { queues })
    }

    /// The two-queue layout used by default: one type queue, one location queue.
    pub fn standard() -> Self {
        Self {
            queues: vec![
                QueueDescriptor::durable(TYPE_QUEUE, Projection::Type),
                QueueDescriptor::durable(LOCATION_QUEUE, Projection::Location),
            ],
        }
    }

    pub fn from_config(queues: &[QueueConfig]) -> Result<Self, PipelineError> {
        Self::new(
            queues
                .iter()
                .map(|q| QueueDescriptor::durable(q.name.clone(), q.projection))
                .collect(),
        )
    }

    pub fn queues(&self) -> &[QueueDescriptor] {
        &self.queues
    }

    pub fn get(&self, name: &str) -> Option<&QueueDescriptor> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.iter().map(|q| q.name.as_str())
    }

    /// Checks that the dispatcher bindings cover exactly the topology's queues.
    ///
    /// A queue without a binding would fill up with messages no one consumes;
    /// a binding without a queue would wait forever on a queue no one feeds.
    pub fn validate_bindings<'a, I>(&self, bound: I) -> Result<(), PipelineError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut bound_names = HashSet::new();
        for name in bound {
            if !bound_names.insert(name) {
                return Err(PipelineError::Configuration(format!(
                    "queue '{}' is bound to more than one dispatcher",
                    name
                )));
            }
            if self.get(name).is_none() {
                return Err(PipelineError::Configuration(format!(
                    "dispatcher is bound to queue '{}', which is not in the topology",
                    name
                )));
            }
        }

        if let Some(orphan) = self.names().find(|name| !bound_names.contains(name)) {
            return Err(PipelineError::Configuration(format!(
                "queue '{}' has no dispatcher binding",
                orphan
            )));
        }

        Ok(())
    }
}
