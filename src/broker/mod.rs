//! Broker implementations behind the `Broker`/`BrokerChannel` traits.
pub mod amqp;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use amqp::AmqpBroker;
pub use crate::core::{Broker, BrokerChannel, DeliveryStream};
