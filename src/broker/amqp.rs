//! AMQP 0-9-1 broker client built on `lapin`.

use crate::{
    core::{
        Broker, BrokerChannel, Delivery, DeliveryHandle, DeliveryStream, MessagePayload,
    },
    error::PipelineError,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use tracing::{debug, info};

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// An owned connection to an AMQP broker.
pub struct AmqpBroker {
    connection: Connection,
}

impl AmqpBroker {
    /// Connects to the broker at `uri`.
    ///
    /// Failure here happens at startup, so it is reported as a configuration
    /// error rather than a transport error.
    pub async fn connect(uri: &str) -> Result<Self, PipelineError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| PipelineError::Configuration(format!("cannot reach broker: {}", e)))?;
        info!("Connected to message broker.");
        Ok(Self { connection })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, PipelineError> {
        let channel = self.connection.create_channel().await?;
        // Publisher confirms: a publish only returns once the broker has the message.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        debug!(channel_id = channel.id(), "Opened broker channel");
        Ok(Box::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<(), PipelineError> {
        if self.connection.status().connected() {
            self.connection.close(REPLY_SUCCESS, "Goodbye").await?;
            info!("Broker connection closed.");
        }
        Ok(())
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, name: &str) -> Result<(), PipelineError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!(queue = name, "Declared durable queue");
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), PipelineError> {
        let purged = self
            .channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        debug!(queue = name, purged, "Deleted queue");
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &MessagePayload) -> Result<(), PipelineError> {
        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload.as_bytes(),
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(PipelineError::Transport(format!(
                "broker refused message for queue '{}'",
                queue
            )));
        }
        Ok(())
    }

    async fn set_prefetch(&self, limit: u16) -> Result<(), PipelineError> {
        self.channel
            .basic_qos(limit, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn DeliveryStream>, PipelineError> {
        // no_ack stays false: every delivery waits for an explicit ack.
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(Box::new(AmqpDeliveryStream { consumer }))
    }

    async fn ack(&self, handle: DeliveryHandle) -> Result<(), PipelineError> {
        self.channel
            .basic_ack(handle.tag(), BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, handle: DeliveryHandle, requeue: bool) -> Result<(), PipelineError> {
        self.channel
            .basic_nack(
                handle.tag(),
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PipelineError> {
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "Goodbye").await?;
        }
        Ok(())
    }
}

struct AmqpDeliveryStream {
    consumer: Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, PipelineError>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|delivery| Delivery {
                handle: DeliveryHandle::new(delivery.delivery_tag),
                payload: MessagePayload::from(delivery.data),
                redelivered: delivery.redelivered,
            })
            .map_err(PipelineError::from),
        )
    }
}
