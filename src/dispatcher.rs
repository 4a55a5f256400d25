//! The per-queue consume loop.
//!
//! A dispatcher owns one broker channel, subscribes to a single queue with a
//! prefetch ceiling and hands each delivery to its handler. The delivery is
//! acknowledged only after the handler reports success; a fatal outcome
//! stops the dispatcher and leaves the delivery for the broker to requeue.

use crate::{
    core::{Broker, BrokerChannel, Delivery, HandlerOutcome, MessageHandler},
    error::PipelineError,
    task_manager::wait_for_shutdown,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of one dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Not yet subscribed.
    Idle,
    /// Subscribed and waiting for the next delivery.
    Subscribed,
    /// A delivery is with the handler and not yet acknowledged.
    Handling,
    /// Stopped; the channel has been released.
    Closed,
}

/// Consumes one queue with one handler.
pub struct Dispatcher {
    queue: String,
    prefetch: u16,
    handler: Arc<dyn MessageHandler>,
    state_tx: watch::Sender<DispatcherState>,
}

impl Dispatcher {
    pub fn new(queue: impl Into<String>, prefetch: u16, handler: Arc<dyn MessageHandler>) -> Self {
        let (state_tx, _) = watch::channel(DispatcherState::Idle);
        Self {
            queue: queue.into(),
            prefetch,
            handler,
            state_tx,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Watches the dispatcher's state transitions.
    pub fn state(&self) -> watch::Receiver<DispatcherState> {
        self.state_tx.subscribe()
    }

    /// Runs until shutdown is signalled or a fatal error occurs.
    ///
    /// Returns `Ok(())` on shutdown. On every exit path the dispatcher moves
    /// to `Closed` and closes its channel, so any unacknowledged delivery
    /// goes back to the queue.
    #[instrument(skip_all, fields(queue = %self.queue))]
    pub async fn run(
        &self,
        broker: Arc<dyn Broker>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        let channel = match broker.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                self.state_tx.send_replace(DispatcherState::Closed);
                error!(error = %e, "Could not open a channel");
                return Err(e);
            }
        };

        let result = self.consume(channel.as_ref(), shutdown_rx).await;

        self.state_tx.send_replace(DispatcherState::Closed);
        if let Err(e) = channel.close().await {
            warn!(error = %e, "Failed to close channel cleanly");
        }
        match &result {
            Ok(()) => info!("Dispatcher closed."),
            Err(e) => error!(error = %e, "Dispatcher stopped"),
        }
        result
    }

    async fn consume(
        &self,
        channel: &dyn BrokerChannel,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        channel.declare_queue(&self.queue).await?;
        channel.set_prefetch(self.prefetch).await?;
        let consumer_tag = format!("brewq-{}-{}", self.queue, std::process::id());
        let mut deliveries = channel.subscribe(&self.queue, &consumer_tag).await?;

        self.state_tx.send_replace(DispatcherState::Subscribed);
        info!(prefetch = self.prefetch, "Ready for work. To exit press CTRL+C");

        loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!("Dispatcher received shutdown signal.");
                    return Ok(());
                }
                next = deliveries.next_delivery() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(PipelineError::Transport(format!(
                        "consumer on '{}' was cancelled",
                        self.queue
                    )))
                }
            };

            self.state_tx.send_replace(DispatcherState::Handling);
            info!(
                delivery_tag = delivery.handle.tag(),
                redelivered = delivery.redelivered,
                "[x] Received {}",
                delivery.payload
            );

            let outcome = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!(
                        delivery_tag = delivery.handle.tag(),
                        "Shutdown during handling, abandoning delivery to the broker."
                    );
                    return Ok(());
                }
                outcome = self.handler.handle(&delivery.payload, &delivery.handle) => outcome,
            };

            self.settle(channel, delivery, outcome).await?;
            self.state_tx.send_replace(DispatcherState::Subscribed);
        }
    }

    /// Acts on a handler outcome for one delivery.
    async fn settle(
        &self,
        channel: &dyn BrokerChannel,
        delivery: Delivery,
        outcome: HandlerOutcome,
    ) -> Result<(), PipelineError> {
        let tag = delivery.handle.tag();
        match outcome {
            HandlerOutcome::Success => {
                channel.ack(delivery.handle).await?;
                metrics::counter!("messages_acked_total", "queue" => self.queue.clone())
                    .increment(1);
                debug!(delivery_tag = tag, "Acknowledged delivery");
                Ok(())
            }
            HandlerOutcome::Retryable(reason) if !delivery.redelivered => {
                warn!(delivery_tag = tag, reason = %reason, "Handler asked for a retry, requeueing");
                channel.nack(delivery.handle, true).await?;
                metrics::counter!("messages_nacked_total", "queue" => self.queue.clone())
                    .increment(1);
                Ok(())
            }
            HandlerOutcome::Retryable(reason) => Err(PipelineError::HandlerFault {
                queue: self.queue.clone(),
                reason: format!("retry failed on redelivery: {}", reason),
            }),
            HandlerOutcome::Fatal(reason) => Err(PipelineError::HandlerFault {
                queue: self.queue.clone(),
                reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::core::{DeliveryHandle, MessagePayload};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays a fixed list of outcomes, then succeeds.
    struct ScriptedHandler {
        outcomes: Mutex<Vec<HandlerOutcome>>,
    }

    impl ScriptedHandler {
        fn new(mut outcomes: Vec<HandlerOutcome>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
            }
        }
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        async fn handle(&self, _: &MessagePayload, _: &DeliveryHandle) -> HandlerOutcome {
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(HandlerOutcome::Success)
        }
    }

    #[tokio::test]
    async fn test_success_acks_and_shutdown_closes() {
        let broker = InMemoryBroker::new();
        broker.seed("q", ["one", "two"]);
        let dispatcher = Arc::new(Dispatcher::new("q", 1, Arc::new(ScriptedHandler::new(vec![]))));
        let mut state = dispatcher.state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let dispatcher = dispatcher.clone();
            let broker: Arc<dyn Broker> = Arc::new(broker.clone());
            tokio::spawn(async move { dispatcher.run(broker, shutdown_rx).await })
        };

        assert!(broker.wait_for_acks(2, Duration::from_secs(2)).await);
        shutdown_tx.send(true).unwrap();
        let result = task.await.unwrap();

        assert!(result.is_ok());
        assert_eq!(*state.borrow_and_update(), DispatcherState::Closed);
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_retryable_twice_becomes_fault() {
        let broker = InMemoryBroker::new();
        broker.seed("q", ["flaky"]);
        let handler = ScriptedHandler::new(vec![
            HandlerOutcome::Retryable("busy".into()),
            HandlerOutcome::Retryable("still busy".into()),
        ]);
        let dispatcher = Dispatcher::new("q", 1, Arc::new(handler));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let result = dispatcher.run(Arc::new(broker.clone()), shutdown_rx).await;

        assert!(matches!(result, Err(PipelineError::HandlerFault { ref queue, .. }) if queue == "q"));
        assert_eq!(broker.nacked().len(), 1);
        assert_eq!(broker.ready_messages("q"), vec!["flaky"]);
    }

    #[tokio::test]
    async fn test_already_stopped_does_not_subscribe() {
        let broker = InMemoryBroker::new();
        let dispatcher = Dispatcher::new("q", 1, Arc::new(ScriptedHandler::new(vec![])));
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);

        let result = dispatcher.run(Arc::new(broker.clone()), shutdown_rx).await;

        assert!(result.is_ok());
        assert!(!broker.queue_exists("q"));
    }
}
