//! Consume-side guarantees: prefetch ceiling, ack ordering and fault handling.

mod helpers;

use async_trait::async_trait;
use brewq::broker::memory::InMemoryBroker;
use brewq::core::{Broker, DeliveryHandle, HandlerOutcome, MessageHandler, MessagePayload};
use brewq::dispatcher::{Dispatcher, DispatcherState};
use brewq::error::PipelineError;
use helpers::wait_until;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Records what the broker looked like each time a payload was handled.
struct ObservingHandler {
    broker: InMemoryBroker,
    seen: Mutex<Vec<(String, usize, usize)>>,
    fail_on: Option<String>,
}

impl ObservingHandler {
    fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            seen: Mutex::new(Vec::new()),
            fail_on: None,
        }
    }

    fn failing_on(mut self, payload: &str) -> Self {
        self.fail_on = Some(payload.to_string());
        self
    }

    /// `(payload, unacked at handling time, acks so far)` per call.
    fn seen(&self) -> Vec<(String, usize, usize)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for ObservingHandler {
    async fn handle(&self, payload: &MessagePayload, _delivery: &DeliveryHandle) -> HandlerOutcome {
        let text = payload.to_string();
        self.seen.lock().unwrap().push((
            text.clone(),
            self.broker.unacked_count(),
            self.broker.acked().len(),
        ));
        tokio::time::sleep(Duration::from_millis(5)).await;
        if self.fail_on.as_deref() == Some(text.as_str()) {
            return HandlerOutcome::Fatal(format!("cannot process {}", text));
        }
        HandlerOutcome::Success
    }
}

fn spawn_dispatcher(
    dispatcher: Arc<Dispatcher>,
    broker: &InMemoryBroker,
    shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<Result<(), PipelineError>> {
    let broker: Arc<dyn Broker> = Arc::new(broker.clone());
    tokio::spawn(async move { dispatcher.run(broker, shutdown_rx).await })
}

#[tokio::test]
async fn test_prefetch_one_keeps_single_delivery_outstanding() {
    let broker = InMemoryBroker::new();
    broker.seed("q", ["m1", "m2", "m3", "m4"]);
    let handler = Arc::new(ObservingHandler::new(broker.clone()));
    let dispatcher = Arc::new(Dispatcher::new("q", 1, handler.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = spawn_dispatcher(dispatcher, &broker, shutdown_rx);
    assert!(broker.wait_for_acks(4, Duration::from_secs(2)).await);
    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(broker.max_unacked_per_channel(), 1);
    assert!(handler.seen().iter().all(|(_, unacked, _)| *unacked == 1));
}

#[tokio::test]
async fn test_each_message_acked_before_next_delivery() {
    let broker = InMemoryBroker::new();
    broker.seed("q", ["m1", "m2", "m3"]);
    let handler = Arc::new(ObservingHandler::new(broker.clone()));
    let dispatcher = Arc::new(Dispatcher::new("q", 1, handler.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = spawn_dispatcher(dispatcher, &broker, shutdown_rx);
    assert!(broker.wait_for_acks(3, Duration::from_secs(2)).await);
    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    let seen = handler.seen();
    let order: Vec<&str> = seen.iter().map(|(p, _, _)| p.as_str()).collect();
    assert_eq!(order, vec!["m1", "m2", "m3"]);
    // When m(n) is handled, exactly n-1 messages have been acknowledged.
    for (index, (_, _, acked)) in seen.iter().enumerate() {
        assert_eq!(*acked, index);
    }
    let acked: Vec<String> = broker.acked().into_iter().map(|(_, p)| p).collect();
    assert_eq!(acked, vec!["m1", "m2", "m3"]);
}

#[tokio::test]
async fn test_fatal_outcome_stops_and_leaves_message_queued() {
    let broker = InMemoryBroker::new();
    broker.seed("q", ["m1", "bad", "m3"]);
    let handler = Arc::new(ObservingHandler::new(broker.clone()).failing_on("bad"));
    let dispatcher = Arc::new(Dispatcher::new("q", 1, handler.clone()));
    let mut state = dispatcher.state();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = spawn_dispatcher(dispatcher, &broker, shutdown_rx)
        .await
        .unwrap();

    match result {
        Err(PipelineError::HandlerFault { queue, reason }) => {
            assert_eq!(queue, "q");
            assert!(reason.contains("bad"));
        }
        other => panic!("expected a handler fault, got {:?}", other),
    }
    assert_eq!(*state.borrow_and_update(), DispatcherState::Closed);
    assert_eq!(broker.acked().len(), 1);
    assert!(broker.nacked().is_empty());
    assert_eq!(broker.ready_messages("q"), vec!["bad", "m3"]);
    assert_eq!(broker.head_is_redelivered("q"), Some(true));
    assert_eq!(handler.seen().len(), 2, "m3 must never be delivered");
}

#[tokio::test]
async fn test_shutdown_while_waiting_closes_cleanly() {
    let broker = InMemoryBroker::new();
    let handler = Arc::new(ObservingHandler::new(broker.clone()));
    let dispatcher = Arc::new(Dispatcher::new("q", 1, handler));
    let state = dispatcher.state();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = spawn_dispatcher(dispatcher, &broker, shutdown_rx);
    assert!(
        wait_until(Duration::from_secs(2), || {
            *state.borrow() == DispatcherState::Subscribed
        })
        .await
    );
    assert!(broker.queue_exists("q"), "queue is declared on subscribe");

    shutdown_tx.send(true).unwrap();
    let result = task.await.unwrap();

    assert!(result.is_ok());
    assert_eq!(*state.borrow(), DispatcherState::Closed);
    assert_eq!(broker.open_channel_count(), 0);
}

#[tokio::test]
async fn test_connection_loss_is_transport_error() {
    let broker = InMemoryBroker::new();
    let handler = Arc::new(ObservingHandler::new(broker.clone()));
    let dispatcher = Arc::new(Dispatcher::new("q", 1, handler));
    let state = dispatcher.state();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = spawn_dispatcher(dispatcher, &broker, shutdown_rx);
    assert!(
        wait_until(Duration::from_secs(2), || {
            *state.borrow() == DispatcherState::Subscribed
        })
        .await
    );
    broker.disconnect();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(PipelineError::Transport(_))));
    assert_eq!(*state.borrow(), DispatcherState::Closed);
}

#[tokio::test]
async fn test_unacked_delivery_returns_to_queue_on_shutdown() {
    struct Stuck;

    #[async_trait]
    impl MessageHandler for Stuck {
        async fn handle(&self, _: &MessagePayload, _: &DeliveryHandle) -> HandlerOutcome {
            std::future::pending::<()>().await;
            HandlerOutcome::Success
        }
    }

    let broker = InMemoryBroker::new();
    broker.seed("q", ["m1"]);
    let dispatcher = Arc::new(Dispatcher::new("q", 1, Arc::new(Stuck)));
    let state = dispatcher.state();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = spawn_dispatcher(dispatcher, &broker, shutdown_rx);
    assert!(
        wait_until(Duration::from_secs(2), || {
            *state.borrow() == DispatcherState::Handling
        })
        .await
    );
    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    assert!(broker.acked().is_empty());
    assert_eq!(broker.ready_messages("q"), vec!["m1"]);
    assert_eq!(broker.head_is_redelivered("q"), Some(true));
}

#[tokio::test]
async fn test_dropped_shutdown_sender_keeps_consuming() {
    let broker = InMemoryBroker::new();
    broker.seed("q", ["m1", "m2"]);
    let handler = Arc::new(ObservingHandler::new(broker.clone()));
    let dispatcher = Arc::new(Dispatcher::new("q", 1, handler.clone()));
    let state = dispatcher.state();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    drop(shutdown_tx);

    let task = spawn_dispatcher(dispatcher, &broker, shutdown_rx);

    assert!(broker.wait_for_acks(2, Duration::from_secs(2)).await);
    assert!(
        wait_until(Duration::from_secs(2), || {
            *state.borrow() == DispatcherState::Subscribed
        })
        .await
    );
    assert!(!task.is_finished(), "dispatcher must stay subscribed");
    task.abort();
}
