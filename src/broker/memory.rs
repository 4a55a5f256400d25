//! An in-process broker for tests.
//!
//! Models the parts of AMQP the pipeline relies on: durable queue declare,
//! FIFO queues, per-channel prefetch ceilings, manual ack/nack, requeue of
//! unacknowledged deliveries when a channel closes, and injected transport
//! failures. It also records what was acknowledged so tests can assert on it.

use crate::{
    core::{Broker, BrokerChannel, Delivery, DeliveryHandle, DeliveryStream, MessagePayload},
    error::PipelineError,
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct Stored {
    payload: MessagePayload,
    redelivered: bool,
}

#[derive(Debug)]
struct MemoryQueue {
    durable: bool,
    ready: VecDeque<Stored>,
}

#[derive(Debug, Default)]
struct ChannelState {
    prefetch: u16,
    unacked: BTreeMap<u64, (String, Stored)>,
}

#[derive(Debug)]
struct State {
    connected: bool,
    queues: HashMap<String, MemoryQueue>,
    /// Open channels only; closing one removes it.
    channels: HashMap<u64, ChannelState>,
    peak_unacked: usize,
    next_channel_id: u64,
    next_tag: u64,
    publish_budget: Option<usize>,
    unroutable: usize,
    acked: Vec<(String, String)>,
    nacked: Vec<(String, String)>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            connected: true,
            queues: HashMap::new(),
            channels: HashMap::new(),
            peak_unacked: 0,
            next_channel_id: 1,
            next_tag: 1,
            publish_budget: None,
            unroutable: 0,
            acked: Vec::new(),
            nacked: Vec::new(),
        }
    }
}

impl State {
    /// Closes a channel and puts its unacknowledged deliveries back at the
    /// head of their queues, in their original order.
    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };
        for (_, (queue, mut stored)) in channel.unacked.into_iter().rev() {
            if let Some(q) = self.queues.get_mut(&queue) {
                stored.redelivered = true;
                q.ready.push_front(stored);
            }
        }
    }

    fn disconnect(&mut self) {
        self.connected = false;
        let ids: Vec<u64> = self.channels.keys().copied().collect();
        for id in ids {
            self.close_channel(id);
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    changed: Notify,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A cloneable handle to one in-memory broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a durable queue and appends `payloads` to it.
    pub fn seed<I, S>(&self, queue: &str, payloads: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<MessagePayload>,
    {
        let mut state = self.inner.state();
        let q = state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| MemoryQueue {
                durable: true,
                ready: VecDeque::new(),
            });
        q.ready.extend(payloads.into_iter().map(|p| Stored {
            payload: p.into(),
            redelivered: false,
        }));
        drop(state);
        self.inner.changed.notify_waiters();
    }

    /// Declares a non-durable queue, for exercising declare conflicts.
    pub fn declare_transient_queue(&self, queue: &str) {
        self.inner.state().queues.insert(
            queue.to_string(),
            MemoryQueue {
                durable: false,
                ready: VecDeque::new(),
            },
        );
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.state().queues.contains_key(queue)
    }

    /// Payload texts waiting in `queue`, head first.
    pub fn ready_messages(&self, queue: &str) -> Vec<String> {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|s| s.payload.to_string()).collect())
            .unwrap_or_default()
    }

    /// Whether the message at the head of `queue` has been delivered before.
    pub fn head_is_redelivered(&self, queue: &str) -> Option<bool> {
        self.inner
            .state()
            .queues
            .get(queue)
            .and_then(|q| q.ready.front().map(|s| s.redelivered))
    }

    /// Unacknowledged deliveries across all open channels.
    pub fn unacked_count(&self) -> usize {
        self.inner
            .state()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    /// The highest number of unacknowledged deliveries any channel ever held.
    pub fn max_unacked_per_channel(&self) -> usize {
        self.inner.state().peak_unacked
    }

    /// `(queue, payload)` pairs in acknowledgment order.
    pub fn acked(&self) -> Vec<(String, String)> {
        self.inner.state().acked.clone()
    }

    /// `(queue, payload)` pairs in rejection order.
    pub fn nacked(&self) -> Vec<(String, String)> {
        self.inner.state().nacked.clone()
    }

    /// Messages published to a queue that did not exist.
    pub fn unroutable_count(&self) -> usize {
        self.inner.state().unroutable
    }

    pub fn open_channel_count(&self) -> usize {
        self.inner.state().channels.len()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state().connected
    }

    /// Lets `n` more publishes succeed, then drops the connection.
    pub fn fail_publishes_after(&self, n: usize) {
        self.inner.state().publish_budget = Some(n);
    }

    /// Simulates losing the connection.
    pub fn disconnect(&self) {
        self.inner.state().disconnect();
        self.inner.changed.notify_waiters();
    }

    /// Polls until `acked()` holds at least `count` entries or `timeout` expires.
    pub async fn wait_for_acks(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inner.state().acked.len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, PipelineError> {
        let mut state = self.inner.state();
        if !state.connected {
            return Err(PipelineError::Transport("connection is closed".to_string()));
        }
        let id = state.next_channel_id;
        state.next_channel_id += 1;
        state.channels.insert(id, ChannelState::default());
        Ok(Box::new(MemoryChannel {
            id,
            inner: self.inner.clone(),
        }))
    }

    async fn close(&self) -> Result<(), PipelineError> {
        self.disconnect();
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    inner: Arc<Inner>,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, State>, PipelineError> {
        let state = self.inner.state();
        if !state.connected || !state.channels.contains_key(&self.id) {
            return Err(PipelineError::Transport("channel is closed".to_string()));
        }
        Ok(state)
    }

    fn settle(&self, handle: DeliveryHandle, requeue: Option<bool>) -> Result<(), PipelineError> {
        let mut state = self.open_state()?;
        let taken = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&handle.tag()));
        let Some((queue, mut stored)) = taken else {
            // A real broker closes the channel on an unknown delivery tag.
            state.close_channel(self.id);
            return Err(PipelineError::Transport(format!(
                "unknown delivery tag {}",
                handle.tag()
            )));
        };

        let record = (queue.clone(), stored.payload.to_string());
        match requeue {
            None => state.acked.push(record),
            Some(requeue) => {
                state.nacked.push(record);
                if requeue {
                    if let Some(q) = state.queues.get_mut(&queue) {
                        stored.redelivered = true;
                        q.ready.push_front(stored);
                    }
                }
            }
        }
        drop(state);
        self.inner.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str) -> Result<(), PipelineError> {
        let mut state = self.open_state()?;
        match state.queues.get(name) {
            Some(existing) if !existing.durable => {
                state.close_channel(self.id);
                Err(PipelineError::Transport(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                    name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    MemoryQueue {
                        durable: true,
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<(), PipelineError> {
        self.open_state()?.queues.remove(name);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &MessagePayload) -> Result<(), PipelineError> {
        let mut state = self.open_state()?;
        if let Some(budget) = state.publish_budget.as_mut() {
            if *budget == 0 {
                state.disconnect();
                drop(state);
                self.inner.changed.notify_waiters();
                return Err(PipelineError::Transport(
                    "connection reset during publish".to_string(),
                ));
            }
            *budget -= 1;
        }

        match state.queues.get_mut(queue) {
            Some(q) => q.ready.push_back(Stored {
                payload: payload.clone(),
                redelivered: false,
            }),
            // The default exchange silently drops messages for unknown queues.
            None => state.unroutable += 1,
        }
        drop(state);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn set_prefetch(&self, limit: u16) -> Result<(), PipelineError> {
        let mut state = self.open_state()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = limit;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<Box<dyn DeliveryStream>, PipelineError> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            state.close_channel(self.id);
            return Err(PipelineError::Transport(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        }
        Ok(Box::new(MemoryDeliveryStream {
            channel_id: self.id,
            queue: queue.to_string(),
            inner: self.inner.clone(),
        }))
    }

    async fn ack(&self, handle: DeliveryHandle) -> Result<(), PipelineError> {
        self.settle(handle, None)
    }

    async fn nack(&self, handle: DeliveryHandle, requeue: bool) -> Result<(), PipelineError> {
        self.settle(handle, Some(requeue))
    }

    async fn close(&self) -> Result<(), PipelineError> {
        self.inner.state().close_channel(self.id);
        self.inner.changed.notify_waiters();
        Ok(())
    }
}

struct MemoryDeliveryStream {
    channel_id: u64,
    queue: String,
    inner: Arc<Inner>,
}

impl MemoryDeliveryStream {
    /// Takes the next deliverable message, if the prefetch ceiling allows one.
    fn try_deliver(&self) -> Option<Option<Result<Delivery, PipelineError>>> {
        let mut guard = self.inner.state();
        let state = &mut *guard;
        if !state.connected {
            return Some(Some(Err(PipelineError::Transport(
                "connection lost".to_string(),
            ))));
        }

        let channel = match state.channels.get_mut(&self.channel_id) {
            Some(channel) => channel,
            None => return Some(None),
        };
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            // Deleting a queue cancels its consumers.
            return Some(None);
        };

        let under_ceiling =
            channel.prefetch == 0 || channel.unacked.len() < usize::from(channel.prefetch);
        if !under_ceiling {
            return None;
        }
        let stored = queue.ready.pop_front()?;

        let tag = state.next_tag;
        state.next_tag += 1;
        channel
            .unacked
            .insert(tag, (self.queue.clone(), stored.clone()));
        state.peak_unacked = state.peak_unacked.max(channel.unacked.len());

        Some(Some(Ok(Delivery {
            handle: DeliveryHandle::new(tag),
            payload: stored.payload,
            redelivered: stored.redelivered,
        })))
    }
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, PipelineError>> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(next) = self.try_deliver() {
                return next;
            }
            notified.await;
        }
    }
}
