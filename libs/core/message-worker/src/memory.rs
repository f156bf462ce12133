//! In-process broker for tests and local runs.
//!
//! - Queues are FIFO; a message is delivered to one receiver.
//! - A topic fans out to the subscriptions open when the message is
//!   published. A name becomes a topic when its first subscription opens or
//!   through [`InMemoryBroker::declare_topic`]; publishing to a topic with no
//!   subscriptions drops the message. Any other name is a queue.
//! - Abandoned messages go back to the front of their queue with an
//!   incremented delivery count, after the redelivery delay.
//! - Dead-lettered messages are moved to the `<entity>:dlq` queue.
//! - Filter expressions are not supported.

use crate::broker::{
    BrokerConnector, MessagePublisher, SubscriptionHandle, SubscriptionRequest,
    dead_letter_destination,
};
use crate::error::BrokerError;
use crate::message::InboundMessage;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

const CONNECTOR: &str = "in-memory";
const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

struct Delayed {
    due: Instant,
    key: String,
    message: InboundMessage,
}

#[derive(Default)]
struct State {
    /// Pending messages per queue key ("queue" or "topic/subscription")
    queues: HashMap<String, VecDeque<InboundMessage>>,
    /// Subscriptions per topic
    topics: HashMap<String, Vec<String>>,
    /// Received but unsettled messages: (queue key, message id)
    in_flight: HashMap<(String, String), InboundMessage>,
    /// Abandoned messages waiting out the redelivery delay
    delayed: Vec<Delayed>,
    acknowledged: Vec<String>,
    abandoned: Vec<String>,
    dead_lettered: Vec<String>,
    fail_open: HashSet<String>,
}

impl State {
    /// Requeue delayed messages that are due; returns the next due time.
    fn release_due(&mut self, now: Instant) -> Option<Instant> {
        let (due, waiting): (Vec<Delayed>, Vec<Delayed>) =
            std::mem::take(&mut self.delayed).into_iter().partition(|d| d.due <= now);
        self.delayed = waiting;

        for delayed in due.into_iter().rev() {
            self.queues
                .entry(delayed.key)
                .or_default()
                .push_front(delayed.message);
        }
        self.delayed.iter().map(|d| d.due).min()
    }
}

/// Broker held entirely in memory.
pub struct InMemoryBroker {
    state: Mutex<State>,
    notify: Notify,
    receive_timeout: Duration,
    redelivery_delay: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            redelivery_delay: Duration::ZERO,
        }
    }

    /// How long `receive` waits for a message before returning an empty batch.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// How long an abandoned message waits before it can be received again.
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Treat `name` as a topic before any subscription to it is open.
    pub fn declare_topic(&self, name: impl Into<String>) {
        self.state.lock().topics.entry(name.into()).or_default();
    }

    /// Make `open_subscription` fail for queue or topic `name`.
    pub fn fail_subscription(&self, name: impl Into<String>) {
        self.state.lock().fail_open.insert(name.into());
    }

    /// Queue a message directly, bypassing topic fan-out.
    pub fn push(&self, key: impl Into<String>, message: InboundMessage) {
        self.state
            .lock()
            .queues
            .entry(key.into())
            .or_default()
            .push_back(message);
        self.notify.notify_waiters();
    }

    /// IDs of acknowledged messages, in order.
    pub fn acknowledged(&self) -> Vec<String> {
        self.state.lock().acknowledged.clone()
    }

    /// IDs of abandoned messages, in order (repeats for each abandon).
    pub fn abandoned(&self) -> Vec<String> {
        self.state.lock().abandoned.clone()
    }

    /// IDs of dead-lettered messages, in order.
    pub fn dead_lettered(&self) -> Vec<String> {
        self.state.lock().dead_lettered.clone()
    }

    /// Messages waiting under a queue key.
    pub fn pending(&self, key: &str) -> usize {
        self.state.lock().queues.get(key).map_or(0, VecDeque::len)
    }

    /// Received messages not yet acknowledged or abandoned.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    fn queue_key(entity: &str, subscription: Option<&str>) -> String {
        match subscription {
            Some(subscription) => format!("{}/{}", entity, subscription),
            None => entity.to_string(),
        }
    }

    /// Take a batch, or report when the next delayed message comes due.
    fn take_batch(
        &self,
        handle: &SubscriptionHandle,
    ) -> Result<(Vec<InboundMessage>, Option<Instant>), BrokerError> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let next_due = state.release_due(Instant::now());
        let queue = state
            .queues
            .get_mut(&handle.id)
            .ok_or_else(|| BrokerError::UnknownSubscription(handle.id.clone()))?;

        let count = queue.len().min(handle.take_quantity as usize);
        let batch: Vec<InboundMessage> = queue.drain(..count).collect();
        for message in &batch {
            state.in_flight.insert(
                (handle.id.clone(), message.metadata.message_id.clone()),
                message.clone(),
            );
        }
        Ok((batch, next_due))
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn open_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionHandle, BrokerError> {
        if let Some(filter) = &request.filter {
            return Err(BrokerError::Unsupported {
                connector: CONNECTOR,
                what: format!("filter expression '{}'", filter),
            });
        }

        let mut state = self.state.lock();
        if state.fail_open.contains(&request.name) {
            return Err(BrokerError::Unavailable(format!(
                "subscription to {} refused",
                request.name
            )));
        }

        let key = Self::queue_key(&request.name, request.subscription.as_deref());
        if let Some(subscription) = &request.subscription {
            let subscriptions = state.topics.entry(request.name.clone()).or_default();
            if !subscriptions.contains(subscription) {
                subscriptions.push(subscription.clone());
            }
            // Published while the name was not yet known as a topic
            if let Some(stale) = state.queues.remove(&request.name).filter(|q| !q.is_empty()) {
                debug!(topic = %request.name, count = stale.len(), "Dropped messages published before any subscription");
            }
        }
        state.queues.entry(key.clone()).or_default();

        debug!(key = %key, "Opened in-memory subscription");
        Ok(SubscriptionHandle::new(request, key))
    }

    async fn receive(&self, handle: &SubscriptionHandle) -> Result<Vec<InboundMessage>, BrokerError> {
        let deadline = tokio::time::Instant::now() + self.receive_timeout;
        // Abandoned messages come straight back; let other tasks run between batches.
        tokio::task::yield_now().await;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, next_due) = self.take_batch(handle)?;
            if !batch.is_empty() {
                trace!(key = %handle.id, count = batch.len(), "Delivered batch");
                return Ok(batch);
            }

            let wake = next_due.map_or(deadline, |due| due.min(deadline));
            if tokio::time::timeout_at(wake, notified).await.is_err() && wake >= deadline {
                return Ok(Vec::new());
            }
        }
    }

    async fn acknowledge(&self, handle: &SubscriptionHandle, message_id: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if state
            .in_flight
            .remove(&(handle.id.clone(), message_id.to_string()))
            .is_some()
        {
            state.acknowledged.push(message_id.to_string());
        }
        Ok(())
    }

    async fn abandon(&self, handle: &SubscriptionHandle, message_id: &str) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock();
            let Some(mut message) = state
                .in_flight
                .remove(&(handle.id.clone(), message_id.to_string()))
            else {
                return Ok(());
            };

            message.metadata.delivery_count += 1;
            state.abandoned.push(message_id.to_string());
            if self.redelivery_delay.is_zero() {
                state
                    .queues
                    .entry(handle.id.clone())
                    .or_default()
                    .push_front(message);
            } else {
                state.delayed.push(Delayed {
                    due: Instant::now() + self.redelivery_delay,
                    key: handle.id.clone(),
                    message,
                });
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(
        &self,
        handle: &SubscriptionHandle,
        message: &InboundMessage,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let message_id = message.message_id();
        let destination = dead_letter_destination(&handle.entity);
        {
            let mut state = self.state.lock();
            let Some(message) = state
                .in_flight
                .remove(&(handle.id.clone(), message_id.to_string()))
            else {
                return Ok(());
            };

            state.dead_lettered.push(message_id.to_string());
            state.queues.entry(destination.clone()).or_default().push_back(message);
        }
        debug!(message_id = %message_id, dlq = %destination, reason, "Dead-lettered message");
        self.notify.notify_waiters();
        Ok(())
    }

    fn name(&self) -> &'static str {
        CONNECTOR
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBroker {
    async fn publish(&self, destination: &str, payload: Vec<u8>) -> Result<String, BrokerError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.state.lock();
            let keys: Vec<String> = match state.topics.get(destination) {
                Some(subscriptions) => subscriptions
                    .iter()
                    .map(|sub| Self::queue_key(destination, Some(sub)))
                    .collect(),
                None => vec![destination.to_string()],
            };
            if keys.is_empty() {
                debug!(topic = %destination, message_id = %message_id, "No subscriptions, message dropped");
            }

            for key in keys {
                let message = InboundMessage::new(message_id.clone(), payload.clone())
                    .with_content_type("application/json");
                state.queues.entry(key).or_default().push_back(message);
            }
        }
        self.notify.notify_waiters();
        Ok(message_id)
    }
}
