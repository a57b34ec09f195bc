use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use serde::Deserialize;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::{
    ConsumerParameter, Envelope, Headers, ProducerParameter,
    cartridge::Cartridge,
    consumer::{Acknowledge, Delivery, Receiver},
    transport::{RawPayload, Sender},
};

/// Settings of an in-memory connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InMemorySettings {
    /// Deliveries after which an abandoned message is dead-lettered.
    #[serde(default = "default_max_delivery_count")]
    pub max_delivery_count: u32,
    /// Lease length; the handler's cancellation token fires once it elapses.
    #[serde(default)]
    pub lock_duration_ms: Option<u64>,
    /// Completed messages kept per queue for inspection; older ones are
    /// only counted.
    #[serde(default = "default_completed_retention")]
    pub completed_retention: usize,
}

fn default_max_delivery_count() -> u32 {
    10
}

fn default_completed_retention() -> usize {
    100
}

impl Default for InMemorySettings {
    fn default() -> Self {
        Self {
            max_delivery_count: default_max_delivery_count(),
            lock_duration_ms: None,
            completed_retention: default_completed_retention(),
        }
    }
}

/// A message held by the in-memory broker.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// Broker-assigned, increasing per broker.
    pub sequence: u64,
    pub headers: Headers,
    pub payload: Vec<u8>,
    /// How many times the message has been handed to a receiver.
    pub delivery_count: u32,
}

/// Counters for a single queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    /// Number of abandon operations, including those that dead-lettered.
    pub abandoned: usize,
    pub dead_lettered: usize,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<u64, StoredMessage>,
    /// Most recent completions, bounded by `completed_retention`.
    recent_completed: VecDeque<StoredMessage>,
    completed: usize,
    dead_letters: Vec<StoredMessage>,
    abandoned: usize,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    next_sequence: u64,
    closed: bool,
}

enum Take {
    Message(StoredMessage),
    Empty,
    Closed,
}

struct Shared {
    settings: InMemorySettings,
    state: Mutex<State>,
    notify: Notify,
}

/// In-memory broker for testing or local pipelines.
///
/// Queues are created on first use. Abandoned messages go back to the front
/// of their queue until they reach `max_delivery_count` deliveries, then move
/// to the queue's dead letters. It is useful for:
/// - Unit and integration testing
/// - Simulating message delivery without a real broker
/// - Debugging message flows
///
/// Dead letters are kept until the broker is dropped, while completed
/// messages are counted and only the last `completed_retention` of them are
/// kept. The broker is not meant for long-running production traffic.
///
/// Cloning the broker yields another handle to the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemorySettings::default())
    }
}

impl InMemoryBroker {
    pub fn new(settings: InMemorySettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn settings(&self) -> &InMemorySettings {
        &self.shared.settings
    }

    /// Whether two handles point at the same broker.
    pub fn same_broker(&self, other: &InMemoryBroker) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Append a message to `queue`.
    pub async fn publish(
        &self,
        queue: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<(), InMemoryError> {
        {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return Err(InMemoryError::closed());
            }
            state.next_sequence += 1;
            let message = StoredMessage {
                sequence: state.next_sequence,
                headers,
                payload,
                delivery_count: 0,
            };
            state
                .queues
                .entry(queue.to_owned())
                .or_default()
                .ready
                .push_back(message);
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Stop accepting messages.
    ///
    /// Receivers end once their queue is drained and nothing is in flight.
    pub async fn close(&self) {
        self.shared.state.lock().await.closed = true;
        self.shared.notify.notify_waiters();
    }

    /// Messages waiting to be delivered.
    pub async fn pending(&self, queue: &str) -> Vec<StoredMessage> {
        self.inspect(queue, |q| q.ready.iter().cloned().collect())
            .await
    }

    /// The most recently completed messages, oldest first.
    pub async fn completed(&self, queue: &str) -> Vec<StoredMessage> {
        self.inspect(queue, |q| q.recent_completed.iter().cloned().collect())
            .await
    }

    /// Messages that exhausted their deliveries.
    pub async fn dead_letters(&self, queue: &str) -> Vec<StoredMessage> {
        self.inspect(queue, |q| q.dead_letters.clone()).await
    }

    pub async fn stats(&self, queue: &str) -> QueueStats {
        self.inspect(queue, |q| QueueStats {
            pending: q.ready.len(),
            in_flight: q.in_flight.len(),
            completed: q.completed,
            abandoned: q.abandoned,
            dead_lettered: q.dead_letters.len(),
        })
        .await
    }

    async fn inspect<T: Default>(&self, queue: &str, f: impl FnOnce(&Queue) -> T) -> T {
        let state = self.shared.state.lock().await;
        state.queues.get(queue).map(f).unwrap_or_default()
    }

    async fn take(&self, queue: &str) -> Take {
        let mut state = self.shared.state.lock().await;
        let closed = state.closed;
        let Some(q) = state.queues.get_mut(queue) else {
            return if closed { Take::Closed } else { Take::Empty };
        };

        match q.ready.pop_front() {
            Some(mut message) => {
                message.delivery_count += 1;
                q.in_flight.insert(message.sequence, message.clone());
                Take::Message(message)
            }
            None if closed && q.in_flight.is_empty() => Take::Closed,
            None => Take::Empty,
        }
    }

    async fn complete(&self, queue: &str, sequence: u64) -> Result<(), InMemoryError> {
        let retention = self.shared.settings.completed_retention;
        {
            let mut state = self.shared.state.lock().await;
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(InMemoryError::unknown_delivery)?;
            let message = q
                .in_flight
                .remove(&sequence)
                .ok_or_else(InMemoryError::unknown_delivery)?;
            q.completed += 1;
            if retention > 0 {
                if q.recent_completed.len() == retention {
                    q.recent_completed.pop_front();
                }
                q.recent_completed.push_back(message);
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn abandon(&self, queue: &str, sequence: u64) -> Result<(), InMemoryError> {
        let max_delivery_count = self.shared.settings.max_delivery_count;
        {
            let mut state = self.shared.state.lock().await;
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(InMemoryError::unknown_delivery)?;
            let message = q
                .in_flight
                .remove(&sequence)
                .ok_or_else(InMemoryError::unknown_delivery)?;
            q.abandoned += 1;

            if message.delivery_count >= max_delivery_count {
                tracing::warn!(
                    queue,
                    sequence,
                    delivery_count = message.delivery_count,
                    "Message dead-lettered"
                );
                q.dead_letters.push(message);
            } else {
                q.ready.push_front(message);
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

/// In-memory sender bound to one queue.
#[derive(Clone)]
pub struct InMemory {
    broker: InMemoryBroker,
    queue: String,
}

impl InMemory {
    pub fn new(broker: InMemoryBroker, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
        }
    }
}

#[async_trait::async_trait]
impl Sender<Headers, RawPayload> for InMemory {
    type Error = InMemoryError;

    /// "Send" a message by appending it to the in-memory queue.
    #[tracing::instrument(skip_all, fields(queue = %self.queue))]
    async fn send(&mut self, envelope: Envelope<Headers, RawPayload>) -> Result<(), Self::Error> {
        tracing::debug!(
            headers = ?envelope.headers,
            size = envelope.message.len(),
            "Message sent to in-memory queue",
        );
        self.broker
            .publish(&self.queue, envelope.headers, envelope.message.into_inner())
            .await
    }
}

/// In-memory receiver bound to one queue.
pub struct InMemoryReceiver {
    broker: InMemoryBroker,
    queue: String,
}

impl InMemoryReceiver {
    pub fn new(broker: InMemoryBroker, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
        }
    }

    fn lease(&self, cancel: &CancellationToken) -> CancellationToken {
        let lease = cancel.child_token();
        if let Some(ms) = self.broker.settings().lock_duration_ms {
            let expiry = lease.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => expiry.cancel(),
                    _ = expiry.cancelled() => {}
                }
            });
        }
        lease
    }
}

#[async_trait::async_trait]
impl Receiver for InMemoryReceiver {
    type Error = InMemoryError;
    type Acker = InMemoryAcker;

    async fn receive(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery<InMemoryAcker>>, InMemoryError> {
        loop {
            let notified = self.broker.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.broker.take(&self.queue).await {
                Take::Message(message) => {
                    let lease = self.lease(cancel);
                    return Ok(Some(Delivery {
                        headers: message.headers,
                        payload: RawPayload::from(message.payload),
                        acker: InMemoryAcker {
                            broker: self.broker.clone(),
                            queue: self.queue.clone(),
                            sequence: message.sequence,
                            lease: lease.clone(),
                        },
                        lease,
                    }));
                }
                Take::Closed => return Ok(None),
                Take::Empty => {}
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Ok(None),
            }
        }
    }
}

/// Settles an in-memory delivery.
#[derive(Debug)]
pub struct InMemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    sequence: u64,
    lease: CancellationToken,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("settings", &self.shared.settings)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Acknowledge for InMemoryAcker {
    type Error = InMemoryError;

    async fn complete(self) -> Result<(), InMemoryError> {
        self.lease.cancel();
        self.broker.complete(&self.queue, self.sequence).await
    }

    async fn abandon(self) -> Result<(), InMemoryError> {
        self.lease.cancel();
        self.broker.abandon(&self.queue, self.sequence).await
    }
}

/// Cartridge creating one [`InMemoryBroker`] per connection id.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryCartridge;

#[async_trait::async_trait]
impl Cartridge for InMemoryCartridge {
    const NAME: &'static str = "inmemory";

    type Settings = InMemorySettings;
    type Client = InMemoryBroker;
    type Sender = InMemory;
    type Receiver = InMemoryReceiver;

    async fn connect(&self, settings: InMemorySettings) -> Result<InMemoryBroker, tower::BoxError> {
        Ok(InMemoryBroker::new(settings))
    }

    async fn sender(
        &self,
        client: &InMemoryBroker,
        parameter: &ProducerParameter,
    ) -> Result<InMemory, tower::BoxError> {
        Ok(InMemory::new(client.clone(), parameter.destination()))
    }

    async fn receiver(
        &self,
        client: &InMemoryBroker,
        parameter: &ConsumerParameter,
    ) -> Result<InMemoryReceiver, tower::BoxError> {
        Ok(InMemoryReceiver::new(client.clone(), parameter.destination()))
    }
}

/// Error type for in-memory broker operations.
#[derive(Debug)]
pub struct InMemoryError {
    kind: InMemoryErrorKind,
}

impl InMemoryError {
    fn closed() -> Self {
        Self {
            kind: InMemoryErrorKind::Closed,
        }
    }

    fn unknown_delivery() -> Self {
        Self {
            kind: InMemoryErrorKind::UnknownDelivery,
        }
    }
}

impl std::fmt::Display for InMemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryErrorKind::Closed => write!(f, "In-memory broker is closed"),
            InMemoryErrorKind::UnknownDelivery => {
                write!(f, "Delivery is not in flight on the in-memory broker")
            }
        }
    }
}

impl std::error::Error for InMemoryError {}

#[derive(Debug)]
enum InMemoryErrorKind {
    Closed,
    UnknownDelivery,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn receive_one(receiver: &mut InMemoryReceiver) -> Delivery<InMemoryAcker> {
        receiver
            .receive(&CancellationToken::new())
            .await
            .unwrap()
            .expect("a delivery")
    }

    #[tokio::test]
    async fn abandoned_messages_are_redelivered_then_dead_lettered() {
        let broker = InMemoryBroker::new(InMemorySettings {
            max_delivery_count: 2,
            ..InMemorySettings::default()
        });
        broker
            .publish("jobs", Headers::new(), b"payload".to_vec())
            .await
            .unwrap();
        let mut receiver = InMemoryReceiver::new(broker.clone(), "jobs");

        receive_one(&mut receiver).await.acker.abandon().await.unwrap();
        assert_eq!(broker.pending("jobs").await[0].delivery_count, 1);

        receive_one(&mut receiver).await.acker.abandon().await.unwrap();

        let stats = broker.stats("jobs").await;
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.abandoned, 2);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(broker.dead_letters("jobs").await[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn receiver_waits_for_publish() {
        let broker = InMemoryBroker::default();
        let mut receiver = InMemoryReceiver::new(broker.clone(), "jobs");

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish("jobs", Headers::new(), b"late".to_vec())
                .await
                .unwrap();
        });

        let delivery = receive_one(&mut receiver).await;
        assert_eq!(delivery.payload, RawPayload::from(b"late".to_vec()));
        delivery.acker.complete().await.unwrap();
        assert_eq!(broker.stats("jobs").await.completed, 1);
    }

    #[tokio::test]
    async fn completed_messages_are_counted_but_only_recent_ones_kept() {
        let broker = InMemoryBroker::new(InMemorySettings {
            completed_retention: 2,
            ..InMemorySettings::default()
        });
        let mut receiver = InMemoryReceiver::new(broker.clone(), "jobs");
        for payload in [b"one", b"two", b"six"] {
            broker
                .publish("jobs", Headers::new(), payload.to_vec())
                .await
                .unwrap();
            receive_one(&mut receiver).await.acker.complete().await.unwrap();
        }

        assert_eq!(broker.stats("jobs").await.completed, 3);
        let kept: Vec<_> = broker
            .completed("jobs")
            .await
            .into_iter()
            .map(|message| message.payload)
            .collect();
        assert_eq!(kept, vec![b"two".to_vec(), b"six".to_vec()]);
    }

    #[tokio::test]
    async fn zero_retention_keeps_only_the_count() {
        let broker = InMemoryBroker::new(InMemorySettings {
            completed_retention: 0,
            ..InMemorySettings::default()
        });
        broker
            .publish("jobs", Headers::new(), b"done".to_vec())
            .await
            .unwrap();
        let mut receiver = InMemoryReceiver::new(broker.clone(), "jobs");
        receive_one(&mut receiver).await.acker.complete().await.unwrap();

        assert_eq!(broker.stats("jobs").await.completed, 1);
        assert!(broker.completed("jobs").await.is_empty());
    }

    #[tokio::test]
    async fn closed_broker_ends_receivers_once_drained() {
        let broker = InMemoryBroker::default();
        broker
            .publish("jobs", Headers::new(), b"last".to_vec())
            .await
            .unwrap();
        broker.close().await;

        let mut receiver = InMemoryReceiver::new(broker.clone(), "jobs");
        let delivery = receive_one(&mut receiver).await;
        delivery.acker.complete().await.unwrap();

        let next = receiver.receive(&CancellationToken::new()).await.unwrap();
        assert!(next.is_none());
        assert!(
            broker
                .publish("jobs", Headers::new(), Vec::new())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn lease_expires_after_lock_duration() {
        let broker = InMemoryBroker::new(InMemorySettings {
            lock_duration_ms: Some(10),
            ..InMemorySettings::default()
        });
        broker
            .publish("jobs", Headers::new(), Vec::new())
            .await
            .unwrap();
        let mut receiver = InMemoryReceiver::new(broker.clone(), "jobs");

        let delivery = receive_one(&mut receiver).await;
        tokio::time::timeout(Duration::from_secs(1), delivery.lease.cancelled())
            .await
            .expect("lease should expire");
    }

    #[tokio::test]
    async fn settling_twice_is_an_error() {
        let broker = InMemoryBroker::default();
        broker
            .publish("jobs", Headers::new(), Vec::new())
            .await
            .unwrap();

        let delivery = receive_one(&mut InMemoryReceiver::new(broker.clone(), "jobs")).await;
        broker.complete("jobs", delivery.acker.sequence).await.unwrap();

        assert!(delivery.acker.complete().await.is_err());
    }
}
