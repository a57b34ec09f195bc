//! Kafka cartridge.
//!
//! Producers publish to the destination topic through a shared
//! `FutureProducer`. Consumers subscribe with a `StreamConsumer` in their own
//! consumer group and commit offsets manually once a delivery is completed.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use rdkafka::{
    ClientConfig, Message as _, Offset, TopicPartitionList,
    consumer::{CommitMode, Consumer as _, StreamConsumer},
    error::KafkaError,
    message::{Header, Headers as _, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{
    ConsumerParameter, Envelope, Headers, ProducerParameter,
    cartridge::Cartridge,
    consumer::{Acknowledge, Delivery, Receiver},
    transport::{RawPayload, Sender, ToBytes},
};

/// Settings of a Kafka connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KafkaSettings {
    pub bootstrap_servers: String,
    #[serde(default)]
    pub client_id: Option<String>,
    /// Consumer group used when a consumer parameter carries no subscription.
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    #[serde(default)]
    pub session_timeout_ms: Option<u64>,
    /// Raw librdkafka properties, applied last.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

fn default_message_timeout_ms() -> u64 {
    5_000
}

impl KafkaSettings {
    /// librdkafka configuration shared by producers and consumers.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        if let Some(client_id) = &self.client_id {
            config.set("client.id", client_id);
        }
        if let Some(session_timeout_ms) = self.session_timeout_ms {
            config.set("session.timeout.ms", session_timeout_ms.to_string());
        }
        for (key, value) in &self.properties {
            config.set(key, value);
        }
        config
    }

    fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
}

/// Connection-level Kafka client.
#[derive(Clone)]
pub struct KafkaClient {
    settings: Arc<KafkaSettings>,
    producer: FutureProducer,
}

impl KafkaClient {
    pub fn settings(&self) -> &KafkaSettings {
        &self.settings
    }
}

/// Kafka transport sender bound to one topic.
///
/// Maps the `Envelope` fields as follows:
/// - `message-id` header → Kafka message key
/// - `Envelope.headers` → Kafka message headers
/// - `Envelope.message` → message payload
#[derive(Clone)]
pub struct Kafka {
    /// Kafka producer handle
    producer: FutureProducer,
    topic: String,
    /// Timeout for sending messages
    timeout: Duration,
}

impl Kafka {
    /// Create a new Kafka sender publishing to `topic`.
    ///
    /// Default timeout is 5 seconds.
    pub fn new(producer: FutureProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
            timeout: Duration::from_millis(default_message_timeout_ms()),
        }
    }

    /// Set a custom timeout for sending messages.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Sender<Headers, RawPayload> for Kafka {
    type Error = KafkaError;

    #[tracing::instrument(skip_all, fields(topic = %self.topic))]
    async fn send(&mut self, envelope: Envelope<Headers, RawPayload>) -> Result<(), Self::Error> {
        let key = envelope.headers.message_id().unwrap_or_default();
        let record = FutureRecord::to(&self.topic)
            .payload(envelope.message.to_bytes())
            .key(key)
            .headers(to_kafka_headers(&envelope.headers));

        let (partition, offset) = self
            .producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| e)?;
        tracing::debug!(partition, offset, "Message delivered to Kafka");

        Ok(())
    }
}

/// Kafka receiver subscribed to one topic.
pub struct KafkaReceiver {
    consumer: Arc<StreamConsumer>,
    offsets: Arc<OffsetTracker>,
    seek_timeout: Duration,
}

#[async_trait]
impl Receiver for KafkaReceiver {
    type Error = KafkaError;
    type Acker = KafkaAcker;

    async fn receive(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery<KafkaAcker>>, KafkaError> {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            message = self.consumer.recv() => message?.detach(),
        };

        let headers = message
            .headers()
            .map(from_kafka_headers)
            .unwrap_or_default();
        let payload = RawPayload::from(message.payload().map(<[u8]>::to_vec).unwrap_or_default());

        let position = Position {
            topic: message.topic().to_owned(),
            partition: message.partition(),
        };
        self.offsets.track(&position, message.offset());

        Ok(Some(Delivery {
            headers,
            payload,
            acker: KafkaAcker {
                consumer: Arc::clone(&self.consumer),
                offsets: Arc::clone(&self.offsets),
                position,
                offset: message.offset(),
                seek_timeout: self.seek_timeout,
            },
            lease: cancel.child_token(),
        }))
    }
}

/// Settles a Kafka delivery by committing or rewinding its offset.
///
/// Deliveries of one partition may settle in any order when handlers run
/// concurrently. Offsets are committed only up to the first delivery of the
/// partition that is still unsettled.
pub struct KafkaAcker {
    consumer: Arc<StreamConsumer>,
    offsets: Arc<OffsetTracker>,
    position: Position,
    offset: i64,
    seek_timeout: Duration,
}

#[async_trait]
impl Acknowledge for KafkaAcker {
    type Error = tower::BoxError;

    async fn complete(self) -> Result<(), tower::BoxError> {
        let Some(commit) = self.offsets.complete(&self.position, self.offset) else {
            return Ok(());
        };

        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &self.position.topic,
            self.position.partition,
            Offset::Offset(commit),
        )?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }

    /// Rewind the partition so the message is fetched again.
    ///
    /// Every later offset of the partition is fetched again as well.
    async fn abandon(self) -> Result<(), tower::BoxError> {
        self.offsets.rewind(&self.position, self.offset);

        // librdkafka blocks until the seek is applied.
        let KafkaAcker {
            consumer,
            position,
            offset,
            seek_timeout,
            ..
        } = self;
        tokio::task::spawn_blocking(move || {
            consumer.seek(
                &position.topic,
                position.partition,
                Offset::Offset(offset),
                seek_timeout,
            )
        })
        .await??;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Position {
    topic: String,
    partition: i32,
}

/// Per-partition bookkeeping of fetched offsets.
#[derive(Debug, Default)]
struct OffsetTracker {
    partitions: std::sync::Mutex<HashMap<Position, PartitionOffsets>>,
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    /// Fetched offsets mapped to whether they were completed.
    fetched: BTreeMap<i64, bool>,
    /// Last offset handed to a commit, i.e. the next offset to consume.
    committed: Option<i64>,
}

impl OffsetTracker {
    fn partitions(&self) -> MutexGuard<'_, HashMap<Position, PartitionOffsets>> {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, position: &Position, offset: i64) {
        self.partitions()
            .entry(position.clone())
            .or_default()
            .fetched
            .insert(offset, false);
    }

    /// Mark `offset` completed and return the offset to commit, if the low
    /// water mark of the partition moved.
    fn complete(&self, position: &Position, offset: i64) -> Option<i64> {
        let mut partitions = self.partitions();
        let partition = partitions.get_mut(position)?;
        *partition.fetched.get_mut(&offset)? = true;

        let mut next = None;
        while let Some(entry) = partition.fetched.first_entry() {
            if !*entry.get() {
                break;
            }
            next = Some(*entry.key() + 1);
            entry.remove();
        }

        let next = next?;
        if partition.committed.is_some_and(|committed| committed >= next) {
            return None;
        }
        partition.committed = Some(next);
        Some(next)
    }

    /// Forget `offset` and everything fetched after it; the seek fetches
    /// them again.
    fn rewind(&self, position: &Position, offset: i64) {
        if let Some(partition) = self.partitions().get_mut(position) {
            partition.fetched.retain(|fetched, _| *fetched < offset);
        }
    }
}

/// Cartridge connecting to a Kafka cluster.
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaCartridge;

#[async_trait]
impl Cartridge for KafkaCartridge {
    const NAME: &'static str = "kafka";

    type Settings = KafkaSettings;
    type Client = KafkaClient;
    type Sender = Kafka;
    type Receiver = KafkaReceiver;

    async fn connect(&self, settings: KafkaSettings) -> Result<KafkaClient, tower::BoxError> {
        let producer: FutureProducer = settings
            .client_config()
            .set("message.timeout.ms", settings.message_timeout_ms.to_string())
            .create()?;

        Ok(KafkaClient {
            settings: Arc::new(settings),
            producer,
        })
    }

    async fn sender(
        &self,
        client: &KafkaClient,
        parameter: &ProducerParameter,
    ) -> Result<Kafka, tower::BoxError> {
        Ok(Kafka::new(client.producer.clone(), parameter.destination())
            .with_timeout(client.settings.message_timeout()))
    }

    async fn receiver(
        &self,
        client: &KafkaClient,
        parameter: &ConsumerParameter,
    ) -> Result<KafkaReceiver, tower::BoxError> {
        let group_id = consumer_group(&client.settings, parameter)?;
        let consumer: StreamConsumer = client
            .settings
            .client_config()
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .create()?;
        consumer.subscribe(&[parameter.destination()])?;

        tracing::info!(
            topic = parameter.destination(),
            group_id,
            "Subscribed to Kafka topic"
        );
        Ok(KafkaReceiver {
            consumer: Arc::new(consumer),
            offsets: Arc::default(),
            seek_timeout: client.settings.message_timeout(),
        })
    }
}

fn consumer_group<'a>(
    settings: &'a KafkaSettings,
    parameter: &'a ConsumerParameter,
) -> Result<&'a str, tower::BoxError> {
    parameter
        .subscription()
        .or(settings.group_id.as_deref())
        .ok_or_else(|| {
            format!(
                "No consumer group for topic {}: set a subscription or group_id",
                parameter.destination()
            )
            .into()
        })
}

fn to_kafka_headers(headers: &Headers) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |kafka, (key, value)| {
            kafka.insert(Header {
                key,
                value: Some(value),
            })
        })
}

fn from_kafka_headers(kafka: &OwnedHeaders) -> Headers {
    kafka
        .iter()
        .filter_map(|header| {
            let value = std::str::from_utf8(header.value?).ok()?;
            Some((header.key.to_owned(), value.to_owned()))
        })
        .collect()
}
