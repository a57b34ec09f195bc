use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use liquid_messaging::{
    Consumer, ConsumerParameter, ConsumerRunErrorKind, Headers, MessagingBuilder, MessagingHost,
    Producer, ProducerParameter, Settings,
    telemetry::RecordingTelemetry,
    transport::{InMemory, InMemoryBroker, InMemoryCartridge, inmemory::InMemoryReceiver},
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

const SETTINGS: &str = r#"
    [messaging.local]
    max_delivery_count = 2
"#;

const QUEUE: &str = "jobs";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job {
    id: u32,
    outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
enum Outcome {
    Handled,
    Declined,
    Fails,
    Panics,
}

impl Job {
    fn new(id: u32, outcome: Outcome) -> Self {
        Self { id, outcome }
    }
}

async fn handle(job: Job) -> Result<bool, tower::BoxError> {
    match job.outcome {
        Outcome::Handled => Ok(true),
        Outcome::Declined => Ok(false),
        Outcome::Fails => Err(format!("job {} failed", job.id).into()),
        Outcome::Panics => panic!("job {} panicked", job.id),
    }
}

struct Harness {
    builder: MessagingBuilder,
    broker: InMemoryBroker,
    producer: Producer<Job, InMemory>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_builder(MessagingBuilder::new(
            Settings::from_toml_str(SETTINGS).unwrap(),
        ))
        .await
    }

    async fn with_builder(mut builder: MessagingBuilder) -> Self {
        let broker = builder.client(&InMemoryCartridge, "local").await.unwrap();
        let producer = builder
            .add_producer(&InMemoryCartridge, ProducerParameter::new("local", QUEUE))
            .await
            .unwrap();

        Self {
            builder,
            broker,
            producer,
        }
    }

    async fn send(&self, jobs: impl IntoIterator<Item = Job>) {
        self.producer.send_messages(jobs, None).await.unwrap();
    }

    /// Close the broker and run consumers until every queue is drained.
    async fn drain(self) -> InMemoryBroker {
        self.broker.close().await;
        run_to_end(self.builder.build()).await;
        self.broker
    }
}

async fn run_to_end(host: MessagingHost) {
    tokio::time::timeout(Duration::from_secs(5), host.run(CancellationToken::new()))
        .await
        .expect("host should stop once the broker is drained")
        .unwrap();
}

#[tokio::test]
async fn only_handled_messages_complete_without_auto_complete() {
    let mut harness = Harness::new().await;
    harness
        .builder
        .add_consumer(
            &InMemoryCartridge,
            ConsumerParameter::new("local", QUEUE),
            |job: Job, _: Headers, _: CancellationToken| handle(job),
        )
        .await
        .unwrap();
    harness
        .send([Job::new(1, Outcome::Handled), Job::new(2, Outcome::Declined)])
        .await;

    let broker = harness.drain().await;

    let stats = broker.stats(QUEUE).await;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.abandoned, 2);

    let dead = &broker.dead_letters(QUEUE).await[0];
    assert_eq!(dead.delivery_count, 2);
}

#[tokio::test]
async fn auto_complete_completes_declined_messages() {
    let mut harness = Harness::new().await;
    harness
        .builder
        .add_consumer(
            &InMemoryCartridge,
            ConsumerParameter::new("local", QUEUE).with_auto_complete(true),
            |job: Job, _: Headers, _: CancellationToken| handle(job),
        )
        .await
        .unwrap();
    harness
        .send([Job::new(1, Outcome::Handled), Job::new(2, Outcome::Declined)])
        .await;

    let stats = harness.drain().await.stats(QUEUE).await;
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.abandoned, 0);
}

#[tokio::test]
async fn failing_and_panicking_handlers_abandon_even_with_auto_complete() {
    let mut harness = Harness::new().await;
    harness
        .builder
        .add_consumer(
            &InMemoryCartridge,
            ConsumerParameter::new("local", QUEUE).with_auto_complete(true),
            |job: Job, _: Headers, _: CancellationToken| handle(job),
        )
        .await
        .unwrap();
    harness
        .send([
            Job::new(1, Outcome::Fails),
            Job::new(2, Outcome::Panics),
            Job::new(3, Outcome::Handled),
        ])
        .await;

    let stats = harness.drain().await.stats(QUEUE).await;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.abandoned, 4);
    assert_eq!(stats.dead_lettered, 2);
}

#[tokio::test]
async fn undecodable_payloads_are_abandoned_without_calling_the_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut harness = Harness::new().await;
    let counter = Arc::clone(&calls);
    harness
        .builder
        .add_consumer(
            &InMemoryCartridge,
            ConsumerParameter::new("local", QUEUE).with_auto_complete(true),
            move |_: Job, _: Headers, _: CancellationToken| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(true) }
            },
        )
        .await
        .unwrap();
    harness
        .broker
        .publish(QUEUE, Headers::new(), b"not json".to_vec())
        .await
        .unwrap();

    let stats = harness.drain().await.stats(QUEUE).await;
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn compressed_messages_reach_the_handler_with_their_headers() {
    let mut builder = MessagingBuilder::new(Settings::from_toml_str(SETTINGS).unwrap());
    let broker: InMemoryBroker = builder.client(&InMemoryCartridge, "local").await.unwrap();
    let producer = builder
        .add_producer::<Job, _>(
            &InMemoryCartridge,
            ProducerParameter::new("local", QUEUE).with_compression(true),
        )
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    builder
        .add_consumer(
            &InMemoryCartridge,
            ConsumerParameter::new("local", QUEUE),
            move |job: Job, headers: Headers, _: CancellationToken| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((job, headers));
                    Ok(true)
                }
            },
        )
        .await
        .unwrap();

    let incoming = Headers::from([("correlation-id", "order-7")]);
    producer
        .send_message(
            Job::new(7, Outcome::Handled),
            Some(Headers::correlated_with(&incoming)),
        )
        .await
        .unwrap();
    assert!(broker.pending(QUEUE).await[0].headers.is_compressed());

    broker.close().await;
    run_to_end(builder.build()).await;

    let (job, headers) = rx.recv().await.unwrap();
    assert_eq!(job, Job::new(7, Outcome::Handled));
    assert_eq!(headers.correlation_id(), Some("order-7"));
    assert!(headers.message_id().is_some());
    assert_eq!(broker.stats(QUEUE).await.completed, 1);
}

#[tokio::test]
async fn concurrent_handlers_are_bounded_by_max_concurrent_calls() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut harness = Harness::new().await;
    let (running, highest) = (Arc::clone(&in_flight), Arc::clone(&peak));
    harness
        .builder
        .add_consumer(
            &InMemoryCartridge,
            ConsumerParameter::new("local", QUEUE).with_max_concurrent_calls(3),
            move |_: Job, _: Headers, _: CancellationToken| {
                let (running, highest) = (Arc::clone(&running), Arc::clone(&highest));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    highest.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(true)
                }
            },
        )
        .await
        .unwrap();
    harness
        .send((0..10).map(|id| Job::new(id, Outcome::Handled)))
        .await;

    let stats = harness.drain().await.stats(QUEUE).await;
    assert_eq!(stats.completed, 10);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn cancellation_waits_for_in_flight_handlers_and_fires_their_lease() {
    let started = Arc::new(Notify::new());
    let mut harness = Harness::new().await;
    let notify = Arc::clone(&started);
    harness
        .builder
        .add_consumer(
            &InMemoryCartridge,
            ConsumerParameter::new("local", QUEUE),
            move |_: Job, _: Headers, lease: CancellationToken| {
                let notify = Arc::clone(&notify);
                async move {
                    notify.notify_one();
                    lease.cancelled().await;
                    Ok(true)
                }
            },
        )
        .await
        .unwrap();
    harness.send([Job::new(1, Outcome::Handled)]).await;

    let cancel = CancellationToken::new();
    let host = tokio::spawn(harness.builder.build().run(cancel.clone()));
    started.notified().await;
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(5), host)
        .await
        .expect("host should stop after cancellation")
        .unwrap()
        .unwrap();
    assert_eq!(harness.broker.stats(QUEUE).await.completed, 1);
}

#[tokio::test]
async fn oversized_concurrency_still_drains_in_flight_handlers() {
    let broker = InMemoryBroker::default();
    broker
        .publish(
            QUEUE,
            Headers::new(),
            serde_json::to_vec(&Job::new(1, Outcome::Handled)).unwrap(),
        )
        .await
        .unwrap();

    let started = Arc::new(Notify::new());
    let notify = Arc::clone(&started);
    let consumer = Consumer::new(
        ConsumerParameter::new("local", QUEUE).with_max_concurrent_calls(usize::MAX),
        InMemoryReceiver::new(broker.clone(), QUEUE),
        move |_: Job, _: Headers, _: CancellationToken| {
            let notify = Arc::clone(&notify);
            async move {
                notify.notify_one();
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(true)
            }
        },
    );

    let cancel = CancellationToken::new();
    let run = tokio::spawn(consumer.run(cancel.clone()));
    started.notified().await;
    cancel.cancel();
    run.await.unwrap().unwrap();

    let stats = broker.stats(QUEUE).await;
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn telemetry_records_sends_and_completed_messages() {
    let telemetry = RecordingTelemetry::default();
    let builder = MessagingBuilder::new(Settings::from_toml_str(SETTINGS).unwrap())
        .with_telemetry(Arc::new(telemetry.clone()));
    let mut harness = Harness::with_builder(builder).await;
    harness
        .builder
        .add_consumer(
            &InMemoryCartridge,
            ConsumerParameter::new("local", QUEUE),
            |job: Job, _: Headers, _: CancellationToken| handle(job),
        )
        .await
        .unwrap();
    harness.send([Job::new(1, Outcome::Handled)]).await;

    harness.drain().await;

    let records = telemetry.records();
    let send = records
        .iter()
        .find(|record| record.operation == "send jobs")
        .unwrap();
    let consume = records
        .iter()
        .find(|record| record.operation == "consume jobs")
        .unwrap();
    assert!(send.success);
    assert!(consume.success);
    assert_eq!(send.size, consume.size);
    assert!(consume.size.is_some());
}

#[tokio::test]
async fn consumers_on_separate_connections_do_not_share_queues() {
    let settings = Settings::from_toml_str(
        r#"
        [messaging.left]
        [messaging.right]
        "#,
    )
    .unwrap();
    let mut builder = MessagingBuilder::new(settings);
    let left = builder.client(&InMemoryCartridge, "left").await.unwrap();
    let right = builder.client(&InMemoryCartridge, "right").await.unwrap();

    let producer = builder
        .add_producer::<Job, _>(&InMemoryCartridge, ProducerParameter::new("left", QUEUE))
        .await
        .unwrap();
    producer
        .send_message(Job::new(1, Outcome::Handled), None)
        .await
        .unwrap();

    assert_eq!(left.stats(QUEUE).await.pending, 1);
    assert_eq!(right.stats(QUEUE).await.pending, 0);
}

#[tokio::test]
async fn receiver_failure_stops_the_host() {
    let mut builder = MessagingBuilder::new(Settings::from_toml_str(SETTINGS).unwrap());
    builder
        .add_consumer_with_hook(
            &FailingCartridge,
            ConsumerParameter::new("local", QUEUE),
            |job: Job, _: Headers, _: CancellationToken| handle(job),
            liquid_messaging::DefaultConsumerHook,
        )
        .await
        .unwrap();

    let err = builder
        .build()
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err.kind(), ConsumerRunErrorKind::Receiver(_)));
}

/// Cartridge whose receivers fail on first use.
struct FailingCartridge;

struct FailingReceiver;

#[async_trait::async_trait]
impl liquid_messaging::Receiver for FailingReceiver {
    type Error = tower::BoxError;
    type Acker = liquid_messaging::transport::inmemory::InMemoryAcker;

    async fn receive(
        &mut self,
        _cancel: &CancellationToken,
    ) -> Result<Option<liquid_messaging::Delivery<Self::Acker>>, Self::Error> {
        Err("connection reset".into())
    }
}

#[async_trait::async_trait]
impl liquid_messaging::Cartridge for FailingCartridge {
    const NAME: &'static str = "failing";

    type Settings = liquid_messaging::transport::InMemorySettings;
    type Client = ();
    type Sender = InMemory;
    type Receiver = FailingReceiver;

    async fn connect(&self, _settings: Self::Settings) -> Result<(), tower::BoxError> {
        Ok(())
    }

    async fn sender(
        &self,
        _client: &(),
        parameter: &ProducerParameter,
    ) -> Result<InMemory, tower::BoxError> {
        Ok(InMemory::new(
            InMemoryBroker::default(),
            parameter.destination(),
        ))
    }

    async fn receiver(
        &self,
        _client: &(),
        _parameter: &ConsumerParameter,
    ) -> Result<FailingReceiver, tower::BoxError> {
        Ok(FailingReceiver)
    }
}
