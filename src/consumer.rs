//! Consumer loop dispatching broker deliveries into a typed handler.
//!
//! This module implements a generic *consumer* that:
//!
//! - Pulls deliveries from a broker [`Receiver`]
//! - Decompresses and deserializes each payload into the message type
//! - Invokes the application [`MessageHandler`] with a lease cancellation token
//! - Completes or abandons the delivery according to the handler outcome and
//!   the `auto_complete` flag of its [`ConsumerParameter`]
//! - Exposes lifecycle hooks for observability and customization
//!
//! The consumer runs until:
//! - The receiver ends
//! - The receiver fails
//! - A [`CancellationToken`] is triggered
//!
//! Handler failures never stop the loop: the delivery is abandoned so the
//! broker can redeliver or dead-letter it according to its own policy.

use std::{future::Future, marker::PhantomData, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt as _;
use serde::de::DeserializeOwned;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::{
    ConsumerParameter, Headers, codec,
    telemetry::{TelemetryScope, TelemetrySink, TracingTelemetry},
    transport::{RawPayload, ToBytes},
};

/// A message handed over by a broker, waiting to be settled.
#[derive(Debug)]
pub struct Delivery<A> {
    pub headers: Headers,
    pub payload: RawPayload,
    /// Settles the delivery with the broker.
    pub acker: A,
    /// Cancelled when the broker lease on this delivery ends or the consumer
    /// shuts down.
    pub lease: CancellationToken,
}

/// Settles a single delivery with the broker that produced it.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sized + 'static {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Acknowledge the delivery, removing it from the broker.
    async fn complete(self) -> Result<(), Self::Error>;

    /// Hand the delivery back to the broker for redelivery or dead-lettering.
    async fn abandon(self) -> Result<(), Self::Error>;
}

/// Trait implemented by concrete receiver backends.
///
/// A receiver is bound to a single destination when it is built by its
/// [`Cartridge`](crate::Cartridge).
#[async_trait::async_trait]
pub trait Receiver: Send {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;
    /// Acknowledgement handle attached to each delivery.
    type Acker: Acknowledge;

    /// Wait for the next delivery.
    ///
    /// Returns `Ok(None)` once the receiver has ended. Lease tokens handed out
    /// with deliveries should be children of `cancel`.
    async fn receive(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery<Self::Acker>>, Self::Error>;
}

/// Application callback processing consumed messages.
///
/// Returns whether the message was handled. With `auto_complete` disabled only
/// `Ok(true)` completes the delivery; anything else abandons it.
///
/// Any `Fn(M, Headers, CancellationToken) -> impl Future<Output = Result<bool, BoxError>>`
/// closure implements this trait.
#[async_trait::async_trait]
pub trait MessageHandler<M>: Send + Sync {
    async fn handle(
        &self,
        message: M,
        headers: Headers,
        cancel: CancellationToken,
    ) -> Result<bool, tower::BoxError>;
}

#[async_trait::async_trait]
impl<M, F, Fut> MessageHandler<M> for F
where
    M: Send + 'static,
    F: Fn(M, Headers, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, tower::BoxError>> + Send,
{
    async fn handle(
        &self,
        message: M,
        headers: Headers,
        cancel: CancellationToken,
    ) -> Result<bool, tower::BoxError> {
        (self)(message, headers, cancel).await
    }
}

/// Typed consumer.
///
/// Generic parameters:
/// - `M`: Message type the payload is deserialized into
/// - `R`: Receiver backend
/// - `F`: Message handler
/// - `HK`: Hook implementation for lifecycle events
pub struct Consumer<M, R, F, HK = DefaultConsumerHook> {
    parameter: ConsumerParameter,
    receiver: R,
    handler: Arc<F>,
    hook: Arc<HK>,
    telemetry: Arc<dyn TelemetrySink>,
    message_marker: PhantomData<fn() -> M>,
}

impl<M, R, F> Consumer<M, R, F, DefaultConsumerHook>
where
    R: Receiver,
    F: MessageHandler<M>,
{
    /// Create a new consumer with the default hook and `tracing` telemetry.
    pub fn new(parameter: ConsumerParameter, receiver: R, handler: F) -> Self {
        Self {
            parameter,
            receiver,
            handler: Arc::new(handler),
            hook: Arc::new(DefaultConsumerHook),
            telemetry: Arc::new(TracingTelemetry),
            message_marker: PhantomData,
        }
    }
}

impl<M, R, F, HK> Consumer<M, R, F, HK>
where
    M: DeserializeOwned + Send + 'static,
    R: Receiver,
    F: MessageHandler<M> + 'static,
    HK: ConsumerHook + 'static,
{
    /// Replace the consumer hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: ConsumerHook>(self, hook: HK2) -> Consumer<M, R, F, HK2> {
        Consumer {
            parameter: self.parameter,
            receiver: self.receiver,
            handler: self.handler,
            hook: Arc::new(hook),
            telemetry: self.telemetry,
            message_marker: self.message_marker,
        }
    }

    /// Replace the sink receiving one telemetry record per delivery.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn parameter(&self) -> &ConsumerParameter {
        &self.parameter
    }

    /// Run the consumer loop.
    ///
    /// At most `max_concurrent_calls` handlers run at once, each on its own
    /// task. When the loop stops, in-flight handlers are awaited before
    /// returning so no delivery is left unsettled.
    #[tracing::instrument(skip_all, fields(destination = %self.parameter.destination()))]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ConsumerRunError> {
        let Consumer {
            parameter,
            mut receiver,
            handler,
            hook,
            telemetry,
            ..
        } = self;

        hook.on_startup(&parameter);

        let limit = parameter
            .max_concurrent_calls()
            .clamp(1, crate::parameter::MAX_CONCURRENT_CALLS);
        let permits = Arc::new(Semaphore::new(limit));
        let parameter = Arc::new(parameter);

        let result = loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => {
                    hook.on_shutdown();
                    break Ok(());
                }
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let delivery = tokio::select! {
                _ = cancel.cancelled() => {
                    hook.on_shutdown();
                    break Ok(());
                }
                delivery = receiver.receive(&cancel) => delivery,
            };

            match delivery {
                Ok(Some(delivery)) => {
                    hook.on_message_received(&delivery.headers);
                    tokio::spawn(dispatch(
                        delivery,
                        Arc::clone(&handler),
                        Arc::clone(&hook),
                        Arc::clone(&telemetry),
                        Arc::clone(&parameter),
                        permit,
                    ));
                }
                Ok(None) => {
                    hook.on_receiver_end();
                    break Ok(());
                }
                Err(e) => {
                    let error: tower::BoxError = e.into();
                    hook.on_receive_error(error.as_ref());
                    break Err(ConsumerRunError::receiver(error));
                }
            }
        };

        // Every permit is back once all in-flight handlers have settled.
        let all_permits = u32::try_from(limit).unwrap_or(u32::MAX);
        let _drained = permits.acquire_many(all_permits).await;

        result
    }
}

enum Settlement {
    Complete,
    Abandon,
}

async fn dispatch<M, A, F, HK>(
    delivery: Delivery<A>,
    handler: Arc<F>,
    hook: Arc<HK>,
    telemetry: Arc<dyn TelemetrySink>,
    parameter: Arc<ConsumerParameter>,
    _permit: OwnedSemaphorePermit,
) where
    M: DeserializeOwned + Send + 'static,
    A: Acknowledge,
    F: MessageHandler<M>,
    HK: ConsumerHook,
{
    let Delivery {
        headers,
        payload,
        acker,
        lease,
    } = delivery;

    let span = tracing::info_span!(
        "consume",
        destination = %parameter.destination(),
        message_id = headers.message_id().unwrap_or_default(),
        correlation_id = headers.correlation_id().unwrap_or_default(),
    );

    async move {
        let mut scope =
            TelemetryScope::start(format!("consume {}", parameter.destination()), telemetry);
        scope.set_size(payload.len());

        let settlement = match codec::decode::<M>(&headers, payload.to_bytes()) {
            Err(error) => {
                hook.on_decode_error(&headers, &error);
                Settlement::Abandon
            }
            Ok(message) => {
                let outcome = AssertUnwindSafe(handler.handle(message, headers.clone(), lease))
                    .catch_unwind()
                    .await;

                match outcome {
                    Ok(Ok(handled)) if handled || parameter.auto_complete() => {
                        Settlement::Complete
                    }
                    Ok(Ok(_)) => Settlement::Abandon,
                    Ok(Err(error)) => {
                        hook.on_handler_error(&headers, error.as_ref());
                        Settlement::Abandon
                    }
                    Err(_) => {
                        hook.on_handler_panic(&headers);
                        Settlement::Abandon
                    }
                }
            }
        };

        match settlement {
            Settlement::Complete => match acker.complete().await {
                Ok(()) => {
                    scope.succeed();
                    hook.on_message_completed(&headers);
                }
                Err(e) => {
                    let error: tower::BoxError = e.into();
                    hook.on_acknowledge_error(&headers, error.as_ref());
                }
            },
            Settlement::Abandon => match acker.abandon().await {
                Ok(()) => hook.on_message_abandoned(&headers),
                Err(e) => {
                    let error: tower::BoxError = e.into();
                    hook.on_acknowledge_error(&headers, error.as_ref());
                }
            },
        }
    }
    .instrument(span)
    .await
}

/// Error returned when the consumer loop fails.
#[derive(Debug)]
pub struct ConsumerRunError {
    context: tracing_error::SpanTrace,
    kind: ConsumerRunErrorKind,
}

impl ConsumerRunError {
    fn receiver(error: tower::BoxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: ConsumerRunErrorKind::Receiver(error),
        }
    }

    pub(crate) fn task(error: tokio::task::JoinError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: ConsumerRunErrorKind::Task(error),
        }
    }

    pub fn kind(&self) -> &ConsumerRunErrorKind {
        &self.kind
    }
}

/// Classification of consumer runtime errors.
#[derive(Debug)]
pub enum ConsumerRunErrorKind {
    /// Errors originating from the broker receiver.
    Receiver(tower::BoxError),
    /// The consumer task panicked or was aborted.
    Task(tokio::task::JoinError),
}

impl std::fmt::Display for ConsumerRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConsumerRunErrorKind::Receiver(err) => writeln!(f, "Receiver error: {}", err),
            ConsumerRunErrorKind::Task(err) => writeln!(f, "Consumer task failed: {}", err),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumerRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConsumerRunErrorKind::Receiver(err) => Some(err.as_ref()),
            ConsumerRunErrorKind::Task(err) => Some(err),
        }
    }
}

/// Hook trait for observing consumer lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and tracing integration.
pub trait ConsumerHook: Send + Sync {
    fn on_startup(&self, parameter: &ConsumerParameter);
    fn on_shutdown(&self);
    fn on_message_received(&self, headers: &Headers);
    fn on_decode_error(&self, headers: &Headers, error: &dyn std::error::Error);
    fn on_handler_error(&self, headers: &Headers, error: &dyn std::error::Error);
    fn on_handler_panic(&self, headers: &Headers);
    fn on_message_completed(&self, headers: &Headers);
    fn on_message_abandoned(&self, headers: &Headers);
    fn on_acknowledge_error(&self, headers: &Headers, error: &dyn std::error::Error);
    fn on_receive_error(&self, error: &dyn std::error::Error);
    fn on_receiver_end(&self);
}

/// Default consumer hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultConsumerHook;

impl ConsumerHook for DefaultConsumerHook {
    fn on_startup(&self, parameter: &ConsumerParameter) {
        tracing::info!(
            connection_id = parameter.connection_id(),
            auto_complete = parameter.auto_complete(),
            max_concurrent_calls = parameter.max_concurrent_calls(),
            "Consumer is starting up"
        );
    }

    fn on_shutdown(&self) {
        tracing::info!("Consumer is shutting down");
    }

    fn on_message_received(&self, _headers: &Headers) {
        tracing::debug!("Message received");
    }

    fn on_decode_error(&self, _headers: &Headers, error: &dyn std::error::Error) {
        tracing::error!(?error, "Failed to decode message, abandoning");
    }

    fn on_handler_error(&self, _headers: &Headers, error: &dyn std::error::Error) {
        tracing::error!(?error, "Handler failed, abandoning message");
    }

    fn on_handler_panic(&self, _headers: &Headers) {
        tracing::error!("Handler panicked, abandoning message");
    }

    fn on_message_completed(&self, _headers: &Headers) {
        tracing::info!("Message completed");
    }

    fn on_message_abandoned(&self, _headers: &Headers) {
        tracing::warn!("Message abandoned");
    }

    fn on_acknowledge_error(&self, _headers: &Headers, error: &dyn std::error::Error) {
        tracing::error!(?error, "Failed to settle message");
    }

    fn on_receive_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Error receiving message");
    }

    fn on_receiver_end(&self) {
        tracing::info!("Receiver ended");
    }
}
