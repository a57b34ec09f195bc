//! Explicit registration of producers and consumers.
//!
//! [`MessagingBuilder`] is the wiring point of an application: every producer
//! and consumer is registered with a typed call naming its cartridge, message
//! type and [parameter](crate::parameter). Registration binds the connection's
//! settings section, connects the cartridge client once per connection id and
//! builds the endpoint. [`MessagingHost`] then runs every registered consumer
//! until cancellation.
//!
//! ```rust,no_run
//! # use liquid_messaging::{
//! #     ConsumerParameter, Headers, MessagingBuilder, ProducerParameter, Settings,
//! #     transport::InMemoryCartridge,
//! # };
//! # use tokio_util::sync::CancellationToken;
//! # async fn wire() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let settings = Settings::load("messaging.toml")?;
//! let mut builder = MessagingBuilder::new(settings);
//!
//! let producer = builder
//!     .add_producer::<String, _>(&InMemoryCartridge, ProducerParameter::new("local", "greetings"))
//!     .await?;
//! builder
//!     .add_consumer(
//!         &InMemoryCartridge,
//!         ConsumerParameter::new("local", "greetings"),
//!         |greeting: String, _headers: Headers, _cancel: CancellationToken| async move {
//!             println!("{greeting}");
//!             Ok(true)
//!         },
//!     )
//!     .await?;
//!
//! producer.send_message("hello".to_owned(), None).await?;
//! builder.build().run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::Arc,
};

use futures::{FutureExt as _, future::BoxFuture};
use serde::{Serialize, de::DeserializeOwned};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    Cartridge, ConsumerParameter, Producer, ProducerParameter, Settings,
    consumer::{Consumer, ConsumerHook, ConsumerRunError, DefaultConsumerHook, MessageHandler},
    parameter::InvalidParameter,
    settings::SettingsError,
    telemetry::{TelemetrySink, TracingTelemetry},
};

type ConsumerTask =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), ConsumerRunError>> + Send>;

struct RegisteredConsumer {
    destination: String,
    task: ConsumerTask,
}

/// Typed, explicit registration of producers and consumers.
pub struct MessagingBuilder {
    settings: Settings,
    telemetry: Arc<dyn TelemetrySink>,
    clients: HashMap<(TypeId, String), Box<dyn Any + Send + Sync>>,
    consumers: Vec<RegisteredConsumer>,
}

impl MessagingBuilder {
    /// Start registering against `settings`, recording telemetry through
    /// `tracing`.
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            telemetry: Arc::new(TracingTelemetry),
            clients: HashMap::new(),
            consumers: Vec::new(),
        }
    }

    /// Use `telemetry` for every producer and consumer registered afterwards.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Client of `connection_id` for cartridge `C`.
    ///
    /// The first call binds `messaging.<connection_id>` and connects; later
    /// calls with the same connection id return the same client.
    #[tracing::instrument(skip(self, cartridge), fields(cartridge = C::NAME))]
    pub async fn client<C: Cartridge>(
        &mut self,
        cartridge: &C,
        connection_id: &str,
    ) -> Result<C::Client, RegistrationError> {
        let key = (TypeId::of::<C>(), connection_id.to_owned());
        if let Some(client) = self
            .clients
            .get(&key)
            .and_then(|client| client.downcast_ref::<C::Client>())
        {
            return Ok(client.clone());
        }

        let settings: C::Settings = self
            .settings
            .connection(connection_id)
            .map_err(RegistrationError::settings)?;
        let client = cartridge
            .connect(settings)
            .await
            .map_err(|e| RegistrationError::connect(C::NAME, connection_id, e))?;
        tracing::info!("Connection established");

        self.clients.insert(key, Box::new(client.clone()));
        Ok(client)
    }

    /// Register a producer of `M` on cartridge `C`.
    #[tracing::instrument(
        skip_all,
        fields(
            cartridge = C::NAME,
            connection_id = parameter.connection_id(),
            destination = parameter.destination(),
        )
    )]
    pub async fn add_producer<M, C>(
        &mut self,
        cartridge: &C,
        parameter: ProducerParameter,
    ) -> Result<Producer<M, C::Sender>, RegistrationError>
    where
        M: Serialize + Send + 'static,
        C: Cartridge,
    {
        parameter.validate().map_err(RegistrationError::parameter)?;
        let client = self.client(cartridge, parameter.connection_id()).await?;
        let sender = cartridge
            .sender(&client, &parameter)
            .await
            .map_err(|e| RegistrationError::endpoint(parameter.destination(), e))?;

        tracing::info!("Producer registered");
        Ok(Producer::with_telemetry(
            parameter,
            sender,
            Arc::clone(&self.telemetry),
        ))
    }

    /// Register a consumer of `M` on cartridge `C`, logging its lifecycle
    /// with [`DefaultConsumerHook`].
    pub async fn add_consumer<M, C, F>(
        &mut self,
        cartridge: &C,
        parameter: ConsumerParameter,
        handler: F,
    ) -> Result<(), RegistrationError>
    where
        M: DeserializeOwned + Send + 'static,
        C: Cartridge,
        F: MessageHandler<M> + 'static,
    {
        self.add_consumer_with_hook(cartridge, parameter, handler, DefaultConsumerHook)
            .await
    }

    /// Register a consumer of `M` on cartridge `C` with a custom hook.
    #[tracing::instrument(
        skip_all,
        fields(
            cartridge = C::NAME,
            connection_id = parameter.connection_id(),
            destination = parameter.destination(),
        )
    )]
    pub async fn add_consumer_with_hook<M, C, F, HK>(
        &mut self,
        cartridge: &C,
        parameter: ConsumerParameter,
        handler: F,
        hook: HK,
    ) -> Result<(), RegistrationError>
    where
        M: DeserializeOwned + Send + 'static,
        C: Cartridge,
        F: MessageHandler<M> + 'static,
        HK: ConsumerHook + 'static,
    {
        parameter.validate().map_err(RegistrationError::parameter)?;
        let client = self.client(cartridge, parameter.connection_id()).await?;
        let receiver = cartridge
            .receiver(&client, &parameter)
            .await
            .map_err(|e| RegistrationError::endpoint(parameter.destination(), e))?;

        let destination = parameter.destination().to_owned();
        let consumer = Consumer::new(parameter, receiver, handler)
            .with_hook(hook)
            .with_telemetry(Arc::clone(&self.telemetry));

        self.consumers.push(RegisteredConsumer {
            destination,
            task: Box::new(move |cancel| consumer.run(cancel).boxed()),
        });

        tracing::info!("Consumer registered");
        Ok(())
    }

    /// Finish registration.
    pub fn build(self) -> MessagingHost {
        MessagingHost {
            consumers: self.consumers,
        }
    }
}

/// Runs every registered consumer.
pub struct MessagingHost {
    consumers: Vec<RegisteredConsumer>,
}

impl MessagingHost {
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Run all consumers until `cancel` fires or every consumer ends.
    ///
    /// When one consumer fails the others are cancelled, and the first error
    /// is returned once all of them have stopped.
    #[tracing::instrument(skip_all, fields(consumers = self.consumers.len()))]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ConsumerRunError> {
        let shutdown = cancel.child_token();
        let mut tasks = JoinSet::new();

        for consumer in self.consumers {
            tracing::debug!(destination = %consumer.destination, "Starting consumer");
            tasks.spawn((consumer.task)(shutdown.clone()));
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let error = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(error)) => error,
                Err(join_error) => ConsumerRunError::task(join_error),
            };

            tracing::error!(%error, "Consumer stopped with an error, shutting down host");
            shutdown.cancel();
            first_error.get_or_insert(error);
        }

        first_error.map_or(Ok(()), Err)
    }
}

/// Error returned while registering a producer or consumer.
#[derive(Debug)]
pub struct RegistrationError {
    context: SpanTrace,
    kind: RegistrationErrorKind,
}

/// Registration errors kind.
#[derive(Debug)]
pub enum RegistrationErrorKind {
    /// The connection settings could not be bound.
    Settings(SettingsError),
    /// The cartridge failed to connect.
    Connect {
        cartridge: &'static str,
        connection_id: String,
        source: tower::BoxError,
    },
    /// The sender or receiver could not be built.
    Endpoint {
        destination: String,
        source: tower::BoxError,
    },
    /// The parameter failed validation.
    Parameter(InvalidParameter),
}

impl RegistrationError {
    fn settings(err: SettingsError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RegistrationErrorKind::Settings(err),
        }
    }

    fn connect(cartridge: &'static str, connection_id: &str, source: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RegistrationErrorKind::Connect {
                cartridge,
                connection_id: connection_id.to_owned(),
                source,
            },
        }
    }

    fn endpoint(destination: &str, source: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RegistrationErrorKind::Endpoint {
                destination: destination.to_owned(),
                source,
            },
        }
    }

    fn parameter(err: InvalidParameter) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RegistrationErrorKind::Parameter(err),
        }
    }

    pub fn kind(&self) -> &RegistrationErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RegistrationErrorKind::Settings(err) => write!(f, "{err}"),
            RegistrationErrorKind::Connect {
                cartridge,
                connection_id,
                source,
            } => writeln!(
                f,
                "Failed to connect {cartridge} connection {connection_id}: {source}"
            ),
            RegistrationErrorKind::Endpoint {
                destination,
                source,
            } => writeln!(f, "Failed to build endpoint for {destination}: {source}"),
            RegistrationErrorKind::Parameter(err) => writeln!(f, "{err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RegistrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            RegistrationErrorKind::Settings(err) => Some(err),
            RegistrationErrorKind::Connect { source, .. } => Some(source.as_ref()),
            RegistrationErrorKind::Endpoint { source, .. } => Some(source.as_ref()),
            RegistrationErrorKind::Parameter(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Headers,
        transport::{InMemoryBroker, InMemoryCartridge, InMemorySettings},
    };

    const SETTINGS: &str = r#"
        [messaging.primary]
        max_delivery_count = 2

        [messaging.secondary]
        max_delivery_count = 7
        lock_duration_ms = 1000
    "#;

    fn builder() -> MessagingBuilder {
        MessagingBuilder::new(Settings::from_toml_str(SETTINGS).unwrap())
    }

    #[tokio::test]
    async fn each_connection_id_gets_its_own_client() {
        let mut builder = builder();

        let primary: InMemoryBroker = builder.client(&InMemoryCartridge, "primary").await.unwrap();
        let secondary = builder
            .client(&InMemoryCartridge, "secondary")
            .await
            .unwrap();
        let primary_again = builder.client(&InMemoryCartridge, "primary").await.unwrap();

        assert!(!primary.same_broker(&secondary));
        assert!(primary.same_broker(&primary_again));
        assert_eq!(
            primary.settings(),
            &InMemorySettings {
                max_delivery_count: 2,
                ..InMemorySettings::default()
            }
        );
        assert_eq!(
            secondary.settings(),
            &InMemorySettings {
                max_delivery_count: 7,
                lock_duration_ms: Some(1000),
                ..InMemorySettings::default()
            }
        );
    }

    #[tokio::test]
    async fn unknown_connection_fails_registration() {
        let mut builder = builder();

        let err = match builder
            .add_producer::<String, _>(&InMemoryCartridge, ProducerParameter::new("nope", "q"))
            .await
        {
            Ok(_) => panic!("registration should fail"),
            Err(err) => err,
        };

        assert!(matches!(err.kind(), RegistrationErrorKind::Settings(_)));
    }

    #[tokio::test]
    async fn invalid_parameter_fails_registration() {
        let mut builder = builder();

        let err = builder
            .add_consumer(
                &InMemoryCartridge,
                ConsumerParameter::new("primary", "q").with_max_concurrent_calls(0),
                |_: String, _: Headers, _: CancellationToken| async { Ok(true) },
            )
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), RegistrationErrorKind::Parameter(_)));
        assert_eq!(builder.build().consumer_count(), 0);
    }

    #[tokio::test]
    async fn host_with_no_consumers_returns_immediately() {
        let host = builder().build();

        host.run(CancellationToken::new()).await.unwrap();
    }
}
