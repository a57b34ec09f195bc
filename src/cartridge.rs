//! Broker-agnostic cartridge interface.
//!
//! A cartridge binds the framework to one broker technology. It turns the
//! typed settings bound from a connection's configuration section into a
//! client, and builds senders and receivers bound to a single destination
//! from that client.

use serde::de::DeserializeOwned;

use crate::{
    ConsumerParameter, Headers, ProducerParameter,
    consumer::Receiver,
    transport::{RawPayload, Sender},
};

/// Client factory and endpoint builder for one broker technology.
#[async_trait::async_trait]
pub trait Cartridge: Send + Sync + 'static {
    /// Short name used in logs, e.g. `kafka`.
    const NAME: &'static str;

    /// Settings bound from the `messaging.<connection_id>` section.
    type Settings: DeserializeOwned + Send + 'static;
    /// Connection-level client, shared by every endpoint of one connection id.
    type Client: Clone + Send + Sync + 'static;
    /// Sender bound to a destination.
    type Sender: Sender<Headers, RawPayload> + Clone + Send + 'static;
    /// Receiver bound to a destination.
    type Receiver: Receiver + 'static;

    /// Create the client for one connection.
    async fn connect(&self, settings: Self::Settings) -> Result<Self::Client, tower::BoxError>;

    /// Build a sender publishing to `parameter.destination()`.
    async fn sender(
        &self,
        client: &Self::Client,
        parameter: &ProducerParameter,
    ) -> Result<Self::Sender, tower::BoxError>;

    /// Build a receiver consuming from `parameter.destination()`.
    async fn receiver(
        &self,
        client: &Self::Client,
        parameter: &ConsumerParameter,
    ) -> Result<Self::Receiver, tower::BoxError>;
}
