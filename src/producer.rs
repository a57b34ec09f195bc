//! Typed producer publishing messages through a transport stack.
//!
//! A [`Producer`] is bound to one [`ProducerParameter`] and one message type
//! for its whole lifetime. Each call to [`send_message`](Producer::send_message):
//!
//! - Stamps the message id, correlation id and content type headers
//! - Serializes the message to JSON
//! - Gzip-compresses the payload when the parameter asks for it
//! - Hands the envelope to the broker sender, recording telemetry around it
//!
//! Failures are returned as [`TransportError`]s; nothing is retried here.

use std::{marker::PhantomData, sync::Arc};

use serde::Serialize;

use crate::{
    Envelope, Headers, ProducerParameter,
    envelope::{CONTENT_ENCODING, CONTENT_TYPE, CORRELATION_ID, JSON_CONTENT_TYPE, MESSAGE_ID},
    telemetry::{TelemetryLayer, TelemetryService, TelemetrySink, TracingTelemetry},
    transport::{
        RawPayload, Sender, SenderService, Transport, TransportError,
        layers::{CompressionLayer, CompressionService, JsonLayer, JsonService},
    },
};

/// Service stack every producer sends through, outermost first.
pub type ProducerStack<D> =
    JsonService<CompressionService<TelemetryService<SenderService<D>>>>;

/// Typed producer.
///
/// Generic parameters:
/// - `M`: Message type
/// - `D`: Sender backend
pub struct Producer<M, D> {
    parameter: ProducerParameter,
    transport: Transport<ProducerStack<D>>,
    message_marker: PhantomData<fn(M)>,
}

impl<M, D> Clone for Producer<M, D>
where
    D: Clone,
{
    fn clone(&self) -> Self {
        Self {
            parameter: self.parameter.clone(),
            transport: self.transport.clone(),
            message_marker: PhantomData,
        }
    }
}

impl<M, D> Producer<M, D>
where
    M: Serialize + Send + 'static,
    D: Sender<Headers, RawPayload> + Clone + Send + 'static,
{
    /// Create a producer recording telemetry through `tracing`.
    pub fn new(parameter: ProducerParameter, sender: D) -> Self {
        Self::with_telemetry(parameter, sender, Arc::new(TracingTelemetry))
    }

    /// Create a producer recording telemetry into `telemetry`.
    pub fn with_telemetry(
        parameter: ProducerParameter,
        sender: D,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let transport = Transport::new(sender)
            .layer(TelemetryLayer::new(
                format!("send {}", parameter.destination()),
                telemetry,
            ))
            .layer(CompressionLayer::new(parameter.compress()))
            .layer(JsonLayer);

        Self {
            parameter,
            transport,
            message_marker: PhantomData,
        }
    }

    pub fn parameter(&self) -> &ProducerParameter {
        &self.parameter
    }

    /// Send `message` with optional application headers.
    ///
    /// Custom headers win over generated ones, so a caller may propagate an
    /// existing correlation id or pin the message id.
    #[tracing::instrument(skip_all, fields(destination = %self.parameter.destination()))]
    pub async fn send_message(
        &self,
        message: M,
        custom_headers: Option<Headers>,
    ) -> Result<(), TransportError> {
        let mut headers = custom_headers.unwrap_or_default();
        headers.insert_if_absent(MESSAGE_ID, new_id);
        headers.insert_if_absent(CORRELATION_ID, new_id);
        headers.insert(CONTENT_TYPE, JSON_CONTENT_TYPE);
        // Only the compression layer may label the payload encoding.
        headers.remove(CONTENT_ENCODING);

        tracing::debug!(
            message_id = headers.message_id(),
            correlation_id = headers.correlation_id(),
            "Sending message"
        );

        self.transport.send(Envelope { headers, message }).await
    }

    /// Send every message in order, stopping at the first failure.
    pub async fn send_messages(
        &self,
        messages: impl IntoIterator<Item = M>,
        custom_headers: Option<Headers>,
    ) -> Result<(), TransportError> {
        for message in messages {
            self.send_message(message, custom_headers.clone()).await?;
        }
        Ok(())
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
