use crate::{
    Envelope, codec,
    transport::{RawPayload, TransportError},
};
use std::{future::Future, pin::Pin};
use tower::{Layer, Service};

/// Tower `Service` wrapper that serializes messages to JSON.
///
/// This service converts any message type `M` that implements `serde::Serialize`
/// into a `RawPayload` containing the serialized JSON bytes before passing
/// it to the inner service. Serialization failures are reported as
/// [`TransportError`]s of kind `Serde`.
#[derive(Clone)]
pub struct JsonService<T> {
    inner: T,
}

impl<T, H, M> Service<Envelope<H, M>> for JsonService<T>
where
    H: Send + 'static,
    M: serde::Serialize + Send + 'static,
    T: Service<Envelope<H, RawPayload>> + Clone + Send + 'static,
    <T as Service<Envelope<H, RawPayload>>>::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Envelope<H, M>) -> Self::Future {
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let bytes = codec::json::to_bytes(&req.message)
                .map_err(|e| TransportError::serde(Box::new(e)))?;
            let envelope = Envelope {
                headers: req.headers,
                message: RawPayload::from(bytes),
            };

            inner.call(envelope).await.map_err(Into::<tower::BoxError>::into)
        })
    }
}

/// Tower `Layer` that applies `JsonService` to a service stack.
///
/// Wraps an existing service so that all outgoing messages are serialized
/// to JSON automatically.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonLayer;

impl<S> Layer<S> for JsonLayer {
    type Service = JsonService<S>;

    fn layer(&self, service: S) -> Self::Service {
        JsonService { inner: service }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Headers,
        transport::{InMemory, InMemoryBroker, Transport, TransportErrorKind},
    };
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn serializes_message_before_the_sender() {
        let broker = InMemoryBroker::default();
        let transport = Transport::new(InMemory::new(broker.clone(), "orders")).layer(JsonLayer);

        transport
            .send(Envelope {
                headers: Headers::new(),
                message: serde_json::json!({ "id": 1 }),
            })
            .await
            .unwrap();

        let pending = broker.pending("orders").await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, br#"{"id":1}"#.to_vec());
    }

    #[tokio::test]
    async fn serialization_failures_are_serde_errors() {
        let broker = InMemoryBroker::default();
        let transport = Transport::new(InMemory::new(broker.clone(), "orders")).layer(JsonLayer);

        // JSON object keys must be strings.
        let mut unserializable = BTreeMap::new();
        unserializable.insert(vec![1u8], "value");

        let err = transport
            .send(Envelope {
                headers: Headers::new(),
                message: unserializable,
            })
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), TransportErrorKind::Serde(_)));
        assert!(broker.pending("orders").await.is_empty());
    }
}
