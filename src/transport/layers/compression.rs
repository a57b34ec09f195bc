use crate::{
    Envelope, Headers, codec,
    envelope::{CONTENT_ENCODING, GZIP_ENCODING},
    transport::{RawPayload, TransportError},
};
use std::{future::Future, pin::Pin};
use tower::{Layer, Service};

/// Tower `Service` wrapper that gzip-compresses serialized payloads.
///
/// When enabled, the payload is compressed and the `content-encoding` header
/// is set to `gzip` so receivers know to decompress it. When disabled the
/// envelope passes through untouched.
#[derive(Clone)]
pub struct CompressionService<T> {
    inner: T,
    enabled: bool,
}

impl<T> Service<Envelope<Headers, RawPayload>> for CompressionService<T>
where
    T: Service<Envelope<Headers, RawPayload>> + Clone + Send + 'static,
    T::Error: Into<tower::BoxError>,
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

    fn call(&mut self, req: Envelope<Headers, RawPayload>) -> Self::Future {
        let mut inner = self.inner.clone();
        let enabled = self.enabled;

        Box::pin(async move {
            if !enabled {
                return inner.call(req).await.map_err(Into::<tower::BoxError>::into);
            }

            let compressed = codec::gzip::compress(&req.message.into_inner())
                .map_err(|e| TransportError::compression(Box::new(e)))?;
            let mut headers = req.headers;
            headers.insert(CONTENT_ENCODING, GZIP_ENCODING);

            let envelope = Envelope {
                headers,
                message: RawPayload::from(compressed),
            };
            inner.call(envelope).await.map_err(Into::<tower::BoxError>::into)
        })
    }
}

/// Tower `Layer` that applies `CompressionService` to a service stack.
#[derive(Clone, Copy, Debug)]
pub struct CompressionLayer {
    enabled: bool,
}

impl CompressionLayer {
    /// Create a layer that compresses only when `enabled` is true.
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn gzip() -> Self {
        Self::new(true)
    }
}

impl<S> Layer<S> for CompressionLayer {
    type Service = CompressionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        CompressionService {
            inner: service,
            enabled: self.enabled,
        }
    }
}
