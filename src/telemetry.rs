//! Telemetry interception for producers, consumers and any Tower service.
//!
//! A [`TelemetryScope`] starts a timer when it is created and emits exactly one
//! [`TelemetryRecord`] when it is dropped, so the record is produced whether
//! the wrapped call succeeds, fails or is cancelled mid-flight.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use tower::{Layer, Service};

use crate::{Envelope, transport::ToBytes};

/// Outcome of a single intercepted operation.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    /// Operation name, e.g. `send orders`.
    pub operation: String,
    pub duration: Duration,
    /// Payload size in bytes, when known.
    pub size: Option<usize>,
    pub success: bool,
}

/// Destination for telemetry records.
///
/// Sinks are called synchronously from drop glue and should avoid heavy or
/// blocking work.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, record: TelemetryRecord);
}

/// Sink emitting records as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, record: TelemetryRecord) {
        let duration_ms = record.duration.as_secs_f64() * 1000.0;
        if record.success {
            tracing::info!(
                operation = %record.operation,
                duration_ms,
                size = ?record.size,
                "operation completed"
            );
        } else {
            tracing::warn!(
                operation = %record.operation,
                duration_ms,
                size = ?record.size,
                "operation failed"
            );
        }
    }
}

/// Sink discarding every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record(&self, _record: TelemetryRecord) {}
}

/// Drop guard timing one operation.
///
/// The scope reports a failure unless [`succeed`](TelemetryScope::succeed) is
/// called before it goes out of scope.
pub struct TelemetryScope {
    operation: String,
    start: Instant,
    size: Option<usize>,
    success: bool,
    sink: Arc<dyn TelemetrySink>,
}

impl TelemetryScope {
    pub fn start(operation: impl Into<String>, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            operation: operation.into(),
            start: Instant::now(),
            size: None,
            success: false,
            sink,
        }
    }

    pub fn set_size(&mut self, size: usize) {
        self.size = Some(size);
    }

    pub fn succeed(&mut self) {
        self.success = true;
    }

    pub fn fail(&mut self) {
        self.success = false;
    }
}

impl Drop for TelemetryScope {
    fn drop(&mut self) {
        self.sink.record(TelemetryRecord {
            operation: std::mem::take(&mut self.operation),
            duration: self.start.elapsed(),
            size: self.size,
            success: self.success,
        });
    }
}

/// Requests that can report their payload size to telemetry.
pub trait PayloadSize {
    fn payload_size(&self) -> Option<usize>;
}

impl<H, M: ToBytes> PayloadSize for Envelope<H, M> {
    fn payload_size(&self) -> Option<usize> {
        Some(self.message.to_bytes().len())
    }
}

/// Tower `Service` wrapper recording a [`TelemetryRecord`] per call.
#[derive(Clone)]
pub struct TelemetryService<S> {
    inner: S,
    operation: Arc<str>,
    sink: Arc<dyn TelemetrySink>,
}

impl<S, R> Service<R> for TelemetryService<S>
where
    R: PayloadSize + Send + 'static,
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: R) -> Self::Future {
        let mut scope = TelemetryScope::start(self.operation.as_ref(), Arc::clone(&self.sink));
        if let Some(size) = req.payload_size() {
            scope.set_size(size);
        }
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let result = inner.call(req).await;
            if result.is_ok() {
                scope.succeed();
            }
            result
        })
    }
}

/// Tower `Layer` that applies [`TelemetryService`] to a service stack.
#[derive(Clone)]
pub struct TelemetryLayer {
    operation: Arc<str>,
    sink: Arc<dyn TelemetrySink>,
}

impl TelemetryLayer {
    pub fn new(operation: impl Into<String>, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            operation: Arc::from(operation.into()),
            sink,
        }
    }
}

impl<S> Layer<S> for TelemetryLayer {
    type Service = TelemetryService<S>;

    fn layer(&self, service: S) -> Self::Service {
        TelemetryService {
            inner: service,
            operation: Arc::clone(&self.operation),
            sink: Arc::clone(&self.sink),
        }
    }
}

/// Sink keeping every record in memory.
///
/// Useful to assert on telemetry in tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingTelemetry {
    records: Arc<std::sync::Mutex<Vec<TelemetryRecord>>>,
}

impl RecordingTelemetry {
    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn record(&self, record: TelemetryRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}
