//! Declarative descriptors binding producers and consumers to a connection.
//!
//! A parameter is created once, at registration time, and is read-only
//! afterwards. Parameters can be built in code or bound from configuration
//! with [`Settings::section`](crate::Settings::section).

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

/// Largest accepted `max_concurrent_calls`.
///
/// Every call holds one semaphore permit, and shutdown reclaims all of them
/// at once, so the limit must fit both the semaphore and a `u32` permit count.
pub const MAX_CONCURRENT_CALLS: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    u32::MAX as usize
};

/// Describes where and how a [`Producer`](crate::Producer) publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerParameter {
    connection_id: String,
    destination: String,
    #[serde(default)]
    compress: bool,
}

impl ProducerParameter {
    /// Publish to `destination` (topic, routing key or queue) over the
    /// connection configured under `connection_id`.
    pub fn new(connection_id: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            destination: destination.into(),
            compress: false,
        }
    }

    /// Gzip payloads after serialization.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    pub fn validate(&self) -> Result<(), InvalidParameter> {
        require_non_empty("connection_id", &self.connection_id)?;
        require_non_empty("destination", &self.destination)
    }
}

/// Describes where a [`Consumer`](crate::Consumer) receives from and how it
/// acknowledges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerParameter {
    connection_id: String,
    destination: String,
    #[serde(default)]
    subscription: Option<String>,
    #[serde(default)]
    auto_complete: bool,
    #[serde(default = "default_max_concurrent_calls")]
    max_concurrent_calls: usize,
}

fn default_max_concurrent_calls() -> usize {
    1
}

impl ConsumerParameter {
    /// Consume from `destination` (topic or queue) over the connection
    /// configured under `connection_id`.
    pub fn new(connection_id: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            destination: destination.into(),
            subscription: None,
            auto_complete: false,
            max_concurrent_calls: default_max_concurrent_calls(),
        }
    }

    /// Subscription or consumer group name, for brokers that have one.
    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = Some(subscription.into());
        self
    }

    /// Complete every message once the handler returns, regardless of its
    /// result.
    pub fn with_auto_complete(mut self, auto_complete: bool) -> Self {
        self.auto_complete = auto_complete;
        self
    }

    pub fn with_max_concurrent_calls(mut self, max_concurrent_calls: usize) -> Self {
        self.max_concurrent_calls = max_concurrent_calls;
        self
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn subscription(&self) -> Option<&str> {
        self.subscription.as_deref()
    }

    pub fn auto_complete(&self) -> bool {
        self.auto_complete
    }

    pub fn max_concurrent_calls(&self) -> usize {
        self.max_concurrent_calls
    }

    pub fn validate(&self) -> Result<(), InvalidParameter> {
        require_non_empty("connection_id", &self.connection_id)?;
        require_non_empty("destination", &self.destination)?;
        if self.max_concurrent_calls == 0 {
            return Err(InvalidParameter::new(
                "max_concurrent_calls must be at least 1",
            ));
        }
        if self.max_concurrent_calls > MAX_CONCURRENT_CALLS {
            return Err(InvalidParameter::new(format!(
                "max_concurrent_calls cannot exceed {MAX_CONCURRENT_CALLS}"
            )));
        }
        Ok(())
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), InvalidParameter> {
    if value.trim().is_empty() {
        return Err(InvalidParameter::new(format!("{field} cannot be empty")));
    }
    Ok(())
}

/// Error returned when a parameter fails validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidParameter {
    message: String,
}

impl InvalidParameter {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for InvalidParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid parameter: {}", self.message)
    }
}

impl std::error::Error for InvalidParameter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_defaults() {
        let parameter = ConsumerParameter::new("bus", "orders");

        assert!(!parameter.auto_complete());
        assert_eq!(parameter.max_concurrent_calls(), 1);
        assert_eq!(parameter.subscription(), None);
        assert!(parameter.validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let parameter = ConsumerParameter::new("bus", "orders").with_max_concurrent_calls(0);

        let err = parameter.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid parameter: max_concurrent_calls must be at least 1"
        );
    }

    #[test]
    fn concurrency_above_permit_limit_is_rejected() {
        let at_limit =
            ConsumerParameter::new("bus", "orders").with_max_concurrent_calls(MAX_CONCURRENT_CALLS);
        assert!(at_limit.validate().is_ok());

        for too_many in [MAX_CONCURRENT_CALLS + 1, usize::MAX] {
            let parameter =
                ConsumerParameter::new("bus", "orders").with_max_concurrent_calls(too_many);
            let err = parameter.validate().unwrap_err();
            assert!(err.to_string().contains("cannot exceed"));
        }
    }

    #[test]
    fn empty_destination_is_rejected() {
        let parameter = ProducerParameter::new("bus", " ");

        assert!(parameter.validate().is_err());
    }

    #[test]
    fn producer_compression_defaults_to_off() {
        let parameter: ProducerParameter =
            serde_json::from_str(r#"{"connection_id":"bus","destination":"orders"}"#).unwrap();

        assert!(!parameter.compress());
        assert!(parameter.with_compression(true).compress());
    }
}
