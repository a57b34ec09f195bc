use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Unique identifier stamped on every produced message.
pub const MESSAGE_ID: &str = "message-id";
/// Identifier shared by every message that belongs to the same conversation.
pub const CORRELATION_ID: &str = "correlation-id";
/// Media type of the serialized payload.
pub const CONTENT_TYPE: &str = "content-type";
/// Encoding applied on top of the serialized payload, absent when uncompressed.
pub const CONTENT_ENCODING: &str = "content-encoding";

/// Value of [`CONTENT_TYPE`] for JSON payloads.
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Value of [`CONTENT_ENCODING`] for gzip payloads.
pub const GZIP_ENCODING: &str = "gzip";

/// Message container used by producers, consumers and transports.
///
/// `Envelope` bundles a message payload together with its associated headers.
/// It is intentionally generic and transport-agnostic.
///
/// ## Design
///
/// - `H` represents message metadata (e.g. correlation IDs or encodings).
///   Inside the framework this is [`Headers`].
/// - `M` represents the actual message payload: a typed value before
///   serialization, a [`RawPayload`](crate::transport::RawPayload) after it.
///
/// ## Conversion
///
/// `Envelope` implements `From<(H, M)>` for ergonomic construction when headers
/// and payload are already available as a tuple.
///
/// ## Example
///
/// ```rust
/// use liquid_messaging::{Envelope, Headers};
///
/// let envelope = Envelope {
///     headers: Headers::new(),
///     message: 42,
/// };
///
/// // or, equivalently
/// let envelope: Envelope<_, _> = (Headers::new(), 42).into();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<H, M> {
    /// Message metadata.
    pub headers: H,
    /// Message payload.
    pub message: M,
}

impl<H, M> From<(H, M)> for Envelope<H, M> {
    fn from(value: (H, M)) -> Self {
        Envelope {
            headers: value.0,
            message: value.1,
        }
    }
}

/// String header map attached to every message.
///
/// Keys are kept ordered so headers render deterministically in logs and on
/// the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Insert a header, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Insert a header only when `key` is not present yet.
    pub fn insert_if_absent(&mut self, key: &str, value: impl FnOnce() -> String) {
        if !self.0.contains_key(key) {
            self.0.insert(key.to_owned(), value());
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn message_id(&self) -> Option<&str> {
        self.get(MESSAGE_ID)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get(CORRELATION_ID)
    }

    /// Whether the payload these headers describe is gzip compressed.
    pub fn is_compressed(&self) -> bool {
        self.get(CONTENT_ENCODING)
            .is_some_and(|encoding| encoding.eq_ignore_ascii_case(GZIP_ENCODING))
    }

    /// Headers for a follow-up message continuing the same conversation.
    ///
    /// Only the correlation id is carried over; message id and encodings are
    /// stamped again when the follow-up is sent.
    pub fn correlated_with(incoming: &Headers) -> Self {
        let mut headers = Headers::new();
        if let Some(id) = incoming.correlation_id() {
            headers.insert(CORRELATION_ID, id);
        }
        headers
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from(value: [(K, V); N]) -> Self {
        value.into_iter().collect()
    }
}

impl IntoIterator for Headers {
    type Item = (String, String);
    type IntoIter = std::collections::btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
