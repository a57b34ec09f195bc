//! Serialization and compression strategies shared by producers and consumers.
//!
//! Producers apply them through the [`layers`](crate::transport::layers)
//! stack; consumers apply the inverse in [`decode`] before dispatching a
//! delivery to the handler.

use serde::{Serialize, de::DeserializeOwned};

use crate::{Headers, transport::TransportError};

/// JSON serialization helpers.
pub mod json {
    use super::*;

    /// Serialize a value to JSON bytes.
    pub fn to_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(value)
    }

    /// Deserialize a value from JSON bytes.
    pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Gzip compression helpers.
pub mod gzip {
    use std::io::{Read as _, Write as _};

    use flate2::{Compression, read::GzDecoder, write::GzEncoder};

    pub fn compress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder =
            GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
        encoder.write_all(bytes)?;
        encoder.finish()
    }

    pub fn decompress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(bytes);
        let mut out = Vec::with_capacity(bytes.len() * 2);
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Decode a received payload into `M`.
///
/// The payload is decompressed first when `headers` mark it as gzip encoded.
pub fn decode<M: DeserializeOwned>(headers: &Headers, payload: &[u8]) -> Result<M, TransportError> {
    if headers.is_compressed() {
        let bytes =
            gzip::decompress(payload).map_err(|e| TransportError::compression(Box::new(e)))?;
        json::from_bytes(&bytes).map_err(|e| TransportError::serde(Box::new(e)))
    } else {
        json::from_bytes(payload).map_err(|e| TransportError::serde(Box::new(e)))
    }
}
