//! Pluggable body serialization.
//!
//! The [`MessageCodec`] trait lets applications choose the serialization
//! format for packet bodies (JSON, bincode, an XML dialect, ...) while the
//! envelope header stays a fixed binary layout. [`JsonCodec`] is the
//! bundled textual implementation, convenient for debugging and used by
//! the integration tests.
//!
//! # Implementing a codec
//!
//! ```rust
//! use courier_core::{CodecError, MessageCodec};
//! use serde::{Serialize, de::DeserializeOwned};
//!
//! #[derive(Clone, Default)]
//! struct PrettyJsonCodec;
//!
//! impl MessageCodec for PrettyJsonCodec {
//!     fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
//!         serde_json::to_vec_pretty(value).map_err(|e| CodecError::Encode(Box::new(e)))
//!     }
//!
//!     fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
//!         serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(Box::new(e)))
//!     }
//! }
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Error type for codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Failed to encode a body to bytes.
    #[error("encode error: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Failed to decode bytes to a body.
    #[error("decode error: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Serialization capability for packet bodies.
///
/// Codecs must be `Clone + Send + Sync` so a single instance can be shared
/// by a connection's send path and read loop. Message types go through
/// serde, which keeps the capability format-agnostic.
pub trait MessageCodec: Clone + Send + Sync + 'static {
    /// Encode a serializable body to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a body.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by `serde_json`.
///
/// The textual format used by the end-to-end tests. Human-readable, not
/// the most compact choice for production traffic.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        id: u32,
        label: String,
    }

    #[test]
    fn json_roundtrip() {
        let codec = JsonCodec;
        let probe = Probe {
            id: 7,
            label: "seven".to_string(),
        };

        let bytes = codec.encode(&probe).expect("encode");
        let back: Probe = codec.decode(&bytes).expect("decode");
        assert_eq!(probe, back);
    }

    #[test]
    fn json_decode_error_is_reported() {
        let codec = JsonCodec;
        let result: Result<Probe, CodecError> = codec.decode(b"{ not json");
        let err = result.expect_err("malformed input must fail");
        assert!(matches!(err, CodecError::Decode(_)));
        assert!(err.to_string().contains("decode error"));
    }

    #[test]
    fn json_type_mismatch_fails() {
        let codec = JsonCodec;
        let bytes = codec.encode(&42u64).expect("encode");
        let result: Result<Probe, CodecError> = codec.decode(&bytes);
        assert!(result.is_err());
    }
}
