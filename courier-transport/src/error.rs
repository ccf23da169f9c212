//! Transport and session error taxonomy.

use std::time::Duration;

use courier_core::{CodecError, PacketError};
use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Every failure the runtime can surface to a caller.
///
/// Framing and codec violations are fatal to their connection; connect
/// failures are retried by the session layer; the rest propagate to the
/// caller that triggered them.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote address did not parse as `host:port`.
    #[error("malformed remote address {0:?}: expected host:port")]
    Format(String),

    /// Every resolved address refused the connection.
    #[error("could not connect to {address}: {detail}")]
    CouldNotConnect {
        /// The `host:port` that was dialed.
        address: String,
        /// The last attempt's failure.
        detail: String,
    },

    /// The connection is closed, was closed mid-operation, or the peer
    /// went away.
    #[error("connection is closed")]
    Disconnected,

    /// A frame declared a payload length outside `(0, 5_000_000]`.
    #[error("invalid frame payload length {length}")]
    InvalidDataLength {
        /// The declared length.
        length: i32,
    },

    /// The authenticator rejected the credentials.
    #[error("authentication failed: {code}")]
    Authentication {
        /// Error code reported by the authenticator.
        code: String,
    },

    /// A request was issued on a session that is neither connected nor
    /// authenticating.
    #[error("session is not connected")]
    NotConnected,

    /// No response arrived within the configured deadline.
    #[error("request {request_id} timed out after {timeout:?}")]
    RequestTimeout {
        /// Correlation id of the abandoned request.
        request_id: u64,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The operation is not valid for the object's current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// Envelope codec failure, including unregistered packet types.
    #[error(transparent)]
    Packet(#[from] PacketError),

    /// Body codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Underlying socket failure.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}
