//! Packet codec error types.

use thiserror::Error;

use crate::codec::CodecError;

/// Errors raised while encoding or decoding packet envelopes.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The buffer is shorter than the 170-byte fixed header.
    #[error("packet header truncated: have {have} of 170 bytes")]
    HeaderTruncated {
        /// Bytes actually available.
        have: usize,
    },

    /// A textual header field does not fit its fixed width.
    #[error("{field} field is {len} bytes encoded, exceeding the {max}-byte width")]
    FieldOverflow {
        /// Which header field overflowed.
        field: &'static str,
        /// UTF-8 length of the value.
        len: usize,
        /// Fixed width of the field on the wire.
        max: usize,
    },

    /// The packet type tag is not present in the registry.
    #[error("unregistered packet type {0:#04x}")]
    UnregisteredPacketType(u8),

    /// A header field decoded to something unusable (bad UTF-8, bad timestamp).
    #[error("invalid {field} header field: {reason}")]
    InvalidHeaderField {
        /// Which header field failed to parse.
        field: &'static str,
        /// Parser diagnostic.
        reason: String,
    },

    /// The registered body schema failed to decode.
    #[error("body decode failed: {0}")]
    Body(#[from] CodecError),
}
