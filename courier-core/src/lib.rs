//! # Courier Core
//!
//! Packet model and serialization capability for the courier messaging
//! runtime.
//!
//! This crate is the leaf of the workspace: it knows nothing about sockets
//! or sessions. It provides:
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`MessageCodec`] | Pluggable body serialization (bring your own format) |
//! | [`Packet`] | The 170-byte fixed-header envelope carried in every frame |
//! | [`PacketRegistry`] | Tag → body schema registration and lazy decode |
//! | [`RequestPacket`] / [`ResponsePacket`] | The two body schemas the runtime itself understands |
//!
//! The envelope header is fixed-width on purpose: routing code inspects
//! destination and origin without ever touching the body bytes. Body
//! decoding is lazy and goes through whichever [`MessageCodec`] the
//! connection was configured with.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod codec;
pub mod error;
pub mod packet;
pub mod registry;
pub mod types;

pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use error::PacketError;
pub use packet::{DESTINATION_WIDTH, HEADER_SIZE, ORIGIN_WIDTH, Packet, SENT_WIDTH};
pub use registry::PacketRegistry;
pub use types::{RequestPacket, ResponsePacket, packet_flags, packet_types, status};
