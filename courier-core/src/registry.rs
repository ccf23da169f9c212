//! Packet type registry.
//!
//! Maps the envelope's `packet_type` tag to a registered body schema. The
//! registry is populated while the session or server is being built and is
//! frozen (shared behind `Arc`) afterwards, so lookups never take a lock.
//!
//! Registration is append-only; registering the same tag twice is a
//! programmer error and panics.

use std::any::Any;
use std::collections::HashMap;

use serde::de::DeserializeOwned;

use crate::codec::{CodecError, MessageCodec};
use crate::error::PacketError;
use crate::types::{RequestPacket, ResponsePacket, packet_types};

type DecodeFn<C> = fn(&C, &[u8]) -> Result<Box<dyn Any + Send>, CodecError>;

/// One registered body schema.
pub struct RegistryEntry<C: MessageCodec> {
    name: &'static str,
    decode: DecodeFn<C>,
}

impl<C: MessageCodec> RegistryEntry<C> {
    /// Diagnostic name the schema was registered under.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<C: MessageCodec> std::fmt::Debug for RegistryEntry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name)
            .finish()
    }
}

/// Tag → body schema table for one codec.
#[derive(Debug)]
pub struct PacketRegistry<C: MessageCodec> {
    entries: HashMap<u8, RegistryEntry<C>>,
}

fn decode_erased<C, T>(codec: &C, body: &[u8]) -> Result<Box<dyn Any + Send>, CodecError>
where
    C: MessageCodec,
    T: DeserializeOwned + Send + 'static,
{
    Ok(Box::new(codec.decode::<T>(body)?))
}

impl<C: MessageCodec> PacketRegistry<C> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// A registry with the runtime's own schemas (request, response)
    /// already registered.
    pub fn with_core_types() -> Self {
        let mut registry = Self::new();
        registry.register::<RequestPacket>(packet_types::REQUEST, "request");
        registry.register::<ResponsePacket>(packet_types::RESPONSE, "response");
        registry
    }

    /// Register the body schema `T` under `packet_type`.
    ///
    /// # Panics
    ///
    /// Panics when `packet_type` is already taken; duplicate registration
    /// is a programmer error.
    pub fn register<T>(&mut self, packet_type: u8, name: &'static str)
    where
        T: DeserializeOwned + Send + 'static,
    {
        let previous = self.entries.insert(
            packet_type,
            RegistryEntry {
                name,
                decode: decode_erased::<C, T>,
            },
        );
        assert!(
            previous.is_none(),
            "packet type {packet_type:#04x} is already registered"
        );
    }

    /// Whether `packet_type` is registered.
    pub fn contains(&self, packet_type: u8) -> bool {
        self.entries.contains_key(&packet_type)
    }

    /// Entry metadata for `packet_type`.
    pub fn entry(&self, packet_type: u8) -> Option<&RegistryEntry<C>> {
        self.entries.get(&packet_type)
    }

    /// Number of registered schemas.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode body bytes through the schema registered for `packet_type`.
    ///
    /// Returns the body as `Box<dyn Any>`; callers downcast to the
    /// registered type.
    ///
    /// # Errors
    ///
    /// [`PacketError::UnregisteredPacketType`] for unknown tags,
    /// [`PacketError::Body`] when the registered schema rejects the bytes.
    pub fn decode_body(
        &self,
        packet_type: u8,
        codec: &C,
        body: &[u8],
    ) -> Result<Box<dyn Any + Send>, PacketError> {
        let entry = self
            .entries
            .get(&packet_type)
            .ok_or(PacketError::UnregisteredPacketType(packet_type))?;
        (entry.decode)(codec, body).map_err(PacketError::Body)
    }
}

impl<C: MessageCodec> Default for PacketRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
