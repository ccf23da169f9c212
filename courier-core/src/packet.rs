//! The packet envelope.
//!
//! Envelope layout (every payload on the wire):
//!
//! ```text
//! offset size field
//! 0      1    packet_type   u8 tag selecting the body schema
//! 1      1    flags         u8 bitmask (request / response / one-way)
//! 2      64   destination   UTF-8, null-padded right
//! 66     64   origin        UTF-8, null-padded right
//! 130    40   sent          RFC 3339 with offset, null-padded right
//! 170    *    body          bytes in the configured codec's format
//! ```
//!
//! The header is fixed-width so routing code can inspect destination and
//! origin without decoding the body. [`Packet::decode`] therefore parses
//! only the first 170 bytes and keeps the body raw; typed access goes
//! through [`Packet::body`] on demand.

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::de::DeserializeOwned;

use crate::codec::{CodecError, MessageCodec};
use crate::error::PacketError;

/// Size of the fixed envelope header.
pub const HEADER_SIZE: usize = 170;

/// Wire width of the destination field.
pub const DESTINATION_WIDTH: usize = 64;

/// Wire width of the origin field.
pub const ORIGIN_WIDTH: usize = 64;

/// Wire width of the textual sent-timestamp field.
pub const SENT_WIDTH: usize = 40;

const DESTINATION_OFFSET: usize = 2;
const ORIGIN_OFFSET: usize = DESTINATION_OFFSET + DESTINATION_WIDTH;
const SENT_OFFSET: usize = ORIGIN_OFFSET + ORIGIN_WIDTH;

/// One decoded (or to-be-encoded) packet envelope.
///
/// `destination` and `origin` are user identifier strings of at most 64
/// UTF-8 bytes; `origin` may be empty on pre-authentication client
/// traffic. The body is kept as raw bytes until a caller asks for a typed
/// view.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Registered tag selecting the body schema.
    pub packet_type: u8,
    /// Intent bitmask, see [`crate::types::packet_flags`].
    pub flags: u8,
    /// Target user identifier. Empty means "the peer itself".
    pub destination: String,
    /// Sending user identifier.
    pub origin: String,
    /// Send timestamp, carried with its UTC offset.
    pub sent: DateTime<FixedOffset>,
    body: Vec<u8>,
}

impl Packet {
    /// Build a packet around already-serialized body bytes, stamped with
    /// the current time.
    pub fn new(
        packet_type: u8,
        flags: u8,
        destination: impl Into<String>,
        origin: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            packet_type,
            flags,
            destination: destination.into(),
            origin: origin.into(),
            sent: Utc::now().fixed_offset(),
            body,
        }
    }

    /// Whether `flag` is set in the intent bitmask.
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Raw body bytes, in the sender's codec format.
    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    /// Decode the body through the configured codec.
    ///
    /// # Errors
    ///
    /// Returns the codec's decode error when the body does not match `T`.
    pub fn body<T, C>(&self, codec: &C) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
        C: MessageCodec,
    {
        codec.decode(&self.body)
    }

    /// Serialize the envelope: 170-byte header followed by the body.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::FieldOverflow`] when a textual header field
    /// exceeds its fixed width.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.body.len());
        buf.push(self.packet_type);
        buf.push(self.flags);
        write_padded(&mut buf, &self.destination, DESTINATION_WIDTH, "destination")?;
        write_padded(&mut buf, &self.origin, ORIGIN_WIDTH, "origin")?;
        let sent = self.sent.to_rfc3339_opts(SecondsFormat::Micros, false);
        write_padded(&mut buf, &sent, SENT_WIDTH, "sent")?;
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    /// Parse an envelope from bytes.
    ///
    /// Only the header is interpreted; the body is sliced off raw.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::HeaderTruncated`] for buffers shorter than
    /// 170 bytes and [`PacketError::InvalidHeaderField`] for unparseable
    /// header content.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::HeaderTruncated { have: bytes.len() });
        }

        let packet_type = bytes[0];
        let flags = bytes[1];
        let destination =
            read_padded(&bytes[DESTINATION_OFFSET..ORIGIN_OFFSET], "destination")?.to_owned();
        let origin = read_padded(&bytes[ORIGIN_OFFSET..SENT_OFFSET], "origin")?.to_owned();
        let sent_text = read_padded(&bytes[SENT_OFFSET..HEADER_SIZE], "sent")?;
        let sent = DateTime::parse_from_rfc3339(sent_text).map_err(|e| {
            PacketError::InvalidHeaderField {
                field: "sent",
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            packet_type,
            flags,
            destination,
            origin,
            sent,
            body: bytes[HEADER_SIZE..].to_vec(),
        })
    }
}

fn write_padded(
    buf: &mut Vec<u8>,
    value: &str,
    width: usize,
    field: &'static str,
) -> Result<(), PacketError> {
    let bytes = value.as_bytes();
    if bytes.len() > width {
        return Err(PacketError::FieldOverflow {
            field,
            len: bytes.len(),
            max: width,
        });
    }
    buf.extend_from_slice(bytes);
    buf.resize(buf.len() + (width - bytes.len()), 0);
    Ok(())
}

fn read_padded<'a>(slice: &'a [u8], field: &'static str) -> Result<&'a str, PacketError> {
    let end = slice.iter().position(|b| *b == 0).unwrap_or(slice.len());
    std::str::from_utf8(&slice[..end]).map_err(|e| PacketError::InvalidHeaderField {
        field,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::types::{RequestPacket, packet_flags, packet_types};

    fn sample_packet(destination: &str, origin: &str) -> Packet {
        Packet::new(
            packet_types::REQUEST,
            packet_flags::REQUEST,
            destination,
            origin,
            b"{}".to_vec(),
        )
    }

    #[test]
    fn header_roundtrip() {
        let packet = sample_packet("userB", "userA");
        let bytes = packet.encode().expect("encode");
        assert_eq!(bytes.len(), HEADER_SIZE + 2);

        let back = Packet::decode(&bytes).expect("decode");
        assert_eq!(back.packet_type, packet.packet_type);
        assert_eq!(back.flags, packet.flags);
        assert_eq!(back.destination, "userB");
        assert_eq!(back.origin, "userA");
        assert_eq!(back.sent, packet.sent);
        assert_eq!(back.body_bytes(), b"{}");
    }

    #[test]
    fn typed_body_roundtrip() {
        let codec = JsonCodec;
        let request = RequestPacket::new("status").with_arg("verbose", "1");
        let body = codec.encode(&request).expect("encode body");
        let packet = Packet::new(
            packet_types::REQUEST,
            packet_flags::REQUEST,
            "",
            "userA",
            body,
        );

        let bytes = packet.encode().expect("encode");
        let back = Packet::decode(&bytes).expect("decode");
        let typed: RequestPacket = back.body(&codec).expect("decode body");
        assert_eq!(typed, request);
    }

    #[test]
    fn empty_origin_is_preserved() {
        let packet = sample_packet("server", "");
        let bytes = packet.encode().expect("encode");
        let back = Packet::decode(&bytes).expect("decode");
        assert_eq!(back.origin, "");
    }

    #[test]
    fn field_at_exact_width_roundtrips() {
        let destination = "d".repeat(DESTINATION_WIDTH);
        let origin = "o".repeat(ORIGIN_WIDTH);
        let packet = sample_packet(&destination, &origin);
        let bytes = packet.encode().expect("encode");
        let back = Packet::decode(&bytes).expect("decode");
        assert_eq!(back.destination, destination);
        assert_eq!(back.origin, origin);
    }

    #[test]
    fn field_overflow_is_rejected() {
        let destination = "d".repeat(DESTINATION_WIDTH + 1);
        let packet = sample_packet(&destination, "userA");
        let err = packet.encode().expect_err("must overflow");
        assert!(matches!(
            err,
            PacketError::FieldOverflow {
                field: "destination",
                len: 65,
                max: DESTINATION_WIDTH,
            }
        ));
    }

    #[test]
    fn multibyte_overflow_counts_utf8_bytes() {
        // 22 three-byte characters encode to 66 bytes.
        let destination = "\u{20AC}".repeat(22);
        assert_eq!(destination.len(), 66);
        let err = sample_packet(&destination, "").encode().expect_err("overflow");
        assert!(matches!(err, PacketError::FieldOverflow { len: 66, .. }));
    }

    #[test]
    fn non_ascii_header_roundtrips() {
        let packet = sample_packet("bj\u{F6}rn", "ren\u{E9}e");
        let bytes = packet.encode().expect("encode");
        let back = Packet::decode(&bytes).expect("decode");
        assert_eq!(back.destination, "bj\u{F6}rn");
        assert_eq!(back.origin, "ren\u{E9}e");
    }

    #[test]
    fn truncated_header_is_rejected() {
        let err = Packet::decode(&[0u8; HEADER_SIZE - 1]).expect_err("too short");
        assert!(matches!(err, PacketError::HeaderTruncated { have } if have == HEADER_SIZE - 1));
    }

    #[test]
    fn bad_timestamp_is_rejected() {
        let packet = sample_packet("userB", "userA");
        let mut bytes = packet.encode().expect("encode");
        bytes[SENT_OFFSET..SENT_OFFSET + 4].copy_from_slice(b"zzzz");
        let err = Packet::decode(&bytes).expect_err("bad timestamp");
        assert!(matches!(
            err,
            PacketError::InvalidHeaderField { field: "sent", .. }
        ));
    }

    #[test]
    fn bad_utf8_is_rejected() {
        let packet = sample_packet("userB", "userA");
        let mut bytes = packet.encode().expect("encode");
        bytes[DESTINATION_OFFSET] = 0xFF;
        let err = Packet::decode(&bytes).expect_err("bad utf-8");
        assert!(matches!(
            err,
            PacketError::InvalidHeaderField {
                field: "destination",
                ..
            }
        ));
    }

    #[test]
    fn header_parses_without_touching_body() {
        // The body is deliberately not valid for any codec; header-level
        // decode must still succeed.
        let packet = Packet::new(
            packet_types::RESPONSE,
            packet_flags::RESPONSE,
            "userA",
            "",
            vec![0xFF, 0xFE, 0x00, 0x01],
        );
        let bytes = packet.encode().expect("encode");
        let back = Packet::decode(&bytes).expect("decode");
        assert_eq!(back.body_bytes(), &[0xFF, 0xFE, 0x00, 0x01]);
    }

    #[test]
    fn timestamp_fits_its_field() {
        let sent = Utc::now().fixed_offset();
        let text = sent.to_rfc3339_opts(SecondsFormat::Micros, false);
        assert!(text.len() <= SENT_WIDTH, "{text} exceeds {SENT_WIDTH} bytes");
    }

    #[test]
    fn dotnet_style_timestamp_parses() {
        // Seven fractional digits, as produced by peers on other stacks.
        let packet = sample_packet("userB", "userA");
        let mut bytes = packet.encode().expect("encode");
        let text = b"2024-01-15T10:30:00.0000000+00:00";
        bytes[SENT_OFFSET..SENT_OFFSET + text.len()].copy_from_slice(text);
        for b in &mut bytes[SENT_OFFSET + text.len()..HEADER_SIZE] {
            *b = 0;
        }
        let back = Packet::decode(&bytes).expect("decode");
        assert_eq!(back.sent.to_rfc3339(), "2024-01-15T10:30:00+00:00");
    }
}
