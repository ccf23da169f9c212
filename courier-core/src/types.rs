//! Body schemas the runtime itself understands, plus the flag and status
//! constants shared by both ends of a connection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Packet type tags reserved by the runtime.
///
/// Application packet types must pick tags outside this range.
pub mod packet_types {
    /// A request expecting exactly one response.
    pub const REQUEST: u8 = 1;
    /// The response to an earlier request.
    pub const RESPONSE: u8 = 2;
}

/// Intent bits carried in the envelope `flags` byte.
pub mod packet_flags {
    /// The packet is a request and a response is expected.
    pub const REQUEST: u8 = 1 << 0;
    /// The packet answers an earlier request.
    pub const RESPONSE: u8 = 1 << 1;
    /// Fire-and-forget: no response will follow.
    pub const ONE_WAY: u8 = 1 << 2;
}

/// Response status codes.
pub mod status {
    /// The request was handled successfully.
    pub const OK: &str = "Ok";
    /// A handler raised while processing the request; the error was
    /// reported locally and this placeholder returned so the requester is
    /// not left waiting.
    pub const UNHANDLED_SERVER_ERROR: &str = "UnhandledServerError";
    /// The handshake credentials were rejected.
    pub const UNAUTHORIZED: &str = "Unauthorized";
}

/// Body schema for [`packet_types::REQUEST`].
///
/// `request_id` is assigned by the sending connection's correlator; the
/// name and argument map are application-defined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPacket {
    /// Correlation id, unique per connection and sender.
    pub request_id: u64,
    /// Operation name.
    pub name: String,
    /// Free-form string arguments.
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

impl RequestPacket {
    /// A request with the given operation name and no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            request_id: 0,
            name: name.into(),
            args: BTreeMap::new(),
        }
    }

    /// Add an argument.
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Look up an argument.
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }
}

/// Body schema for [`packet_types::RESPONSE`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePacket {
    /// The `request_id` of the request this answers.
    pub request_id: u64,
    /// [`status::OK`] or an error code string.
    pub status: String,
    /// Optional application payload, already in the codec's format.
    #[serde(default)]
    pub payload: Option<Vec<u8>>,
}

impl ResponsePacket {
    /// A successful response to `request`.
    pub fn ok(request: &RequestPacket) -> Self {
        Self {
            request_id: request.request_id,
            status: status::OK.to_string(),
            payload: None,
        }
    }

    /// An error response carrying `code`.
    pub fn error(request_id: u64, code: impl Into<String>) -> Self {
        Self {
            request_id,
            status: code.into(),
            payload: None,
        }
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Whether the status is [`status::OK`].
    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_args() {
        let request = RequestPacket::new("login")
            .with_arg("user", "userA")
            .with_arg("tries", "3");
        assert_eq!(request.name, "login");
        assert_eq!(request.arg("user"), Some("userA"));
        assert_eq!(request.arg("missing"), None);
    }

    #[test]
    fn response_correlates_with_request() {
        let mut request = RequestPacket::new("ping");
        request.request_id = 99;

        let ok = ResponsePacket::ok(&request);
        assert_eq!(ok.request_id, 99);
        assert!(ok.is_ok());

        let failed = ResponsePacket::error(99, status::UNAUTHORIZED);
        assert_eq!(failed.request_id, 99);
        assert!(!failed.is_ok());
    }

    #[test]
    fn response_payload_roundtrip() {
        let request = RequestPacket::new("fetch");
        let response = ResponsePacket::ok(&request).with_payload(vec![1, 2, 3]);
        assert_eq!(response.payload.as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn flag_bits_are_distinct() {
        let all = packet_flags::REQUEST | packet_flags::RESPONSE | packet_flags::ONE_WAY;
        assert_eq!(all.count_ones(), 3);
    }
}
