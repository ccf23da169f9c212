//! Handshake and authentication capability.
//!
//! Authentication runs after the transport connects, as the first
//! request/response pair over the new connection's read loop. The
//! [`Authenticator`] trait abstracts the client side of that exchange;
//! [`PasswordAuthenticator`] is the bundled reference implementation. The
//! server-side counterpart lives in the accept machinery
//! ([`crate::server::HandshakeAuthority`]).

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{MessageCodec, RequestPacket};

use crate::connection::Connection;
use crate::error::TransportResult;

/// Operation name of the handshake request.
pub const AUTH_REQUEST: &str = "authenticate";
/// Handshake argument carrying the user name.
pub const AUTH_ARG_USER: &str = "user";
/// Handshake argument carrying the password, omitted when there is none.
pub const AUTH_ARG_PASSWORD: &str = "password";

/// Credentials presented by a client session.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// User identifier, at most 64 UTF-8 bytes once on the wire.
    pub user: String,
    /// Optional shared secret.
    pub password: Option<String>,
}

impl Credentials {
    /// Credentials for `user`.
    pub fn new(user: impl Into<String>, password: Option<String>) -> Self {
        Self {
            user: user.into(),
            password,
        }
    }
}

/// Outcome of the authentication exchange.
#[derive(Debug, Clone)]
pub struct AuthenticationResult {
    /// Whether the peer accepted the credentials.
    pub successful: bool,
    /// Error code when unsuccessful.
    pub error_code: Option<String>,
    /// The authenticated user when successful.
    pub user: Option<String>,
}

impl AuthenticationResult {
    /// A successful result for `user`.
    pub fn ok(user: impl Into<String>) -> Self {
        Self {
            successful: true,
            error_code: None,
            user: Some(user.into()),
        }
    }

    /// A rejection carrying `code`.
    pub fn failed(code: impl Into<String>) -> Self {
        Self {
            successful: false,
            error_code: Some(code.into()),
            user: None,
        }
    }
}

/// Client-side handshake capability.
///
/// Implementations exchange whatever traffic they need over the freshly
/// opened connection and report the outcome. Transport failures during
/// the exchange propagate as errors; a *rejection* is a successful
/// exchange with `successful == false`.
#[async_trait]
pub trait Authenticator<C: MessageCodec>: Send + Sync {
    /// Run the exchange on `connection`.
    async fn authenticate(
        &self,
        connection: &Arc<Connection<C>>,
        credentials: &Credentials,
    ) -> TransportResult<AuthenticationResult>;
}

/// The bundled authenticator: one `authenticate` request carrying user
/// and optional password; the response status decides the outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct PasswordAuthenticator;

#[async_trait]
impl<C: MessageCodec> Authenticator<C> for PasswordAuthenticator {
    async fn authenticate(
        &self,
        connection: &Arc<Connection<C>>,
        credentials: &Credentials,
    ) -> TransportResult<AuthenticationResult> {
        let mut request =
            RequestPacket::new(AUTH_REQUEST).with_arg(AUTH_ARG_USER, credentials.user.as_str());
        if let Some(password) = &credentials.password {
            request = request.with_arg(AUTH_ARG_PASSWORD, password.as_str());
        }

        let response = connection.request(request, "").await?;
        if response.is_ok() {
            Ok(AuthenticationResult::ok(credentials.user.clone()))
        } else {
            Ok(AuthenticationResult::failed(response.status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_constructors() {
        let ok = AuthenticationResult::ok("userA");
        assert!(ok.successful);
        assert_eq!(ok.user.as_deref(), Some("userA"));
        assert!(ok.error_code.is_none());

        let failed = AuthenticationResult::failed("Unauthorized");
        assert!(!failed.successful);
        assert_eq!(failed.error_code.as_deref(), Some("Unauthorized"));
        assert!(failed.user.is_none());
    }

    #[test]
    fn credentials_carry_optional_password() {
        let anonymous = Credentials::new("userA", None);
        assert!(anonymous.password.is_none());

        let secret = Credentials::new("userB", Some("hunter2".to_string()));
        assert_eq!(secret.password.as_deref(), Some("hunter2"));
    }
}
