//! # Courier Transport
//!
//! Connection, session, and server runtime for the courier messaging
//! protocol: bidirectional request/response and one-way packets between
//! client endpoints and a central server over TCP.
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │            Application / Modules                │
//! ├─────────────────────────────────────────────────┤
//! │  Session (client)         Server (accept loop)  │
//! │  • connect + authenticate • handshake authority │
//! │  • bounded reconnection   • user directory      │
//! │  • module dispatch chain                        │
//! ├─────────────────────────────────────────────────┤
//! │  Connection                                     │
//! │  • lifecycle state machine                      │
//! │  • mutex-guarded send path                      │
//! │  • one read loop per link                       │
//! │  • request correlator with timeouts             │
//! ├─────────────────────────────────────────────────┤
//! │  Wire framing  [id:8][len:4][packet envelope]   │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! The packet envelope and body serialization live in `courier-core`.
//!
//! ## Quick start
//!
//! ```ignore
//! use courier_core::JsonCodec;
//! use courier_transport::{Credentials, Server, Session, StaticUsers};
//!
//! let server = Server::builder(JsonCodec)
//!     .authority(StaticUsers::new().with_user("userA", None))
//!     .build();
//! let address = server.bind("127.0.0.1:0").await?;
//!
//! let session = Session::builder(address.to_string(), JsonCodec).build();
//! session.connect(Credentials::new("userA", None)).await?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod auth;
pub mod connection;
pub mod error;
pub mod retry;
pub mod server;
pub mod session;
pub mod signal;
pub mod wire;

pub use auth::{AuthenticationResult, Authenticator, Credentials, PasswordAuthenticator};
pub use connection::{
    Connection, ConnectionConfig, ConnectionEvents, ConnectionOrigin, ConnectionState,
    MetricsSnapshot,
};
pub use error::{TransportError, TransportResult};
pub use retry::RetryPolicy;
pub use server::{
    HandshakeAuthority, Server, ServerBuilder, ServerConfig, ServerRequestHandler, StaticUsers,
    UserDirectory,
};
pub use session::{
    BoxError, ModuleRegistry, RequestContext, RequestHandler, Session, SessionBuilder,
    SessionConfig, SessionModule,
};
pub use signal::{ErrorSink, LogSink};
