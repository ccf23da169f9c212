//! Server runtime: accept loop, handshake verification, and the
//! user-to-connection directory.
//!
//! The listener side is deliberately thin. Accepted sockets become
//! listener-origin connections that go straight to `Handshaking`; the
//! first request on each must be the `authenticate` exchange, verified by
//! the pluggable [`HandshakeAuthority`]. Authenticated connections are
//! entered into the [`UserDirectory`], which server-side code uses to
//! issue requests to specific users.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{
    MessageCodec, Packet, PacketRegistry, RequestPacket, ResponsePacket, status,
};
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::auth::{AUTH_ARG_PASSWORD, AUTH_ARG_USER, AUTH_REQUEST};
use crate::connection::{Connection, ConnectionConfig, ConnectionEvents};
use crate::error::{TransportError, TransportResult};
use crate::session::{BoxError, RequestContext};
use crate::signal::{self, ErrorSink};

/// Verifies handshake credentials on the server side.
#[async_trait]
pub trait HandshakeAuthority: Send + Sync {
    /// Whether `user` with `password` may join.
    async fn verify(&self, user: &str, password: Option<&str>) -> bool;
}

/// In-memory user table: user → expected password (or none).
#[derive(Debug, Clone, Default)]
pub struct StaticUsers {
    users: HashMap<String, Option<String>>,
}

impl StaticUsers {
    /// An empty table; rejects everyone.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user.
    pub fn with_user(mut self, user: impl Into<String>, password: Option<String>) -> Self {
        self.users.insert(user.into(), password);
        self
    }
}

#[async_trait]
impl HandshakeAuthority for StaticUsers {
    async fn verify(&self, user: &str, password: Option<&str>) -> bool {
        match self.users.get(user) {
            Some(expected) => expected.as_deref() == password,
            None => false,
        }
    }
}

/// Handler for post-handshake requests arriving from clients.
#[async_trait]
pub trait ServerRequestHandler<C: MessageCodec>: Send + Sync {
    /// Inspect (and possibly claim) an inbound request.
    async fn handle_request(
        &self,
        server: &Server<C>,
        connection: &Arc<Connection<C>>,
        context: &mut RequestContext,
    ) -> Result<(), BoxError>;
}

/// Directory of authenticated users and their connections.
pub struct UserDirectory<C: MessageCodec> {
    connections: StdMutex<HashMap<String, Arc<Connection<C>>>>,
}

impl<C: MessageCodec> UserDirectory<C> {
    fn new() -> Self {
        Self {
            connections: StdMutex::new(HashMap::new()),
        }
    }

    /// The connection currently registered for `user`.
    pub fn get(&self, user: &str) -> Option<Arc<Connection<C>>> {
        lock(&self.connections).get(user).cloned()
    }

    /// Registered user names.
    pub fn users(&self) -> Vec<String> {
        lock(&self.connections).keys().cloned().collect()
    }

    /// Number of authenticated users.
    pub fn len(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Whether nobody is connected.
    pub fn is_empty(&self) -> bool {
        lock(&self.connections).is_empty()
    }

    fn insert(&self, user: String, connection: Arc<Connection<C>>) {
        lock(&self.connections).insert(user, connection);
    }

    fn remove_connection(&self, connection: &Arc<Connection<C>>) -> Option<String> {
        let mut connections = lock(&self.connections);
        let user = connections
            .iter()
            .find(|(_, current)| Arc::ptr_eq(current, connection))
            .map(|(user, _)| user.clone())?;
        connections.remove(&user);
        Some(user)
    }

    fn drain(&self) -> Vec<Arc<Connection<C>>> {
        lock(&self.connections).drain().map(|(_, c)| c).collect()
    }
}

/// Server tunables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Deadline for server-initiated requests.
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            request_timeout: self.request_timeout,
            ..ConnectionConfig::default()
        }
    }
}

/// Builder for [`Server`].
pub struct ServerBuilder<C: MessageCodec> {
    codec: C,
    registry: PacketRegistry<C>,
    authority: Option<Arc<dyn HandshakeAuthority>>,
    config: ServerConfig,
    error_sink: Option<Arc<dyn ErrorSink>>,
}

impl<C: MessageCodec> ServerBuilder<C> {
    /// Start building a server.
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            registry: PacketRegistry::with_core_types(),
            authority: None,
            config: ServerConfig::default(),
            error_sink: None,
        }
    }

    /// Install the handshake authority. Without one, every handshake is
    /// rejected.
    pub fn authority(mut self, authority: impl HandshakeAuthority + 'static) -> Self {
        self.authority = Some(Arc::new(authority));
        self
    }

    /// Replace the default configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an application packet type.
    pub fn register_packet<T>(mut self, packet_type: u8, name: &'static str) -> Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.registry.register::<T>(packet_type, name);
        self
    }

    /// Replace the process-wide error sink for this server.
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Freeze the registry and produce the server.
    pub fn build(self) -> Server<C> {
        let inner = Arc::new_cyclic(|self_ref| ServerInner {
            codec: self.codec,
            registry: Arc::new(self.registry),
            authority: self
                .authority
                .unwrap_or_else(|| Arc::new(StaticUsers::new())),
            config: self.config,
            error_sink: self.error_sink.unwrap_or_else(signal::process_sink),
            users: UserDirectory::new(),
            shutdown: CancellationToken::new(),
            handler: StdMutex::new(None),
            self_ref: self_ref.clone(),
        });
        Server { inner }
    }
}

/// The central endpoint clients dial into.
pub struct Server<C: MessageCodec> {
    inner: Arc<ServerInner<C>>,
}

impl<C: MessageCodec> Clone for Server<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ServerInner<C: MessageCodec> {
    codec: C,
    registry: Arc<PacketRegistry<C>>,
    authority: Arc<dyn HandshakeAuthority>,
    config: ServerConfig,
    error_sink: Arc<dyn ErrorSink>,
    users: UserDirectory<C>,
    shutdown: CancellationToken,
    handler: StdMutex<Option<Arc<dyn ServerRequestHandler<C>>>>,
    self_ref: Weak<ServerInner<C>>,
}

impl<C: MessageCodec> Server<C> {
    /// Start building a server.
    pub fn builder(codec: C) -> ServerBuilder<C> {
        ServerBuilder::new(codec)
    }

    /// Bind `address` and start the accept loop. Returns the bound
    /// address (useful with port 0).
    pub async fn bind(&self, address: &str) -> TransportResult<SocketAddr> {
        let listener = TcpListener::bind(address).await?;
        let local_address = listener.local_addr()?;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(accept_loop(inner, listener));
        tracing::info!(%local_address, "listening");
        Ok(local_address)
    }

    /// Install the handler for post-handshake client requests.
    pub fn set_request_handler(&self, handler: impl ServerRequestHandler<C> + 'static) {
        *lock(&self.inner.handler) = Some(Arc::new(handler));
    }

    /// The directory of authenticated users.
    pub fn users(&self) -> &UserDirectory<C> {
        &self.inner.users
    }

    /// Issue a request to a connected user and await the response.
    ///
    /// Raises `NotConnected` when the user is not in the directory.
    pub async fn request_user(
        &self,
        user: &str,
        request: RequestPacket,
    ) -> TransportResult<ResponsePacket> {
        let connection = self
            .inner
            .users
            .get(user)
            .ok_or(TransportError::NotConnected)?;
        connection.request(request, user).await
    }

    /// Stop accepting and close every authenticated connection.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for connection in self.inner.users.drain() {
            connection.close().await;
        }
    }
}

async fn accept_loop<C: MessageCodec>(inner: Arc<ServerInner<C>>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer_address)) => {
                tracing::debug!(%peer_address, "accepted connection");
                let connection = Connection::from_accepted(
                    stream,
                    peer_address.to_string(),
                    inner.codec.clone(),
                    Arc::clone(&inner.registry),
                    inner.config.connection_config(),
                );
                let events: Weak<dyn ConnectionEvents<C>> =
                    Arc::downgrade(&(Arc::clone(&inner) as Arc<dyn ConnectionEvents<C>>));
                connection.set_events(events);
                connection.begin_handshake();
            }
            Err(error) => {
                tracing::warn!(%error, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    tracing::debug!("accept loop stopped");
}

impl<C: MessageCodec> ServerInner<C> {
    fn server(&self) -> Option<Server<C>> {
        self.self_ref.upgrade().map(|inner| Server { inner })
    }

    async fn handle_authentication(
        &self,
        connection: &Arc<Connection<C>>,
        request: RequestPacket,
    ) {
        let user = request.arg(AUTH_ARG_USER).unwrap_or_default().to_string();
        let password = request.arg(AUTH_ARG_PASSWORD);
        let accepted = !user.is_empty() && self.authority.verify(&user, password).await;

        let response = if accepted {
            connection.mark_connected();
            self.users.insert(user.clone(), Arc::clone(connection));
            tracing::info!(
                %user,
                remote = connection.remote_address(),
                "user authenticated"
            );
            ResponsePacket::ok(&request)
        } else {
            tracing::warn!(%user, remote = connection.remote_address(), "handshake rejected");
            ResponsePacket::error(request.request_id, status::UNAUTHORIZED)
        };

        if let Err(error) = connection.respond(response, &user).await {
            self.error_sink
                .background_error("handshake response send", &error);
        }
    }
}

#[async_trait]
impl<C: MessageCodec> ConnectionEvents<C> for ServerInner<C> {
    async fn request_received(
        &self,
        connection: &Arc<Connection<C>>,
        packet: Packet,
        request: RequestPacket,
    ) {
        if request.name == AUTH_REQUEST {
            self.handle_authentication(connection, request).await;
            return;
        }

        let request_id = request.request_id;
        let name = request.name.clone();
        let reply_to = packet.origin.clone();
        let handler = lock(&self.handler).clone();

        let response = match handler {
            Some(handler) => {
                let Some(server) = self.server() else {
                    return;
                };
                let mut context = RequestContext::new(request, packet.origin.clone());
                match handler.handle_request(&server, connection, &mut context).await {
                    Ok(()) => context.response.take(),
                    Err(error) => {
                        self.error_sink
                            .background_error("server request handler", error.as_ref());
                        Some(ResponsePacket::error(
                            request_id,
                            status::UNHANDLED_SERVER_ERROR,
                        ))
                    }
                }
            }
            None => None,
        };

        match response {
            Some(mut response) => {
                response.request_id = request_id;
                if let Err(error) = connection.respond(response, &reply_to).await {
                    self.error_sink
                        .background_error("server response send", &error);
                }
            }
            None => {
                tracing::warn!(request_id, %name, "client request left unanswered");
            }
        }
    }

    async fn connection_closed(&self, connection: &Arc<Connection<C>>) {
        if let Some(user) = self.users.remove_connection(connection) {
            tracing::info!(%user, "user disconnected");
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::JsonCodec;

    #[tokio::test]
    async fn static_users_verify_password_exactly() {
        let users = StaticUsers::new()
            .with_user("userA", None)
            .with_user("userB", Some("secret".to_string()));

        assert!(users.verify("userA", None).await);
        assert!(!users.verify("userA", Some("anything")).await);
        assert!(users.verify("userB", Some("secret")).await);
        assert!(!users.verify("userB", Some("wrong")).await);
        assert!(!users.verify("userB", None).await);
        assert!(!users.verify("nobody", None).await);
    }

    #[tokio::test]
    async fn request_to_unknown_user_is_not_connected() {
        let server = Server::builder(JsonCodec)
            .authority(StaticUsers::new().with_user("userA", None))
            .build();
        let err = server
            .request_user("ghost", RequestPacket::new("ping"))
            .await
            .expect_err("unknown user");
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn bind_reports_ephemeral_port() {
        let server = Server::builder(JsonCodec).build();
        let address = server.bind("127.0.0.1:0").await.expect("bind");
        assert_ne!(address.port(), 0);
        server.shutdown().await;
    }
}
