//! Client session: connect, authenticate, dispatch, reconnect.
//!
//! A [`Session`] owns at most one dialer-origin [`Connection`] at a time.
//! `connect` may be called once; after a successful connect the session
//! transparently re-establishes the link (bounded attempts, fixed delay)
//! whenever it drops unexpectedly. Inbound requests run through the
//! attached modules in insertion order, then through the fallback request
//! handler; handler failures surface on the error signal and the peer
//! receives an `UnhandledServerError` response instead of silence.

mod config;
mod modules;

pub use config::SessionConfig;
pub use modules::{BoxError, ModuleRegistry, RequestContext, SessionModule};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use courier_core::{
    MessageCodec, Packet, PacketRegistry, RequestPacket, ResponsePacket, status,
};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::auth::{Authenticator, AuthenticationResult, Credentials, PasswordAuthenticator};
use crate::connection::{Connection, ConnectionEvents};
use crate::error::{TransportError, TransportResult};
use crate::signal::{self, ErrorSink};

/// Callback fired when the session reaches connected. Receives the
/// authenticated user. Errors go to the error signal; they do not fail
/// the connect.
pub type ConnectedHandler = Box<dyn Fn(&str) -> Result<(), BoxError> + Send + Sync>;

/// Callback fired when the active connection is lost.
pub type DisconnectedHandler = Box<dyn Fn() + Send + Sync>;

/// Fallback handler for requests no module claimed.
#[async_trait]
pub trait RequestHandler<C: MessageCodec>: Send + Sync {
    /// Inspect (and possibly claim) an inbound request.
    async fn handle_request(
        &self,
        session: &Session<C>,
        context: &mut RequestContext,
    ) -> Result<(), BoxError>;
}

/// Builder for [`Session`].
pub struct SessionBuilder<C: MessageCodec> {
    remote_address: String,
    codec: C,
    config: SessionConfig,
    registry: PacketRegistry<C>,
    modules: ModuleRegistry<C>,
    authenticator: Option<Arc<dyn Authenticator<C>>>,
    error_sink: Option<Arc<dyn ErrorSink>>,
}

impl<C: MessageCodec> SessionBuilder<C> {
    /// Start building a session that will dial `remote_address`.
    pub fn new(remote_address: impl Into<String>, codec: C) -> Self {
        Self {
            remote_address: remote_address.into(),
            codec,
            config: SessionConfig::default(),
            registry: PacketRegistry::with_core_types(),
            modules: ModuleRegistry::new(),
            authenticator: None,
            error_sink: None,
        }
    }

    /// Replace the default configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default [`PasswordAuthenticator`].
    pub fn authenticator(mut self, authenticator: impl Authenticator<C> + 'static) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    /// Attach a module. Runs the module's packet registration hook.
    pub fn module(mut self, module: impl SessionModule<C>) -> Self {
        module.register_packets(&mut self.registry);
        self.modules.add(module);
        self
    }

    /// Register an application packet type directly.
    pub fn register_packet<T>(mut self, packet_type: u8, name: &'static str) -> Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.registry.register::<T>(packet_type, name);
        self
    }

    /// Replace the process-wide error sink for this session.
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Freeze the registry and produce the session.
    pub fn build(self) -> Session<C> {
        let inner = Arc::new_cyclic(|self_ref| SessionInner {
            remote_address: self.remote_address,
            codec: self.codec,
            registry: Arc::new(self.registry),
            config: self.config,
            modules: self.modules,
            authenticator: self
                .authenticator
                .unwrap_or_else(|| Arc::new(PasswordAuthenticator)),
            error_sink: self.error_sink.unwrap_or_else(signal::process_sink),
            self_ref: self_ref.clone(),
            connect_called: AtomicBool::new(false),
            authenticating: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            is_connected: AtomicBool::new(false),
            user: StdMutex::new(None),
            credentials: StdMutex::new(None),
            connection: StdMutex::new(None),
            disposed: CancellationToken::new(),
            connected_handlers: StdMutex::new(Vec::new()),
            disconnected_handlers: StdMutex::new(Vec::new()),
            fallback: StdMutex::new(None),
        });
        Session { inner }
    }
}

/// A client endpoint's view of its link to the server.
pub struct Session<C: MessageCodec> {
    inner: Arc<SessionInner<C>>,
}

impl<C: MessageCodec> Clone for Session<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct SessionInner<C: MessageCodec> {
    remote_address: String,
    codec: C,
    registry: Arc<PacketRegistry<C>>,
    config: SessionConfig,
    modules: ModuleRegistry<C>,
    authenticator: Arc<dyn Authenticator<C>>,
    error_sink: Arc<dyn ErrorSink>,
    self_ref: Weak<SessionInner<C>>,
    connect_called: AtomicBool,
    authenticating: AtomicBool,
    reconnecting: AtomicBool,
    is_connected: AtomicBool,
    user: StdMutex<Option<String>>,
    credentials: StdMutex<Option<Credentials>>,
    connection: StdMutex<Option<Arc<Connection<C>>>>,
    disposed: CancellationToken,
    connected_handlers: StdMutex<Vec<ConnectedHandler>>,
    disconnected_handlers: StdMutex<Vec<DisconnectedHandler>>,
    fallback: StdMutex<Option<Arc<dyn RequestHandler<C>>>>,
}

impl<C: MessageCodec> Session<C> {
    /// Start building a session.
    pub fn builder(remote_address: impl Into<String>, codec: C) -> SessionBuilder<C> {
        SessionBuilder::new(remote_address, codec)
    }

    /// Connect and authenticate.
    ///
    /// Callable at most once per session; subsequent calls raise
    /// `InvalidOperation` regardless of the first call's outcome. On
    /// success the connected event fires (handler errors go to the error
    /// signal, the connect still succeeds). On failure everything is
    /// rolled back and the error re-raised.
    pub async fn connect(&self, credentials: Credentials) -> TransportResult<()> {
        if self.inner.connect_called.swap(true, Ordering::SeqCst) {
            return Err(TransportError::InvalidOperation(
                "connect may only be called once per session",
            ));
        }
        *lock(&self.inner.credentials) = Some(credentials.clone());
        self.inner.connect_internal(&credentials).await
    }

    /// Whether the session currently holds an authenticated connection.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected.load(Ordering::SeqCst)
    }

    /// The authenticated user, once connected.
    pub fn user(&self) -> Option<String> {
        lock(&self.inner.user).clone()
    }

    /// The modules attached at build time.
    pub fn modules(&self) -> &ModuleRegistry<C> {
        &self.inner.modules
    }

    /// The currently active connection, if any.
    pub fn connection(&self) -> Option<Arc<Connection<C>>> {
        lock(&self.inner.connection).clone()
    }

    /// Subscribe to the connected event.
    pub fn on_connected(&self, handler: impl Fn(&str) -> Result<(), BoxError> + Send + Sync + 'static) {
        lock(&self.inner.connected_handlers).push(Box::new(handler));
    }

    /// Subscribe to the disconnected event.
    pub fn on_disconnected(&self, handler: impl Fn() + Send + Sync + 'static) {
        lock(&self.inner.disconnected_handlers).push(Box::new(handler));
    }

    /// Install the fallback handler for requests no module claimed.
    pub fn set_request_handler(&self, handler: impl RequestHandler<C> + 'static) {
        *lock(&self.inner.fallback) = Some(Arc::new(handler));
    }

    /// Issue a request to the server and await the response.
    ///
    /// Raises `NotConnected` unless the session is connected or in the
    /// middle of its authentication exchange.
    pub async fn request(&self, request: RequestPacket) -> TransportResult<ResponsePacket> {
        let inner = &self.inner;
        if !inner.is_connected.load(Ordering::SeqCst)
            && !inner.authenticating.load(Ordering::SeqCst)
        {
            return Err(TransportError::NotConnected);
        }
        let connection = lock(&inner.connection)
            .clone()
            .ok_or(TransportError::NotConnected)?;
        connection.request(request, "").await
    }

    /// Tear the session down: cancel reconnection, close the connection,
    /// dispose modules in insertion order.
    pub async fn dispose(&self) {
        self.inner.disposed.cancel();
        let connection = lock(&self.inner.connection).take();
        if let Some(connection) = connection {
            connection.clear_events();
            connection.close().await;
        }
        self.inner.is_connected.store(false, Ordering::SeqCst);
        self.inner.modules.dispose_all();
    }
}

impl<C: MessageCodec> SessionInner<C> {
    fn session(&self) -> Option<Session<C>> {
        self.self_ref.upgrade().map(|inner| Session { inner })
    }

    async fn connect_internal(&self, credentials: &Credentials) -> TransportResult<()> {
        let connection = Connection::dialer(
            self.remote_address.clone(),
            self.codec.clone(),
            Arc::clone(&self.registry),
            self.config.connection_config(),
        );
        let events: Weak<dyn ConnectionEvents<C>> = self.self_ref.clone();
        connection.set_events(events);
        *lock(&self.connection) = Some(Arc::clone(&connection));

        let result = tokio::select! {
            _ = self.disposed.cancelled() => Err(TransportError::Disconnected),
            outcome = self.establish(&connection, credentials) => outcome,
        };

        match result {
            Ok(auth) if auth.successful => {
                let user = auth
                    .user
                    .unwrap_or_else(|| credentials.user.clone());
                connection.set_local_origin(&user);
                *lock(&self.user) = Some(user.clone());
                connection.mark_connected();
                self.is_connected.store(true, Ordering::SeqCst);
                self.fire_connected(&user);
                Ok(())
            }
            Ok(auth) => {
                self.rollback(&connection).await;
                let code = auth
                    .error_code
                    .unwrap_or_else(|| status::UNAUTHORIZED.to_string());
                Err(TransportError::Authentication { code })
            }
            Err(error) => {
                self.rollback(&connection).await;
                Err(error)
            }
        }
    }

    async fn establish(
        &self,
        connection: &Arc<Connection<C>>,
        credentials: &Credentials,
    ) -> TransportResult<AuthenticationResult> {
        connection.open().await?;
        self.authenticating.store(true, Ordering::SeqCst);
        let outcome = self.authenticator.authenticate(connection, credentials).await;
        self.authenticating.store(false, Ordering::SeqCst);
        outcome
    }

    async fn rollback(&self, connection: &Arc<Connection<C>>) {
        self.authenticating.store(false, Ordering::SeqCst);
        connection.clear_events();
        {
            let mut slot = lock(&self.connection);
            if slot
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, connection))
            {
                slot.take();
            }
        }
        connection.close().await;
    }

    fn fire_connected(&self, user: &str) {
        let handlers = lock(&self.connected_handlers);
        for handler in handlers.iter() {
            if let Err(error) = handler(user) {
                self.error_sink
                    .background_error("connected event handler", error.as_ref());
            }
        }
    }

    fn fire_disconnected(&self) {
        let handlers = lock(&self.disconnected_handlers);
        for handler in handlers.iter() {
            handler();
        }
    }

    /// Bounded re-establishment after an unexpected drop. Logs failures
    /// and never raises; disposal observed at the delay aborts promptly.
    async fn reconnect_loop(self: Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let credentials = lock(&self.credentials).clone();
        let Some(credentials) = credentials else {
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        };

        let attempts = self.config.reconnect_attempts;
        for attempt in 1..=attempts {
            let disposed = tokio::select! {
                _ = self.disposed.cancelled() => true,
                _ = tokio::time::sleep(self.config.reconnect_delay) => false,
            };
            if disposed {
                tracing::debug!("session disposed, abandoning reconnect");
                break;
            }
            match self.connect_internal(&credentials).await {
                Ok(()) => {
                    tracing::info!(attempt, remote = %self.remote_address, "reconnected");
                    self.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                Err(error) => {
                    tracing::warn!(attempt, attempts, %error, "reconnect attempt failed");
                }
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl<C: MessageCodec> ConnectionEvents<C> for SessionInner<C> {
    async fn request_received(
        &self,
        connection: &Arc<Connection<C>>,
        packet: Packet,
        request: RequestPacket,
    ) {
        let Some(session) = self.session() else {
            return;
        };
        let request_id = request.request_id;
        let reply_to = packet.origin.clone();
        let mut context = RequestContext::new(request, packet.origin.clone());

        let mut failed = false;
        for module in self.modules.iter() {
            match module.handle_request(&session, &mut context).await {
                Ok(()) if context.handled => break,
                Ok(()) => {}
                Err(error) => {
                    self.error_sink
                        .background_error("inbound request module", error.as_ref());
                    failed = true;
                    break;
                }
            }
        }

        if !failed && !context.handled {
            let fallback = lock(&self.fallback).clone();
            if let Some(handler) = fallback {
                if let Err(error) = handler.handle_request(&session, &mut context).await {
                    self.error_sink
                        .background_error("inbound request handler", error.as_ref());
                    failed = true;
                }
            }
        }

        let response = if failed {
            Some(ResponsePacket::error(
                request_id,
                status::UNHANDLED_SERVER_ERROR,
            ))
        } else {
            context.response.take()
        };

        match response {
            Some(mut response) => {
                response.request_id = request_id;
                if let Err(error) = connection.respond(response, &reply_to).await {
                    self.error_sink
                        .background_error("request response send", &error);
                }
            }
            None => {
                tracing::warn!(request_id, "inbound request left unanswered");
            }
        }
    }

    async fn connection_closed(&self, connection: &Arc<Connection<C>>) {
        let is_current = {
            let slot = lock(&self.connection);
            slot.as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, connection))
        };
        if !is_current {
            return;
        }
        lock(&self.connection).take();

        let was_connected = self.is_connected.swap(false, Ordering::SeqCst);
        if was_connected {
            tracing::warn!(remote = %self.remote_address, "connection lost");
            self.fire_disconnected();
            if !self.disposed.is_cancelled() {
                if let Some(inner) = self.self_ref.upgrade() {
                    tokio::spawn(inner.reconnect_loop());
                }
            }
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
