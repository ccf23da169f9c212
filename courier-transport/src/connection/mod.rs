//! A single peer link: lifecycle, framed send path, read loop, and
//! request correlation.
//!
//! One [`Connection`] wraps one TCP stream. The send path is serialized by
//! an async mutex over the write half; a single read-loop task owns the
//! read half and dispatches inbound packets without awaiting handler work,
//! so slow handlers never stall the wire.
//!
//! Ownership points one way: a session (or the server's accept machinery)
//! owns the connection and subscribes to its events through a weak
//! back-reference. The connection never keeps its subscriber alive.

mod dial;
mod metrics;
mod state;

pub use metrics::MetricsSnapshot;
pub use state::ConnectionState;

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{
    MessageCodec, Packet, PacketError, PacketRegistry, RequestPacket, ResponsePacket,
    packet_flags, packet_types,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{TransportError, TransportResult};
use crate::retry::RetryPolicy;
use crate::wire;

/// How the connection came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOrigin {
    /// We dialed out: the connection must resolve and connect itself.
    Dialer,
    /// The accept loop handed us an already-open socket.
    Listener,
}

/// Tunables for a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for a correlated request's response.
    pub request_timeout: Duration,
    /// Deadline for each per-address connect attempt.
    pub connect_timeout: Duration,
    /// Retry policy for DNS resolution.
    pub dns_retry: RetryPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            dns_retry: RetryPolicy::default(),
        }
    }
}

/// Subscriber for a connection's inbound traffic and lifecycle.
///
/// Handlers for inbound requests are awaited by the dispatch task (one per
/// request), not by the read loop, so implementations may take their time
/// without blocking the wire.
#[async_trait]
pub trait ConnectionEvents<C: MessageCodec>: Send + Sync {
    /// An inbound request packet arrived and decoded.
    async fn request_received(
        &self,
        connection: &Arc<Connection<C>>,
        packet: Packet,
        request: RequestPacket,
    );

    /// A one-way packet arrived. `body` is the registry-decoded body;
    /// downcast it to the registered type. Default: log and drop.
    async fn packet_received(
        &self,
        connection: &Arc<Connection<C>>,
        packet: Packet,
        body: Box<dyn Any + Send>,
    ) {
        let _ = body;
        tracing::debug!(
            remote = connection.remote_address(),
            packet_type = packet.packet_type,
            "one-way packet dropped: no handler"
        );
    }

    /// The connection reached [`ConnectionState::Closed`].
    async fn connection_closed(&self, connection: &Arc<Connection<C>>);
}

/// One bidirectional peer link.
pub struct Connection<C: MessageCodec> {
    self_ref: Weak<Connection<C>>,
    remote_address: String,
    origin: ConnectionOrigin,
    codec: C,
    registry: Arc<PacketRegistry<C>>,
    config: ConnectionConfig,
    state: state::StateCell,
    closed: CancellationToken,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: StdMutex<Option<OwnedReadHalf>>,
    next_frame_id: AtomicU64,
    next_request_id: AtomicU64,
    pending: StdMutex<HashMap<u64, oneshot::Sender<ResponsePacket>>>,
    events: StdMutex<Option<Weak<dyn ConnectionEvents<C>>>>,
    local_origin: StdMutex<String>,
    metrics: metrics::ConnectionMetrics,
}

impl<C: MessageCodec> Connection<C> {
    /// A dialer-origin connection. No socket activity happens until
    /// [`Connection::open`].
    pub fn dialer(
        remote_address: impl Into<String>,
        codec: C,
        registry: Arc<PacketRegistry<C>>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let remote_address = remote_address.into();
        Arc::new_cyclic(|self_ref| {
            Self::bare(
                self_ref.clone(),
                remote_address,
                ConnectionOrigin::Dialer,
                codec,
                registry,
                config,
                None,
            )
        })
    }

    /// A listener-origin connection around an accepted socket.
    ///
    /// The caller starts traffic with [`Connection::begin_handshake`];
    /// calling [`Connection::open`] on this connection is a programmer
    /// error.
    pub fn from_accepted(
        stream: TcpStream,
        remote_address: impl Into<String>,
        codec: C,
        registry: Arc<PacketRegistry<C>>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let remote_address = remote_address.into();
        Arc::new_cyclic(|self_ref| {
            Self::bare(
                self_ref.clone(),
                remote_address,
                ConnectionOrigin::Listener,
                codec,
                registry,
                config,
                Some(stream),
            )
        })
    }

    fn bare(
        self_ref: Weak<Connection<C>>,
        remote_address: String,
        origin: ConnectionOrigin,
        codec: C,
        registry: Arc<PacketRegistry<C>>,
        config: ConnectionConfig,
        stream: Option<TcpStream>,
    ) -> Self {
        let (read_half, write_half) = match stream {
            Some(stream) => {
                let (r, w) = stream.into_split();
                (Some(r), Some(w))
            }
            None => (None, None),
        };
        Self {
            self_ref,
            remote_address,
            origin,
            codec,
            registry,
            config,
            state: state::StateCell::new(),
            closed: CancellationToken::new(),
            writer: Mutex::new(write_half),
            reader: StdMutex::new(read_half),
            next_frame_id: AtomicU64::new(0),
            next_request_id: AtomicU64::new(0),
            pending: StdMutex::new(HashMap::new()),
            events: StdMutex::new(None),
            local_origin: StdMutex::new(String::new()),
            metrics: metrics::ConnectionMetrics::default(),
        }
    }

    /// The `host:port` (dialer) or peer address (listener) of this link.
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Dialer or listener origin.
    pub fn origin(&self) -> ConnectionOrigin {
        self.origin
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Observe lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Token cancelled when the connection closes. Link long waits to it.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Counters snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The codec this connection serializes bodies with.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// The registry consulted for every packet on this link.
    pub fn registry(&self) -> &Arc<PacketRegistry<C>> {
        &self.registry
    }

    /// Set the origin stamped on outbound packets (the authenticated user).
    pub fn set_local_origin(&self, user: &str) {
        *lock(&self.local_origin) = user.to_string();
    }

    fn local_origin(&self) -> String {
        lock(&self.local_origin).clone()
    }

    /// Subscribe `events` to this connection. The reference is weak; the
    /// subscriber's owner controls its lifetime.
    pub fn set_events(&self, events: Weak<dyn ConnectionEvents<C>>) {
        *lock(&self.events) = Some(events);
    }

    /// Drop the event subscription.
    pub fn clear_events(&self) {
        *lock(&self.events) = None;
    }

    fn events_handle(&self) -> Option<Arc<dyn ConnectionEvents<C>>> {
        lock(&self.events).as_ref().and_then(Weak::upgrade)
    }

    /// Dial the remote address and enter `Handshaking`.
    ///
    /// Dialer-origin only; a listener-origin connection's socket is
    /// already open and this raises `InvalidOperation`. On any failure
    /// the connection ends up `Closed`.
    pub async fn open(&self) -> TransportResult<()> {
        if self.origin == ConnectionOrigin::Listener {
            return Err(TransportError::InvalidOperation(
                "listener-origin connections are opened by the accept loop",
            ));
        }
        if !self.state.transition(ConnectionState::Connecting) {
            return Err(TransportError::InvalidOperation(
                "connection was already opened",
            ));
        }

        let dialed = dial::connect(
            &self.remote_address,
            self.config.connect_timeout,
            &self.config.dns_retry,
            &self.closed,
        )
        .await;
        let stream = match dialed {
            Ok(stream) => stream,
            Err(error) => {
                self.close().await;
                return Err(error);
            }
        };

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        *lock(&self.reader) = Some(read_half);
        self.begin_handshake();
        Ok(())
    }

    /// Enter `Handshaking` and start the read loop.
    ///
    /// The reader must be running before the first handshake send: the
    /// handshake is a request/response pair over this very loop, and its
    /// response would deadlock against an unstarted reader.
    pub fn begin_handshake(&self) {
        if !self.state.transition(ConnectionState::Handshaking) {
            return;
        }
        if let Some(read_half) = lock(&self.reader).take() {
            if let Some(connection) = self.self_ref.upgrade() {
                tokio::spawn(read_loop(connection, read_half));
            }
        }
    }

    /// Enter `Connected` once the handshake succeeded.
    pub fn mark_connected(&self) {
        self.state.transition(ConnectionState::Connected);
    }

    /// Drive the connection to `Closed`. Idempotent.
    ///
    /// Fan-out on first entry: cancel the closed token (waking every
    /// blocked send, read, and pending request), shut the socket down,
    /// fail all correlator entries with `Disconnected`, then notify the
    /// subscriber.
    pub async fn close(&self) {
        if !self.state.transition(ConnectionState::Closed) {
            return;
        }
        self.closed.cancel();

        if let Some(mut write_half) = self.writer.lock().await.take() {
            let _ = write_half.shutdown().await;
        }
        lock(&self.reader).take();

        let waiters = {
            let mut pending = lock(&self.pending);
            let count = pending.len();
            pending.clear();
            count
        };
        if waiters > 0 {
            tracing::debug!(
                remote = %self.remote_address,
                waiters,
                "failed pending requests on close"
            );
        }

        if let Some(events) = self.events_handle() {
            if let Some(this) = self.self_ref.upgrade() {
                events.connection_closed(&this).await;
            }
        }
        tracing::debug!(remote = %self.remote_address, "connection closed");
    }

    /// Encode `packet` and write it as one frame. Returns the frame id.
    ///
    /// Fails with `Disconnected` unless the state allows sending.
    /// Cancellation before the send lock is acquired aborts cleanly; once
    /// bytes start flowing the write runs to completion or the connection
    /// closes.
    pub async fn send_packet(&self, packet: &Packet) -> TransportResult<u64> {
        if !self.state.get().allows_send() {
            return Err(TransportError::Disconnected);
        }
        let bytes = packet.encode()?;

        let mut guard = tokio::select! {
            _ = self.closed.cancelled() => return Err(TransportError::Disconnected),
            guard = self.writer.lock() => guard,
        };
        let Some(write_half) = guard.as_mut() else {
            return Err(TransportError::Disconnected);
        };

        let frame_id = self.next_frame_id.fetch_add(1, Ordering::Relaxed) + 1;
        match wire::write_frame(write_half, frame_id, &bytes).await {
            Ok(()) => {
                self.metrics
                    .record_frame_sent(wire::FRAME_HEADER_SIZE + bytes.len());
                Ok(frame_id)
            }
            Err(TransportError::InvalidDataLength { length }) => {
                // Nothing was written; the connection stays usable.
                Err(TransportError::InvalidDataLength { length })
            }
            Err(error) => {
                tracing::warn!(
                    remote = %self.remote_address,
                    %error,
                    "send failed, closing connection"
                );
                guard.take();
                drop(guard);
                self.close().await;
                Err(TransportError::Disconnected)
            }
        }
    }

    /// Send a request and await its correlated response.
    ///
    /// Assigns a fresh per-connection `request_id`; the wait resolves with
    /// exactly one of: the response, `RequestTimeout` after the configured
    /// deadline, or `Disconnected` when the connection closes.
    pub async fn request(
        &self,
        mut request: RequestPacket,
        destination: &str,
    ) -> TransportResult<ResponsePacket> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        request.request_id = request_id;

        let (sender, receiver) = oneshot::channel();
        lock(&self.pending).insert(request_id, sender);
        self.metrics.record_request_started();

        let body = match self.codec.encode(&request) {
            Ok(body) => body,
            Err(error) => {
                self.forget_request(request_id);
                return Err(error.into());
            }
        };
        let packet = Packet::new(
            packet_types::REQUEST,
            packet_flags::REQUEST,
            destination,
            self.local_origin(),
            body,
        );
        if let Err(error) = self.send_packet(&packet).await {
            self.forget_request(request_id);
            return Err(error);
        }

        let timeout = self.config.request_timeout;
        tokio::select! {
            _ = self.closed.cancelled() => {
                self.forget_request(request_id);
                Err(TransportError::Disconnected)
            }
            outcome = tokio::time::timeout(timeout, receiver) => match outcome {
                Ok(Ok(response)) => {
                    self.metrics.record_request_completed();
                    Ok(response)
                }
                Ok(Err(_)) => Err(TransportError::Disconnected),
                Err(_) => {
                    self.forget_request(request_id);
                    self.metrics.record_request_timed_out();
                    Err(TransportError::RequestTimeout { request_id, timeout })
                }
            }
        }
    }

    /// Send the response to an earlier inbound request.
    pub async fn respond(
        &self,
        response: ResponsePacket,
        destination: &str,
    ) -> TransportResult<u64> {
        let body = self.codec.encode(&response)?;
        let packet = Packet::new(
            packet_types::RESPONSE,
            packet_flags::RESPONSE,
            destination,
            self.local_origin(),
            body,
        );
        self.send_packet(&packet).await
    }

    /// Send a fire-and-forget packet of a registered application type.
    pub async fn send_one_way(
        &self,
        packet_type: u8,
        destination: &str,
        body: Vec<u8>,
    ) -> TransportResult<u64> {
        if !self.registry.contains(packet_type) {
            return Err(PacketError::UnregisteredPacketType(packet_type).into());
        }
        let packet = Packet::new(
            packet_type,
            packet_flags::ONE_WAY,
            destination,
            self.local_origin(),
            body,
        );
        self.send_packet(&packet).await
    }

    fn forget_request(&self, request_id: u64) {
        lock(&self.pending).remove(&request_id);
    }

    /// Route one inbound frame. Runs on the read loop and never awaits;
    /// request and one-way handlers are spawned.
    ///
    /// An error return is a protocol violation and terminates the
    /// connection.
    fn dispatch_frame(&self, frame_id: u64, payload: Vec<u8>) -> TransportResult<()> {
        let packet = Packet::decode(&payload)?;
        if !self.registry.contains(packet.packet_type) {
            return Err(PacketError::UnregisteredPacketType(packet.packet_type).into());
        }

        if packet.has_flag(packet_flags::RESPONSE) || packet.packet_type == packet_types::RESPONSE
        {
            if !packet.has_flag(packet_flags::RESPONSE) {
                tracing::debug!(frame_id, "response packet missing its response flag");
            }
            let response: ResponsePacket = packet.body(&self.codec)?;
            self.resolve_response(response);
            return Ok(());
        }

        if packet.has_flag(packet_flags::REQUEST) || packet.packet_type == packet_types::REQUEST {
            let request: RequestPacket = packet.body(&self.codec)?;
            let (Some(events), Some(connection)) = (self.events_handle(), self.self_ref.upgrade())
            else {
                tracing::debug!(frame_id, "dropping request: no subscriber");
                return Ok(());
            };
            tokio::spawn(async move {
                events.request_received(&connection, packet, request).await;
            });
            return Ok(());
        }

        let body = self
            .registry
            .decode_body(packet.packet_type, &self.codec, packet.body_bytes())?;
        if let (Some(events), Some(connection)) = (self.events_handle(), self.self_ref.upgrade()) {
            tokio::spawn(async move {
                events.packet_received(&connection, packet, body).await;
            });
        }
        Ok(())
    }

    fn resolve_response(&self, response: ResponsePacket) {
        let request_id = response.request_id;
        let waiter = lock(&self.pending).remove(&request_id);
        match waiter {
            Some(sender) => {
                if sender.send(response).is_err() {
                    tracing::debug!(request_id, "response arrived after its waiter left");
                }
            }
            None => {
                tracing::debug!(request_id, "discarding response with no pending request");
            }
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The single per-connection read loop.
///
/// Reads frames until the peer closes, an error occurs, or the connection
/// is closed from elsewhere, then drives the close fan-out itself.
async fn read_loop<C: MessageCodec>(connection: Arc<Connection<C>>, mut read_half: OwnedReadHalf) {
    let mut last_frame_id: u64 = 0;
    loop {
        let next = tokio::select! {
            _ = connection.closed.cancelled() => break,
            frame = wire::read_frame(&mut read_half) => frame,
        };
        match next {
            Ok(Some((frame_id, payload))) => {
                if last_frame_id != 0 && frame_id > last_frame_id + 1 {
                    tracing::debug!(
                        remote = %connection.remote_address,
                        last_frame_id,
                        frame_id,
                        "gap in inbound frame ids"
                    );
                }
                last_frame_id = frame_id;
                connection
                    .metrics
                    .record_frame_received(wire::FRAME_HEADER_SIZE + payload.len());
                if let Err(error) = connection.dispatch_frame(frame_id, payload) {
                    tracing::warn!(
                        remote = %connection.remote_address,
                        frame_id,
                        %error,
                        "protocol violation, terminating connection"
                    );
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!(remote = %connection.remote_address, "peer closed the stream");
                break;
            }
            Err(error) => {
                tracing::warn!(remote = %connection.remote_address, %error, "read failed");
                break;
            }
        }
    }
    connection.close().await;
}
