//! Socket connection: one TLS link to a Blaze server.
//!
//! A [`Connection`] owns three background tasks for the lifetime of its
//! link:
//!
//! ```text
//!                    ┌───────────────┐
//!  send() ──────────►│ pending table │◄──────── receive loop ◄── socket
//!     │              └───────────────┘               │
//!     └──► writer task ──► socket                    └──► observer
//!  keepalive loop ──► writer task
//! ```
//!
//! Requests register a waiter under a fresh correlation id and block on it
//! until the receive loop routes the matching reply, the deadline passes,
//! or the link dies. Link failures (EOF, reset, failed write, failed
//! heartbeat, expired session) move the connection to
//! [`ConnectionState::Disconnected`] and wake every waiter with a
//! connection error. [`Connection::close`] is terminal.
//!
//! # Example
//!
//! ```ignore
//! use blaze_client::{Connection, ConnectionConfig};
//! use blaze_client::protocol::{body, methods, Packet};
//! use serde_json::json;
//!
//! let conn = Connection::connect(ConnectionConfig::default()).await?;
//! let reply = conn
//!     .send(Packet::command(methods::PING, body([("TIME", json!(0))])))
//!     .await?;
//! conn.close().await;
//! ```

mod pending;
mod routing;

use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use crate::codec::PacketCodec;
use crate::control::{heartbeat_header, login_packet, Session, DEFAULT_KEEPALIVE_INTERVAL};
use crate::error::{BlazeError, Result};
use crate::protocol::{Frame, FrameBuffer, Header, Packet, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_BODY_SIZE};
use crate::transport::{BoxedStream, Connector, TlsConnector, Transport};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

use pending::PendingTable;
use routing::{route, Route};

/// Default Blaze host.
pub const DEFAULT_HOST: &str = "diceprodblapp-08.ea.com";

/// Default Blaze port.
pub const DEFAULT_PORT: u16 = 10539;

/// Default TCP + TLS handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Default deadline for `send()`.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default socket read size.
pub const DEFAULT_READ_BUFFER_SIZE: usize = DEFAULT_BUFFER_CAPACITY;

/// Default reconnect attempts before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default delay before the first reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default cap on the reconnect delay.
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// How long `close()` waits for the writer to flush and shut down.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Exponential backoff for [`Connection::reconnect`].
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound for the doubled delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            initial_delay: DEFAULT_RECONNECT_DELAY,
            max_delay: DEFAULT_MAX_RECONNECT_DELAY,
        }
    }
}

impl ReconnectPolicy {
    fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }
}

/// Configuration for a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server host name.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// TCP + TLS handshake timeout.
    pub connect_timeout: Duration,
    /// Default deadline for `send()`.
    pub request_timeout: Duration,
    /// Heartbeat interval; `None` disables the keepalive loop.
    pub keepalive_interval: Option<Duration>,
    /// Bytes requested per socket read.
    pub read_buffer_size: usize,
    /// Largest body a frame header may declare.
    pub max_body_size: u32,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
    /// Reconnect automatically after a link failure.
    pub auto_reconnect: bool,
    /// Writer task settings.
    pub writer: WriterConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl ConnectionConfig {
    /// Configuration for `host:port` with default settings.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            reconnect: ReconnectPolicy::default(),
            auto_reconnect: false,
            writer: WriterConfig::default(),
        }
    }

    /// Set the handshake timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the heartbeat interval.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// Disable the keepalive loop.
    pub fn without_keepalive(mut self) -> Self {
        self.keepalive_interval = None;
        self
    }

    /// Set the socket read size.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Set the largest accepted body.
    pub fn with_max_body_size(mut self, size: u32) -> Self {
        self.max_body_size = size;
        self
    }

    /// Set the reconnect backoff.
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Enable or disable automatic reconnect.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the writer task settings.
    pub fn with_writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No live link; `reconnect()` is allowed.
    Disconnected,
    /// Dialing.
    Connecting,
    /// Link up, not logged in.
    Connected,
    /// Link up and logged in.
    Authenticated,
    /// `close()` in progress.
    Closing,
    /// Closed for good.
    Closed,
}

impl ConnectionState {
    /// Whether requests may be written.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Authenticated)
    }
}

/// Point-in-time snapshot of a connection, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub authenticated: bool,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub is_reconnecting: bool,
    pub listener_running: bool,
    pub keepalive_running: bool,
    pub transport_closed: bool,
    pub pending_requests: usize,
    pub queued_frames: usize,
    pub host: String,
    pub port: u16,
}

/// Callback for routed packets that are neither heartbeats nor replies.
pub type Observer = Arc<dyn Fn(&Packet) + Send + Sync>;

/// Handles of one live link.
struct Link {
    generation: u64,
    writer: WriterHandle,
    writer_task: JoinHandle<Result<()>>,
    reader_task: JoinHandle<()>,
    keepalive_task: Option<JoinHandle<()>>,
}

impl Link {
    fn is_writable(&self) -> bool {
        !self.writer.is_closed() && !self.writer_task.is_finished()
    }

    fn abort_background(&self) {
        self.reader_task.abort();
        if let Some(task) = &self.keepalive_task {
            task.abort();
        }
    }
}

struct Backoff {
    attempts: u32,
    delay: Duration,
}

struct Inner {
    config: ConnectionConfig,
    connector: Option<Arc<dyn Connector>>,
    state: Mutex<ConnectionState>,
    session: Mutex<Option<Session>>,
    pending: PendingTable,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    backoff: Mutex<Backoff>,
    reconnecting: AtomicBool,
    observer: Mutex<Option<Observer>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.abort_background();
        }
    }
}

/// A Blaze connection. Cheap to clone; clones share the link.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    fn new(config: ConnectionConfig, connector: Option<Arc<dyn Connector>>) -> Self {
        let initial_delay = config.reconnect.initial_delay;
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                state: Mutex::new(ConnectionState::Disconnected),
                session: Mutex::new(None),
                pending: PendingTable::new(),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                backoff: Mutex::new(Backoff {
                    attempts: 0,
                    delay: initial_delay,
                }),
                reconnecting: AtomicBool::new(false),
                observer: Mutex::new(None),
            }),
        }
    }

    /// Dial the configured server over TLS and start the background tasks.
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        Self::connect_with(config, Arc::new(TlsConnector)).await
    }

    /// Dial through `connector` and start the background tasks.
    ///
    /// The connector is kept for [`reconnect`](Self::reconnect).
    pub async fn connect_with(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let conn = Self::new(config, Some(connector));
        conn.connect_to_server().await?;
        Ok(conn)
    }

    /// Attach an already-open stream. Must be called inside a tokio runtime.
    ///
    /// Such a connection cannot reconnect.
    pub fn from_stream<S: Transport>(stream: S, config: ConnectionConfig) -> Self {
        let conn = Self::new(config, None);
        conn.inner.attach(Box::new(stream));
        conn
    }

    /// Open the link and start the receive and keepalive loops.
    ///
    /// # Errors
    ///
    /// `Closed` after [`close`](Self::close); `Connection` for any socket or
    /// TLS failure. The caller decides whether to retry.
    pub async fn connect_to_server(&self) -> Result<()> {
        let connector = self
            .inner
            .connector
            .clone()
            .ok_or_else(|| BlazeError::Connection("Connection has no connector".to_string()))?;

        {
            let mut state = self.inner.state.lock();
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return Err(BlazeError::Closed);
            }
            *state = ConnectionState::Connecting;
        }

        let config = &self.inner.config;
        let stream = match connector
            .connect(&config.host, config.port, config.connect_timeout)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                let mut state = self.inner.state.lock();
                if *state == ConnectionState::Connecting {
                    *state = ConnectionState::Disconnected;
                }
                tracing::warn!(host = %config.host, port = config.port, "Connect failed: {}", e);
                return Err(e);
            }
        };

        if !self.inner.attach(stream) {
            return Err(BlazeError::Closed);
        }
        tracing::info!(host = %config.host, port = config.port, "Connected to Blaze server");
        Ok(())
    }

    /// Send a request and wait for its reply with the configured deadline.
    pub async fn send(&self, packet: Packet) -> Result<Packet> {
        self.send_with_timeout(packet, self.inner.config.request_timeout)
            .await
    }

    /// Send a request and wait up to `timeout` for its reply.
    ///
    /// A pre-assigned correlation id is kept when it is free; otherwise a
    /// fresh one is allocated.
    ///
    /// # Errors
    ///
    /// - `Connection` if the link is down, the write fails, or the link dies
    ///   while waiting
    /// - `Timeout` if no reply arrives in time; the waiter is discarded
    /// - `SessionExpired` if the server ends the session while waiting
    pub async fn send_with_timeout(&self, mut packet: Packet, timeout: Duration) -> Result<Packet> {
        if !self.connected() {
            return Err(BlazeError::Connection(format!(
                "Not connected to {}:{}",
                self.inner.config.host, self.inner.config.port
            )));
        }

        let (id, reply) = self.inner.pending.register(packet.correlation_id)?;
        let mut guard = PendingGuard {
            table: &self.inner.pending,
            id,
            armed: true,
        };
        packet.correlation_id = id;

        let (header, body) = PacketCodec::encode_parts(&packet)?;
        self.write_parts(&header, body).await?;

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(outcome)) => {
                guard.armed = false;
                outcome
            }
            Ok(Err(_)) => {
                guard.armed = false;
                Err(BlazeError::Connection(format!(
                    "Connection lost while waiting for response to packet ID: {id}"
                )))
            }
            Err(_) => {
                tracing::warn!(correlation_id = id, method = %packet.method, "Request timed out");
                Err(BlazeError::Timeout { correlation_id: id })
            }
        }
    }

    /// Write a packet without waiting for a reply.
    ///
    /// # Errors
    ///
    /// `Connection` if the transport is not writable or the write fails;
    /// either way the link is torn down.
    pub async fn request(&self, packet: &Packet) -> Result<()> {
        if !self.connected() {
            return Err(BlazeError::Connection("Connection is closed".to_string()));
        }
        let (header, body) = PacketCodec::encode_parts(packet)?;
        self.write_parts(&header, body).await
    }

    async fn write_parts(&self, header: &Header, body: Bytes) -> Result<()> {
        let (writer, generation) = self.writable_link()?;
        if let Err(e) = writer.write(header, body).await {
            tracing::error!(correlation_id = header.correlation_id, "Failed to send packet: {}", e);
            self.inner.link_lost(generation, "write failed");
            return Err(e);
        }
        Ok(())
    }

    /// Writer of the current link, tearing the link down if it is not writable.
    fn writable_link(&self) -> Result<(WriterHandle, u64)> {
        let generation = {
            let slot = self.inner.link.lock();
            match slot.as_ref() {
                Some(link) if link.is_writable() => {
                    return Ok((link.writer.clone(), link.generation));
                }
                Some(link) => link.generation,
                None => {
                    return Err(BlazeError::Connection("Connection has no writer".to_string()));
                }
            }
        };
        self.inner.link_lost(generation, "writer is no longer valid");
        Err(BlazeError::Connection(
            "Writer is no longer valid, connection may be down".to_string(),
        ))
    }

    /// Whether the transport can accept writes right now.
    ///
    /// True only if a writer is attached, its channel is open, the writer
    /// task is alive and no write has failed.
    pub fn is_transport_healthy(&self) -> bool {
        self.inner
            .link
            .lock()
            .as_ref()
            .map_or(false, Link::is_writable)
    }

    /// One heartbeat. Returns whether the keepalive loop should continue.
    pub(crate) async fn keepalive_tick(&self) -> bool {
        if !self.connected() {
            return false;
        }
        let (writer, generation) = match self.writable_link() {
            Ok(link) => link,
            Err(_) => {
                tracing::warn!("Writer invalid, stopping keepalive");
                return false;
            }
        };
        match writer.write(&heartbeat_header(), Bytes::new()).await {
            Ok(()) => {
                tracing::trace!("Keepalive sent");
                true
            }
            Err(e) => {
                tracing::error!("Keepalive failed, connection may be down: {}", e);
                self.inner.link_lost(generation, "keepalive failed");
                false
            }
        }
    }

    /// Close the connection for good. Idempotent.
    ///
    /// Pending requests fail with a connection error; background tasks are
    /// stopped and awaited.
    pub async fn close(&self) {
        let link = {
            let mut slot = self.inner.link.lock();
            let mut state = self.inner.state.lock();
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closing;
            slot.take()
        };

        self.inner.session.lock().take();
        let dropped = self.inner.pending.clear();

        if let Some(link) = link {
            link.abort_background();
            let Link {
                writer,
                writer_task,
                reader_task,
                keepalive_task,
                ..
            } = link;
            drop(writer);

            match tokio::time::timeout(CLOSE_TIMEOUT, writer_task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => tracing::debug!("Writer ended with error during close: {}", e),
                Ok(Err(e)) => tracing::debug!("Writer task failed during close: {}", e),
                Err(_) => tracing::debug!("Writer did not shut down within {:?}", CLOSE_TIMEOUT),
            }
            let _ = reader_task.await;
            if let Some(task) = keepalive_task {
                let _ = task.await;
            }
        }

        *self.inner.state.lock() = ConnectionState::Closed;
        tracing::info!(
            host = %self.inner.config.host,
            port = self.inner.config.port,
            dropped_requests = dropped,
            "Disconnected from Blaze server"
        );
    }

    /// Re-establish a lost link with exponential backoff.
    ///
    /// Returns `Ok(false)` without waiting if another reconnect is already
    /// running, `Ok(true)` once a link is up. A reconnected link is
    /// `Connected`, not `Authenticated`.
    ///
    /// # Errors
    ///
    /// `Closed` after [`close`](Self::close); `Connection` once every
    /// attempt has failed.
    pub async fn reconnect(&self) -> Result<bool> {
        if self.inner.reconnecting.swap(true, Ordering::AcqRel) {
            tracing::debug!("Reconnect already in progress");
            return Ok(false);
        }
        let outcome = self.reconnect_with_backoff().await;
        self.inner.reconnecting.store(false, Ordering::Release);
        outcome.map(|()| true)
    }

    async fn reconnect_with_backoff(&self) -> Result<()> {
        let policy = self.inner.config.reconnect.clone();
        loop {
            if matches!(self.state(), ConnectionState::Closing | ConnectionState::Closed) {
                return Err(BlazeError::Closed);
            }
            if self.connected() && self.is_transport_healthy() {
                return Ok(());
            }

            let (attempt, delay) = {
                let mut backoff = self.inner.backoff.lock();
                if backoff.attempts >= policy.max_attempts {
                    backoff.attempts = 0;
                    backoff.delay = policy.initial_delay;
                    tracing::error!(attempts = policy.max_attempts, "Reconnect failed, giving up");
                    return Err(BlazeError::Connection(format!(
                        "Reconnect failed after {} attempts",
                        policy.max_attempts
                    )));
                }
                backoff.attempts += 1;
                (backoff.attempts, backoff.delay)
            };

            tracing::info!(
                attempt,
                max_attempts = policy.max_attempts,
                "Reconnecting in {:?}",
                delay
            );
            tokio::time::sleep(delay).await;

            match self.connect_to_server().await {
                Ok(()) => {
                    let mut backoff = self.inner.backoff.lock();
                    backoff.attempts = 0;
                    backoff.delay = policy.initial_delay;
                    tracing::info!(attempt, "Reconnected");
                    return Ok(());
                }
                Err(BlazeError::Closed) => return Err(BlazeError::Closed),
                Err(e) => {
                    let mut backoff = self.inner.backoff.lock();
                    backoff.delay = policy.next_delay(delay);
                    tracing::warn!(attempt, "Reconnect attempt failed: {}", e);
                }
            }
        }
    }

    /// Log in with an auth code and mark the connection authenticated.
    ///
    /// # Errors
    ///
    /// `Authentication` if the reply lacks the identity fields, plus the
    /// usual `send` errors.
    pub async fn authenticate(&self, auth_code: &str, timeout: Duration) -> Result<Session> {
        let reply = self
            .send_with_timeout(login_packet(auth_code), timeout)
            .await?;
        let session = Session::from_login_reply(&reply)?;
        self.mark_authenticated(session.clone());
        tracing::info!(
            name = %session.display_name,
            persona_id = session.persona_id,
            user_id = session.user_id,
            client_group_id = session.client_group_id,
            "Blaze login succeeded"
        );
        Ok(session)
    }

    /// Record a successful login. Ignored unless the link is up.
    pub fn mark_authenticated(&self, session: Session) {
        let mut state = self.inner.state.lock();
        if state.is_connected() {
            *state = ConnectionState::Authenticated;
            *self.inner.session.lock() = Some(session);
        }
    }

    /// Forget the login so the next pool lookup re-authenticates.
    pub fn mark_unauthenticated(&self) {
        let mut state = self.inner.state.lock();
        if *state == ConnectionState::Authenticated {
            *state = ConnectionState::Connected;
        }
        self.inner.session.lock().take();
    }

    /// Identity of the logged-in persona.
    pub fn session(&self) -> Option<Session> {
        self.inner.session.lock().clone()
    }

    pub fn authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    pub fn connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Number of requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Install the callback for server-initiated packets.
    pub fn set_observer<F>(&self, observer: F)
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        *self.inner.observer.lock() = Some(Arc::new(observer));
    }

    /// Whether both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Snapshot for diagnostics.
    pub fn get_connection_status(&self) -> ConnectionStatus {
        let (listener_running, keepalive_running, transport_closed, queued_frames) = {
            let slot = self.inner.link.lock();
            match slot.as_ref() {
                Some(link) => (
                    !link.reader_task.is_finished(),
                    link.keepalive_task
                        .as_ref()
                        .map_or(false, |task| !task.is_finished()),
                    !link.is_writable(),
                    link.writer.pending_count(),
                ),
                None => (false, false, true, 0),
            }
        };
        let state = self.state();
        let (reconnect_attempts, reconnect_delay) = {
            let backoff = self.inner.backoff.lock();
            (backoff.attempts, backoff.delay)
        };

        ConnectionStatus {
            connected: state.is_connected(),
            authenticated: state == ConnectionState::Authenticated,
            state,
            reconnect_attempts,
            max_reconnect_attempts: self.inner.config.reconnect.max_attempts,
            reconnect_delay,
            is_reconnecting: self.inner.reconnecting.load(Ordering::Acquire),
            listener_running,
            keepalive_running,
            transport_closed,
            pending_requests: self.inner.pending.len(),
            queued_frames,
            host: self.inner.config.host.clone(),
            port: self.inner.config.port,
        }
    }
}

/// Removes a waiter when its request is abandoned.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: u32,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.table.remove(self.id);
        }
    }
}

impl Inner {
    /// Install a new link and spawn its tasks. Returns false if closed.
    fn attach(self: &Arc<Self>, stream: BoxedStream) -> bool {
        let mut slot = self.link.lock();
        let mut state = self.state.lock();
        if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (reader, writer) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(writer, self.config.writer.clone());
        let reader_task = tokio::spawn(receive_loop(
            Arc::downgrade(self),
            reader,
            generation,
            self.config.read_buffer_size,
            self.config.max_body_size,
        ));
        let keepalive_task = self
            .config
            .keepalive_interval
            .map(|interval| tokio::spawn(keepalive_loop(Arc::downgrade(self), interval)));

        let previous = slot.replace(Link {
            generation,
            writer,
            writer_task,
            reader_task,
            keepalive_task,
        });
        if let Some(previous) = previous {
            previous.abort_background();
        }
        *state = ConnectionState::Connected;
        true
    }

    /// Tear down link `generation` after a failure. Stale generations are ignored.
    fn link_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        let link = {
            let mut slot = self.link.lock();
            if !matches!(slot.as_ref(), Some(link) if link.generation == generation) {
                return;
            }
            *self.state.lock() = ConnectionState::Disconnected;
            slot.take()
        };

        self.session.lock().take();
        let dropped = self.pending.clear();
        if let Some(link) = link {
            link.abort_background();
        }
        tracing::warn!(
            host = %self.config.host,
            port = self.config.port,
            dropped_requests = dropped,
            "Connection lost: {}",
            reason
        );

        if self.config.auto_reconnect {
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                let Some(inner) = weak.upgrade() else { return };
                if let Err(e) = (Connection { inner }).reconnect().await {
                    tracing::error!("Automatic reconnect failed: {}", e);
                }
            });
        }
    }

    fn dispatch(self: &Arc<Self>, frame: Frame, generation: u64) -> ControlFlow<()> {
        let packet = match PacketCodec::decode_frame(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(
                    correlation_id = frame.correlation_id(),
                    "Dropping undecodable frame: {}",
                    e
                );
                return ControlFlow::Continue(());
            }
        };

        match route(&packet, &self.pending) {
            Route::Heartbeat => return ControlFlow::Continue(()),
            Route::Reply(waiter) => {
                if waiter.send(Ok(packet)).is_err() {
                    tracing::debug!("Waiter gave up before its reply arrived");
                }
                return ControlFlow::Continue(());
            }
            Route::SessionExpired => {
                let failed = self.pending.fail_all(|| BlazeError::SessionExpired);
                tracing::error!(failed_requests = failed, "Session expired, log in again");
                self.notify(&packet);
                self.link_lost(generation, "session expired");
                return ControlFlow::Break(());
            }
            Route::Notice => {
                tracing::info!(method = %packet.method, kind = ?packet.kind, "Message received");
            }
            Route::Miss => {
                tracing::info!(
                    correlation_id = packet.correlation_id,
                    method = %packet.method,
                    "No waiter for reply"
                );
            }
            Route::Pong => {}
            Route::Unmatched => {
                tracing::warn!(
                    correlation_id = packet.correlation_id,
                    method = %packet.method,
                    "No matching request found for packet"
                );
            }
        }
        self.notify(&packet);
        ControlFlow::Continue(())
    }

    fn notify(&self, packet: &Packet) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer(packet);
        }
    }
}

async fn receive_loop<R>(
    inner: Weak<Inner>,
    mut reader: R,
    generation: u64,
    read_buffer_size: usize,
    max_body_size: u32,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; read_buffer_size];
    let mut frames = FrameBuffer::with_capacity_and_max_body(read_buffer_size, max_body_size);

    let reason = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break "server closed the connection".to_string(),
            Ok(n) => n,
            Err(e) => break format!("read failed: {e}"),
        };

        let Some(conn) = inner.upgrade() else { return };
        for frame in frames.push(&buf[..n]) {
            if conn.dispatch(frame, generation).is_break() {
                return;
            }
        }
    };

    if let Some(conn) = inner.upgrade() {
        conn.link_lost(generation, &reason);
    }
}

async fn keepalive_loop(inner: Weak<Inner>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(inner) = inner.upgrade() else { return };
        if !(Connection { inner }).keepalive_tick().await {
            break;
        }
    }
    tracing::debug!("Keepalive loop stopped");
}
