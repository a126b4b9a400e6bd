//! TCP transport: accept loop, per-connection threads and the outbound
//! sink that maps clients to their channels.
//!
//! Each logical connection owns one [`ChannelHandle`]. A TCP stream that
//! opens with a known channel session id is attached to the existing
//! connection instead of creating a new one, which is how a client resumes
//! after a transport drop.

use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, TrySendError};
use thiserror::Error;

use crate::config::Config;
use crate::core::{
    ChannelSessionId, ClientId, ConnectionId, ErrorPayload, Limits, ProtocolErrorCode,
};
use crate::daemon::apply::ObjectStore;
use crate::daemon::broadcast::{OutboundError, OutboundSink};
use crate::daemon::cbor::ProtoDecodeError;
use crate::daemon::channel::{
    ChannelError, ChannelEvent, ChannelHandle, ChannelState, FrameError, FrameReader,
    FramedPacketWriter, Packet, PacketSink, SequencedChannel, decode_packet, now_ms,
};
use crate::daemon::core::{Coordinator, CoordinatorDeps, Disposition};
use crate::daemon::events::{CoordinatorEvent, EventHandler};
use crate::daemon::handshake::SessionRegistry;
use crate::daemon::metrics;
use crate::daemon::proto::{ServerMessage, encode_server_message};
use crate::error::{Effect, Error, Transience};

const ACCEPT_IDLE: Duration = Duration::from_millis(25);
const TIMER_TICK: Duration = Duration::from_millis(25);
/// How often a writer blocked on a full or paused channel rechecks its
/// connection.
const WRITER_POLL: Duration = Duration::from_millis(50);
const INBOX_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Decode(#[from] ProtoDecodeError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl ServerError {
    pub fn transience(&self) -> Transience {
        match self {
            ServerError::Spawn { .. } | ServerError::Io(_) | ServerError::Frame(FrameError::Io(_)) => {
                Transience::Retryable
            }
            ServerError::Channel(err) => err.transience(),
            ServerError::Bind { .. } | ServerError::Frame(_) | ServerError::Decode(_) => {
                Transience::Permanent
            }
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            ServerError::Io(_) | ServerError::Frame(FrameError::Io(_)) => Effect::Unknown,
            ServerError::Channel(err) => err.effect(),
            ServerError::Bind { .. }
            | ServerError::Spawn { .. }
            | ServerError::Frame(_)
            | ServerError::Decode(_) => Effect::None,
        }
    }
}

struct Transport {
    generation: u64,
    stream: Option<TcpStream>,
}

/// One entry of a connection's outbound queue.
enum Outgoing {
    Message(Bytes),
    /// Close the channel once everything queued before it is sent.
    CloseAfter(ErrorPayload),
}

struct Connection {
    id: ConnectionId,
    session: ChannelSessionId,
    channel: ChannelHandle,
    transport: Mutex<Transport>,
    inbox: Mutex<Option<Sender<Bytes>>>,
    outbox: Mutex<Option<Sender<Outgoing>>>,
    overflowed: AtomicBool,
}

impl Connection {
    fn transport(&self) -> MutexGuard<'_, Transport> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs `stream` as the transport, shutting down any previous one.
    /// Returns the generation readers use to tell whether they are stale.
    fn replace_transport(&self, stream: TcpStream, max_frame_bytes: usize) -> io::Result<u64> {
        let writer = stream.try_clone()?;
        let mut transport = self.transport();
        if let Some(old) = transport.stream.take() {
            let _ = old.shutdown(Shutdown::Both);
        }
        transport.generation += 1;
        transport.stream = Some(stream);
        self.channel
            .attach(Box::new(FramedPacketWriter::new(writer, max_frame_bytes)));
        Ok(transport.generation)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.transport().generation == generation
    }

    fn drop_transport(&self) {
        if let Some(stream) = self.transport().stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn inbox(&self) -> Option<Sender<Bytes>> {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn close_inbox(&self) {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Queues `item` for the connection's writer without blocking.
    ///
    /// A full queue marks the connection overflowed and closes the queue; the
    /// writer then closes the channel so the client rebuilds its state
    /// through a fresh handshake instead of missing messages.
    fn enqueue(&self, item: Outgoing) -> Result<(), EnqueueError> {
        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = outbox.as_ref() else {
            return Err(EnqueueError::Closed);
        };
        match sender.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.overflowed.store(true, Ordering::Release);
                outbox.take();
                Err(EnqueueError::Overflow)
            }
            Err(TrySendError::Disconnected(_)) => {
                outbox.take();
                Err(EnqueueError::Closed)
            }
        }
    }

    fn close_outbox(&self) {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EnqueueError {
    Overflow,
    Closed,
}

impl EnqueueError {
    fn into_outbound(self, client: ClientId) -> OutboundError {
        match self {
            EnqueueError::Overflow => OutboundError::Overloaded { client },
            EnqueueError::Closed => OutboundError::Closed { client },
        }
    }
}

#[derive(Default)]
struct Connections {
    by_id: HashMap<ConnectionId, Arc<Connection>>,
    by_session: HashMap<ChannelSessionId, ConnectionId>,
}

/// Live connections, and the [`OutboundSink`] the coordinator writes to.
pub struct ConnectionRegistry {
    sessions: Arc<SessionRegistry>,
    inner: Mutex<Connections>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self {
            sessions,
            inner: Mutex::new(Connections::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn connections(&self) -> MutexGuard<'_, Connections> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, connection: Arc<Connection>) -> usize {
        let mut connections = self.connections();
        connections
            .by_session
            .insert(connection.session, connection.id);
        connections.by_id.insert(connection.id, connection);
        connections.by_id.len()
    }

    fn remove(&self, id: ConnectionId) -> usize {
        let mut connections = self.connections();
        if let Some(connection) = connections.by_id.remove(&id)
            && connections.by_session.get(&connection.session) == Some(&id)
        {
            connections.by_session.remove(&connection.session);
        }
        connections.by_id.len()
    }

    fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections().by_id.get(&id).cloned()
    }

    fn by_session(&self, session: ChannelSessionId) -> Option<Arc<Connection>> {
        let connections = self.connections();
        let id = connections.by_session.get(&session)?;
        connections.by_id.get(id).cloned()
    }

    fn all(&self) -> Vec<Arc<Connection>> {
        self.connections().by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn of_client(&self, client: ClientId) -> Option<Arc<Connection>> {
        self.get(self.sessions.connection_of(client)?)
    }
}

impl OutboundSink for ConnectionRegistry {
    fn send(&self, client: ClientId, message: ServerMessage) -> Result<(), OutboundError> {
        let connection = self
            .of_client(client)
            .ok_or(OutboundError::NotConnected { client })?;
        let bytes = encode_server_message(&message).map_err(|err| OutboundError::Encode {
            client,
            reason: err.to_string(),
        })?;
        connection
            .enqueue(Outgoing::Message(Bytes::from(bytes)))
            .map_err(|err| {
                if err == EnqueueError::Overflow {
                    tracing::warn!(
                        %client,
                        connection = %connection.id,
                        "outbound queue overflowed; closing channel"
                    );
                }
                err.into_outbound(client)
            })
    }
}

impl EventHandler for ConnectionRegistry {
    fn handle(&self, event: &CoordinatorEvent) {
        // Cutting the transport pauses the channel; the client has to
        // re-handshake before its transactions are accepted again.
        if let CoordinatorEvent::TransactionFailed { client, .. } = event
            && let Some(connection) = self.of_client(*client)
        {
            tracing::warn!(
                %client,
                connection = %connection.id,
                "dropping transport after failed transaction"
            );
            connection.drop_transport();
        }
    }
}

pub struct Server;

impl Server {
    /// Binds the listener and starts the coordinator, the accept loop and
    /// the channel timer.
    pub fn start(config: &Config, store: Arc<dyn ObjectStore>) -> Result<ServerHandle, Error> {
        let sessions = Arc::new(SessionRegistry::new());
        let connections = Arc::new(ConnectionRegistry::new(Arc::clone(&sessions)));
        let coordinator = Arc::new(Coordinator::start(
            config,
            CoordinatorDeps {
                store,
                sessions,
                outbound: connections.clone(),
            },
        )?);
        coordinator.events().register(connections.clone());

        let addr = config.server.listen_addr.clone();
        let listener = TcpListener::bind(&addr).map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(ServerError::Io)?;
        listener.set_nonblocking(true).map_err(ServerError::Io)?;

        let runtime = ServerRuntime {
            coordinator: Arc::clone(&coordinator),
            connections: Arc::clone(&connections),
            limits: config.limits.clone(),
            max_connections: config.server.max_connections,
            shutdown: Arc::new(AtomicBool::new(false)),
            active_transports: Arc::new(AtomicUsize::new(0)),
        };

        let accept_runtime = runtime.clone();
        let accept = spawn("dso-accept", move || run_accept_loop(listener, accept_runtime))?;
        let timer_runtime = runtime.clone();
        let timer = spawn("dso-timer", move || run_timer_loop(timer_runtime))?;

        tracing::info!(%local_addr, "coordinator listening");
        Ok(ServerHandle {
            local_addr,
            runtime,
            threads: vec![accept, timer],
        })
    }
}

fn spawn(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, ServerError> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|source| ServerError::Spawn {
            name: name.to_string(),
            source,
        })
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    runtime: ServerRuntime,
    threads: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.runtime.coordinator
    }

    pub fn connection_count(&self) -> usize {
        self.runtime.connections.len()
    }

    /// Blocks until the accept loop exits.
    pub fn join(mut self) {
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }

    /// Stops accepting, closes every channel and drains the pipeline.
    pub fn shutdown(mut self) {
        self.runtime.shutdown.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        let payload = ErrorPayload::new(ProtocolErrorCode::Shutdown, "coordinator shutting down", true);
        for connection in self.runtime.connections.all() {
            self.runtime.close(&connection, payload.clone());
        }
        self.runtime.coordinator.shutdown();
        tracing::info!("coordinator stopped");
    }
}

#[derive(Clone)]
struct ServerRuntime {
    coordinator: Arc<Coordinator>,
    connections: Arc<ConnectionRegistry>,
    limits: Limits,
    max_connections: usize,
    shutdown: Arc<AtomicBool>,
    active_transports: Arc<AtomicUsize>,
}

struct TransportGuard {
    active: Arc<AtomicUsize>,
}

impl TransportGuard {
    fn try_acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let mut current = active.load(Ordering::Acquire);
        loop {
            if current >= max {
                return None;
            }
            match active.compare_exchange(
                current,
                current.saturating_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Self {
                        active: Arc::clone(active),
                    });
                }
                Err(next) => current = next,
            }
        }
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        let prev = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "active transport counter underflow");
    }
}

fn run_accept_loop(listener: TcpListener, runtime: ServerRuntime) {
    loop {
        if runtime.shutdown.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let Some(guard) =
                    TransportGuard::try_acquire(&runtime.active_transports, runtime.max_connections)
                else {
                    tracing::warn!(%peer, "connection limit reached");
                    refuse(stream, &runtime.limits);
                    continue;
                };
                let conn_runtime = runtime.clone();
                let spawned = spawn("dso-conn", move || {
                    if let Err(err) = run_transport(stream, &conn_runtime, guard) {
                        tracing::debug!(%peer, error = %err, "transport ended with error");
                    }
                });
                if let Err(err) = spawned {
                    tracing::error!(error = %err, "cannot serve connection");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_IDLE),
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                thread::sleep(ACCEPT_IDLE);
            }
        }
    }
}

fn refuse(stream: TcpStream, limits: &Limits) {
    let payload = ErrorPayload::new(
        ProtocolErrorCode::Overloaded,
        "connection limit reached",
        true,
    );
    let mut writer = FramedPacketWriter::new(stream, limits.max_frame_bytes);
    let _ = writer.transmit(&Packet::Close {
        error: Some(payload),
    });
}

fn run_timer_loop(runtime: ServerRuntime) {
    while !runtime.shutdown.load(Ordering::Relaxed) {
        thread::sleep(TIMER_TICK);
        for connection in runtime.connections.all() {
            let events = connection.channel.poll_timers();
            runtime.handle_events(&connection, events);
        }
        for (id, payload) in runtime.coordinator.tick(now_ms()) {
            if let Some(connection) = runtime.connections.get(id) {
                runtime.close(&connection, payload);
            }
        }
    }
}

/// Serves one TCP stream until it fails or its channel closes.
fn run_transport(
    stream: TcpStream,
    runtime: &ServerRuntime,
    _guard: TransportGuard,
) -> Result<(), ServerError> {
    let limits = &runtime.limits;
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let mut reader = FrameReader::new(stream.try_clone()?, limits.max_frame_bytes);

    let Some(first) = reader.read_next()? else {
        return Ok(());
    };
    let open = match decode_packet(&first, limits)? {
        Packet::Open(open) => open,
        other => {
            tracing::debug!(packet = ?other, "transport did not start with open");
            let payload = ErrorPayload::new(
                ProtocolErrorCode::InvalidRequest,
                "expected open",
                false,
            );
            let mut writer = FramedPacketWriter::new(stream, limits.max_frame_bytes);
            writer.transmit(&Packet::Close {
                error: Some(payload),
            })?;
            return Ok(());
        }
    };

    let connection = match runtime.connections.by_session(open.session) {
        Some(existing) => existing,
        None => runtime.open_connection(open.session)?,
    };
    let span = tracing::info_span!(
        "coord_session",
        connection = %connection.id,
        session = %open.session
    );
    let _enter = span.enter();

    let generation = connection.replace_transport(stream, limits.max_frame_bytes)?;
    let events = connection.channel.on_receive(Packet::Open(open));
    runtime.handle_events(&connection, events);

    loop {
        if connection.channel.state() == ChannelState::Closed {
            break;
        }
        let bytes = match reader.read_next() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(FrameError::Io(err)) => {
                tracing::debug!(error = %err, "transport read failed");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "malformed frame");
                if let Some(payload) = err.as_error_payload() {
                    runtime.close(&connection, payload);
                }
                break;
            }
        };
        match decode_packet(&bytes, limits) {
            Ok(packet) => {
                let events = connection.channel.on_receive(packet);
                runtime.handle_events(&connection, events);
            }
            Err(err) => {
                tracing::warn!(error = %err, "undecodable packet");
                runtime.close(&connection, err.as_error_payload());
                break;
            }
        }
    }

    if connection.is_current(generation) {
        let events = connection.channel.on_transport_reset();
        runtime.handle_events(&connection, events);
    }
    Ok(())
}

fn run_dispatcher(runtime: ServerRuntime, connection: Arc<Connection>, inbox: Receiver<Bytes>) {
    let span = tracing::info_span!("coord_session", connection = %connection.id);
    let _enter = span.enter();
    for payload in inbox.iter() {
        match runtime
            .coordinator
            .handle_payload(connection.id, &payload, now_ms())
        {
            Disposition::Continue => {}
            Disposition::Activated { client, superseded } => {
                tracing::debug!(%client, "session active");
                if let Some(old) = superseded.and_then(|id| runtime.connections.get(id)) {
                    let payload = ErrorPayload::new(
                        ProtocolErrorCode::SessionSuperseded,
                        format!("{client} reconnected on {}", connection.id),
                        false,
                    );
                    runtime.close(&old, payload);
                }
            }
            Disposition::Close { reply, error } => {
                match encode_server_message(&reply) {
                    Ok(bytes) => {
                        if let Err(err) = connection.enqueue(Outgoing::Message(Bytes::from(bytes))) {
                            tracing::debug!(error = ?err, "final reply not queued");
                        }
                    }
                    Err(err) => tracing::debug!(error = %err, "final reply not encoded"),
                }
                if connection.enqueue(Outgoing::CloseAfter(error.clone())).is_err() {
                    runtime.close(&connection, error);
                }
                break;
            }
        }
    }
}

/// Drains one connection's outbound queue into its channel.
///
/// Blocks only this connection while the channel is paused or its window is
/// full; queued messages are kept until the client resumes.
fn run_writer(runtime: ServerRuntime, connection: Arc<Connection>, outbox: Receiver<Outgoing>) {
    let span = tracing::info_span!("coord_writer", connection = %connection.id);
    let _enter = span.enter();
    for item in outbox.iter() {
        if connection.is_overflowed() {
            break;
        }
        let payload = match item {
            Outgoing::Message(payload) => payload,
            Outgoing::CloseAfter(error) => {
                runtime.close(&connection, error);
                return;
            }
        };
        loop {
            match connection.channel.send(payload.clone(), WRITER_POLL) {
                Ok(()) => break,
                Err(ChannelError::SendTimeout) if !connection.is_overflowed() => {}
                Err(ChannelError::SendTimeout) => break,
                Err(ChannelError::Closed) => return,
                Err(err) => {
                    tracing::warn!(error = %err, "outbound message rejected by channel");
                    break;
                }
            }
        }
    }
    if connection.is_overflowed() {
        let payload = ErrorPayload::new(
            ProtocolErrorCode::Overloaded,
            "outbound queue overflowed",
            true,
        );
        runtime.close(&connection, payload);
    }
}

impl ServerRuntime {
    fn open_connection(&self, session: ChannelSessionId) -> Result<Arc<Connection>, ServerError> {
        let id = self.connections.next_id();
        let (tx, rx) = crossbeam::channel::bounded(INBOX_CAPACITY);
        let (out_tx, out_rx) =
            crossbeam::channel::bounded(self.limits.outbound_queue_capacity.max(1));
        let connection = Arc::new(Connection {
            id,
            session,
            channel: ChannelHandle::new(SequencedChannel::acceptor(&self.limits, now_ms())),
            transport: Mutex::new(Transport {
                generation: 0,
                stream: None,
            }),
            inbox: Mutex::new(Some(tx)),
            outbox: Mutex::new(Some(out_tx)),
            overflowed: AtomicBool::new(false),
        });
        let runtime = self.clone();
        let dispatched = Arc::clone(&connection);
        spawn(&format!("dso-dispatch-{}", id.get()), move || {
            run_dispatcher(runtime, dispatched, rx)
        })?;
        let runtime = self.clone();
        let written = Arc::clone(&connection);
        spawn(&format!("dso-writer-{}", id.get()), move || {
            run_writer(runtime, written, out_rx)
        })?;
        let live = self.connections.insert(Arc::clone(&connection));
        metrics::set_connections(live);
        Ok(connection)
    }

    fn handle_events(&self, connection: &Arc<Connection>, events: Vec<ChannelEvent>) {
        for event in events {
            match event {
                ChannelEvent::Delivered(payload) => {
                    let Some(inbox) = connection.inbox() else {
                        continue;
                    };
                    if inbox.send(payload).is_err() {
                        tracing::debug!(connection = %connection.id, "dispatcher gone");
                    }
                }
                ChannelEvent::Established { resumed: false } => {
                    tracing::info!(connection = %connection.id, "channel established");
                    self.coordinator.channel_established(connection.id, now_ms());
                }
                ChannelEvent::Established { resumed: true } => {
                    tracing::info!(connection = %connection.id, "channel resumed");
                }
                ChannelEvent::Paused => {
                    tracing::info!(connection = %connection.id, "transport lost; awaiting resume");
                }
                ChannelEvent::Closed { error, by_peer } => {
                    self.retire(connection, error.as_ref(), by_peer);
                }
            }
        }
    }

    fn close(&self, connection: &Arc<Connection>, error: ErrorPayload) {
        let events = connection.channel.close(Some(error));
        self.handle_events(connection, events);
    }

    fn retire(&self, connection: &Connection, error: Option<&ErrorPayload>, by_peer: bool) {
        let live = self.connections.remove(connection.id);
        metrics::set_connections(live);
        connection.close_inbox();
        connection.close_outbox();
        connection.drop_transport();
        let client = self.coordinator.connection_closed(connection.id);
        tracing::info!(
            connection = %connection.id,
            client = ?client,
            by_peer,
            code = error.map(|e| e.code.as_str()),
            "channel closed"
        );
    }
}
