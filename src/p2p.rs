//! # Connection Endpoint
//!
//! The overlay node: one listening socket plus any number of inbound and
//! outbound TCP connections, all speaking the length-prefixed protocol from
//! [`crate::protocol`].
//!
//! ## Features
//!
//! - **Symmetric handshake**: both sides send `hello` immediately; the first
//!   frame received must be the counterpart's `hello` or the connection is
//!   dropped
//! - **Static dispatch table**: each [`MessageKind`] maps to one
//!   [`MessageHandler`], fixed before the endpoint starts
//! - **Ordered processing**: frames from one connection are handled strictly
//!   in arrival order by that connection's task
//! - **Request/response**: correlated round trips over the overlay through
//!   [`RequestManager`]
//! - **Maintenance**: a periodic sweep evicts peers unseen for longer than the
//!   peer timeout
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use sharenet::config::NetworkConfig;
//! use sharenet::p2p::Peer;
//!
//! async fn run() -> Result<(), sharenet::error::NetworkError> {
//!     let mut peer = Peer::bind("127.0.0.1", 8001, NetworkConfig::default()).await?;
//!     peer.start()?;
//!
//!     let remote = peer.connect("127.0.0.1", 8000).await?;
//!     peer.ping(&remote).await?;
//!
//!     peer.stop().await;
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::error::{NetworkError, ProtocolError};
use crate::protocol::{
    parse_timestamp, ContentId, FileListPayload, HelloPayload, Message, MessageCodec, MessageKind,
    NodeId, PeerAddress, PeerListPayload, PeerSummary, PingPayload, PongPayload,
};
use crate::registry::{age_cutoff, LocationRegistry};
use crate::requests::RequestManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Online,
    Offline,
    Connecting,
}

/// What this endpoint knows about another node.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: NodeId,
    pub address: PeerAddress,
    pub last_seen: DateTime<Utc>,
    pub status: PeerStatus,
    /// Round trip of the last answered ping.
    pub rtt: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Established,
    Closing,
    Closed,
}

/// Handles one kind of message. A returned message is written back on the
/// connection the request arrived on.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, peer: &PeerHandle, message: &Message) -> Result<Option<Message>, NetworkError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&PeerHandle, &Message) -> Result<Option<Message>, NetworkError> + Send + Sync,
{
    fn handle(&self, peer: &PeerHandle, message: &Message) -> Result<Option<Message>, NetworkError> {
        self(peer, message)
    }
}

type HandlerTable = Arc<HashMap<MessageKind, Arc<dyn MessageHandler>>>;

struct Connection {
    remote: SocketAddr,
    writer: tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, MessageCodec>>,
    state: Mutex<ConnectionState>,
    write_timeout: Duration,
}

impl Connection {
    fn new(remote: SocketAddr, writer: FramedWrite<OwnedWriteHalf, MessageCodec>, write_timeout: Duration) -> Self {
        Self {
            remote,
            writer: tokio::sync::Mutex::new(writer),
            state: Mutex::new(ConnectionState::Connecting),
            write_timeout,
        }
    }

    async fn send(&self, message: Message) -> Result<(), NetworkError> {
        let mut writer = self.writer.lock().await;
        timeout(self.write_timeout, writer.send(message))
            .await
            .map_err(|_| NetworkError::Timeout(self.write_timeout))??;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }
}

struct Shared {
    id: NodeId,
    address: PeerAddress,
    local_addr: SocketAddr,
    config: NetworkConfig,
    peers: RwLock<HashMap<NodeId, PeerRecord>>,
    registry: Mutex<LocationRegistry>,
    connections: RwLock<HashMap<NodeId, Arc<Connection>>>,
    requests: RequestManager,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Cloneable access to a running endpoint's state and messaging.
///
/// Handlers receive one; the sync engine keeps one.
#[derive(Clone)]
pub struct PeerHandle {
    shared: Arc<Shared>,
}

impl PeerHandle {
    pub fn id(&self) -> &NodeId {
        &self.shared.id
    }

    /// The advertised address, sent in `hello`.
    pub fn address(&self) -> &PeerAddress {
        &self.shared.address
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> &RequestManager {
        &self.shared.requests
    }

    /// Writes one message on the live connection to `peer_id`.
    pub async fn send_message(&self, peer_id: &NodeId, message: Message) -> Result<(), NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }
        let connection = self
            .shared
            .connections
            .read()
            .get(peer_id)
            .cloned()
            .ok_or_else(|| NetworkError::NotConnected(peer_id.to_string()))?;

        if let Err(e) = connection.send(message).await {
            warn!("Failed to send to peer {}: {}", peer_id.short(), e);
            return Err(e);
        }
        Ok(())
    }

    /// Sends to every online peer with a live connection. Returns how many
    /// sends succeeded.
    pub async fn broadcast(&self, message: &Message) -> usize {
        let mut delivered = 0;
        for record in self.connected_peers() {
            if self.send_message(&record.id, message.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn ping(&self, peer_id: &NodeId) -> Result<(), NetworkError> {
        self.send_message(peer_id, Message::ping(self.id())).await
    }

    /// Tells every online peer which content this node serves.
    pub async fn announce_files(&self, files: &[ContentId]) -> usize {
        self.broadcast(&Message::file_list(self.id(), files)).await
    }

    /// Sends the message built by `build` and waits for the reply of kind
    /// `expected` carrying the same request id.
    pub async fn request<F>(
        &self,
        peer_id: &NodeId,
        expected: MessageKind,
        build: F,
        timeout_duration: Duration,
    ) -> Result<Message, NetworkError>
    where
        F: FnOnce(String) -> Message,
    {
        let handle = self.clone();
        let target = peer_id.clone();
        self.shared
            .requests
            .send_request(
                peer_id.clone(),
                expected,
                move |request_id| {
                    let message = build(request_id);
                    async move { handle.send_message(&target, message).await }
                },
                timeout_duration,
            )
            .await
    }

    /// Marks a peer offline. The socket stays open until the next failed
    /// read or write, or until the endpoint stops.
    pub fn disconnect(&self, peer_id: &NodeId) -> bool {
        let known = self.mark_offline(peer_id);
        if known {
            info!("Disconnected peer {}", peer_id.short());
        }
        known
    }

    /// Online peers that still have a live connection.
    pub fn connected_peers(&self) -> Vec<PeerRecord> {
        let connections = self.shared.connections.read();
        self.shared
            .peers
            .read()
            .values()
            .filter(|record| record.status == PeerStatus::Online && connections.contains_key(&record.id))
            .cloned()
            .collect()
    }

    /// Every peer record, including offline ones.
    pub fn known_peers(&self) -> Vec<PeerRecord> {
        self.shared.peers.read().values().cloned().collect()
    }

    pub fn get_peer_info(&self, peer_id: &NodeId) -> Option<PeerRecord> {
        self.shared.peers.read().get(peer_id).cloned()
    }

    pub fn connection_state(&self, peer_id: &NodeId) -> Option<ConnectionState> {
        self.shared.connections.read().get(peer_id).map(|c| c.state())
    }

    pub fn find_file(&self, content_id: &ContentId) -> Vec<PeerAddress> {
        self.shared.registry.lock().find_file(content_id)
    }

    /// Runs `f` with exclusive access to the location directory.
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut LocationRegistry) -> R) -> R {
        f(&mut self.shared.registry.lock())
    }

    /// Evicts peer records and directory entries unseen for longer than the
    /// peer timeout.
    pub fn cleanup_stale(&self) -> Vec<NodeId> {
        let max_age = self.shared.config.peer_timeout();
        let Some(cutoff) = age_cutoff(max_age) else {
            return Vec::new();
        };

        let evicted: Vec<NodeId> = {
            let mut peers = self.shared.peers.write();
            let stale: Vec<NodeId> = peers
                .values()
                .filter(|record| record.last_seen < cutoff)
                .map(|record| record.id.clone())
                .collect();
            for id in &stale {
                peers.remove(id);
            }
            stale
        };
        self.shared.registry.lock().cleanup(max_age.as_secs());

        if !evicted.is_empty() {
            info!("Evicted {} stale peers", evicted.len());
        }
        evicted
    }

    fn register_online(&self, peer_id: &NodeId, address: PeerAddress) {
        if *peer_id == self.shared.id {
            return;
        }
        let now = Utc::now();
        {
            let mut peers = self.shared.peers.write();
            let record = peers.entry(peer_id.clone()).or_insert_with(|| PeerRecord {
                id: peer_id.clone(),
                address: address.clone(),
                last_seen: now,
                status: PeerStatus::Connecting,
                rtt: None,
            });
            record.address = address.clone();
            record.last_seen = now;
            record.status = PeerStatus::Online;
        }
        let mut registry = self.shared.registry.lock();
        if !registry.add_node(peer_id.clone(), address) {
            registry.touch(peer_id);
        }
    }

    fn touch(&self, peer_id: &NodeId) {
        if let Some(record) = self.shared.peers.write().get_mut(peer_id) {
            record.last_seen = Utc::now();
        }
        self.shared.registry.lock().touch(peer_id);
    }

    fn mark_offline(&self, peer_id: &NodeId) -> bool {
        match self.shared.peers.write().get_mut(peer_id) {
            Some(record) => {
                record.status = PeerStatus::Offline;
                true
            }
            None => false,
        }
    }

    fn connection_closed(&self, peer_id: &NodeId, connection: &Arc<Connection>) {
        connection.set_state(ConnectionState::Closed);
        let removed = {
            let mut connections = self.shared.connections.write();
            match connections.get(peer_id) {
                Some(current) if Arc::ptr_eq(current, connection) => {
                    connections.remove(peer_id);
                    true
                }
                _ => false,
            }
        };
        // A newer connection to the same peer keeps it online.
        if removed {
            self.mark_offline(peer_id);
            let cancelled = self.shared.requests.cancel_peer_requests(peer_id);
            if cancelled > 0 {
                debug!("Cancelled {} pending requests to {}", cancelled, peer_id.short());
            }
        }
        info!("Connection to {} ({}) closed", peer_id.short(), connection.remote);
    }
}

/// A node of the overlay.
///
/// Bind it, register any extra handlers, then [`start`](Peer::start) it.
/// A stopped peer cannot be restarted.
pub struct Peer {
    handle: PeerHandle,
    handlers: HandlerTable,
    listener: Option<TcpListener>,
    tasks: Vec<JoinHandle<()>>,
}

impl Deref for Peer {
    type Target = PeerHandle;

    fn deref(&self) -> &PeerHandle {
        &self.handle
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", self.id())
            .field("local_addr", &self.local_addr())
            .field("running", &self.is_running())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl Peer {
    /// Binds the listening socket. The NodeId is derived from `host` and the
    /// port actually bound, so port 0 picks a free port.
    pub async fn bind(host: &str, port: u16, config: NetworkConfig) -> Result<Self, NetworkError> {
        let bind_addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|source| {
            error!("Failed to bind {}: {}", bind_addr, source);
            NetworkError::Bind {
                addr: bind_addr.clone(),
                source,
            }
        })?;
        let local_addr = listener.local_addr()?;
        let address = PeerAddress::new(host, local_addr.port());
        let id = address.node_id();
        let (shutdown, _) = watch::channel(false);

        info!("Peer {} listening on {}", id.short(), local_addr);

        Ok(Self {
            handle: PeerHandle {
                shared: Arc::new(Shared {
                    id,
                    address,
                    local_addr,
                    config,
                    peers: RwLock::new(HashMap::new()),
                    registry: Mutex::new(LocationRegistry::new()),
                    connections: RwLock::new(HashMap::new()),
                    requests: RequestManager::new(),
                    running: AtomicBool::new(false),
                    shutdown,
                }),
            },
            handlers: Arc::new(builtin_handlers()),
            listener: Some(listener),
            tasks: Vec::new(),
        })
    }

    pub fn handle(&self) -> PeerHandle {
        self.handle.clone()
    }

    /// Installs or replaces the handler for `kind`. Takes effect for
    /// connections opened afterwards, so call it before [`start`](Self::start).
    pub fn register_handler(&mut self, kind: MessageKind, handler: impl MessageHandler + 'static) {
        if self.is_running() {
            warn!("Handler for {} registered on a running peer", kind);
        }
        Arc::make_mut(&mut self.handlers).insert(kind, Arc::new(handler));
    }

    /// Spawns the accept loop and the maintenance sweep.
    pub fn start(&mut self) -> Result<(), NetworkError> {
        let Some(listener) = self.listener.take() else {
            warn!("Peer {} already started", self.id().short());
            return Ok(());
        };
        self.handle.shared.running.store(true, Ordering::SeqCst);

        self.tasks.push(tokio::spawn(accept_loop(
            listener,
            self.handle.clone(),
            self.handlers.clone(),
        )));
        self.tasks.push(tokio::spawn(maintenance_loop(self.handle.clone())));

        info!("Peer {} started", self.id().short());
        Ok(())
    }

    /// Dials `host:port`, runs the handshake, and returns the remote NodeId.
    pub async fn connect(&self, host: &str, port: u16) -> Result<NodeId, NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }
        let addr = format!("{}:{}", host, port);
        let connect_timeout = self.config().connect_timeout();

        let attempt = async {
            let stream = TcpStream::connect(&addr).await.map_err(|source| NetworkError::Connect {
                addr: addr.clone(),
                source,
            })?;
            let remote = stream.peer_addr()?;
            handshake(&self.handle, stream, remote).await
        };
        let established = match timeout(connect_timeout, attempt).await {
            Ok(Ok(established)) => established,
            Ok(Err(e)) => {
                warn!("Failed to connect to {}: {}", addr, e);
                return Err(e);
            }
            Err(_) => {
                warn!("Connection to {} timed out", addr);
                return Err(NetworkError::Timeout(connect_timeout));
            }
        };

        let peer_id = established.peer_id.clone();
        info!("Connected to peer {} at {}", peer_id.short(), addr);
        tokio::spawn(run_connection(self.handle.clone(), self.handlers.clone(), established));
        Ok(peer_id)
    }

    /// Says goodbye on every connection, closes the listener and stops all
    /// background tasks.
    pub async fn stop(&mut self) {
        if !self.handle.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping peer {}", self.id().short());

        let connections: Vec<(NodeId, Arc<Connection>)> = self
            .handle
            .shared
            .connections
            .read()
            .iter()
            .map(|(id, connection)| (id.clone(), connection.clone()))
            .collect();
        let goodbye = Message::goodbye(self.id());
        for (peer_id, connection) in connections {
            connection.set_state(ConnectionState::Closing);
            if let Err(e) = connection.send(goodbye.clone()).await {
                debug!("Failed to say goodbye to {}: {}", peer_id.short(), e);
            }
        }

        let _ = self.handle.shared.shutdown.send(true);
        let join_timeout = self.config().read_timeout();
        for task in self.tasks.drain(..) {
            if timeout(join_timeout, task).await.is_err() {
                warn!("Background task did not stop within {:?}", join_timeout);
            }
        }
        info!("Peer {} stopped", self.id().short());
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.handle.shared.running.store(false, Ordering::SeqCst);
        let _ = self.handle.shared.shutdown.send(true);
    }
}

struct Established {
    peer_id: NodeId,
    connection: Arc<Connection>,
    reader: FramedRead<OwnedReadHalf, MessageCodec>,
    hello: Message,
}

async fn handshake(handle: &PeerHandle, stream: TcpStream, remote: SocketAddr) -> Result<Established, NetworkError> {
    let config = handle.config();
    let codec = MessageCodec::with_max_frame_len(config.max_frame_len);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, codec.clone());
    let connection = Arc::new(Connection::new(
        remote,
        FramedWrite::new(write_half, codec),
        config.connect_timeout(),
    ));

    connection.set_state(ConnectionState::Handshaking);
    connection.send(Message::hello(handle.id(), handle.address())).await?;

    let hello = match timeout(config.connect_timeout(), reader.next()).await {
        Err(_) => return Err(NetworkError::Timeout(config.connect_timeout())),
        Ok(None) => return Err(NetworkError::Closed),
        Ok(Some(frame)) => frame?,
    };
    if hello.kind() != MessageKind::Hello {
        return Err(ProtocolError::HandshakeViolation(hello.kind().to_string()).into());
    }
    let payload: HelloPayload = hello.parse_payload()?;
    let address = payload
        .address
        .unwrap_or_else(|| PeerAddress::new(remote.ip().to_string(), remote.port()));
    let peer_id = hello.sender_id().clone();

    connection.set_state(ConnectionState::Established);
    handle.register_online(&peer_id, address);
    if let Some(previous) = handle
        .shared
        .connections
        .write()
        .insert(peer_id.clone(), connection.clone())
    {
        previous.set_state(ConnectionState::Closing);
    }
    debug!(
        "Handshake with {} complete (protocol {}, {:?})",
        peer_id.short(),
        payload.version,
        payload.capabilities
    );

    Ok(Established {
        peer_id,
        connection,
        reader,
        hello,
    })
}

async fn run_connection(handle: PeerHandle, handlers: HandlerTable, established: Established) {
    let Established {
        peer_id,
        connection,
        mut reader,
        hello,
    } = established;
    let mut shutdown = handle.shared.shutdown.subscribe();
    let read_timeout = handle.config().read_timeout();

    respond(&handle, &handlers, &connection, hello).await;

    loop {
        if !handle.is_running() || connection.state() == ConnectionState::Closing {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = timeout(read_timeout, reader.next()) => match frame {
                Err(_) => continue,
                Ok(None) => {
                    debug!("Peer {} closed the connection", peer_id.short());
                    break;
                }
                Ok(Some(Err(e))) => {
                    warn!("Dropping connection to {}: {}", peer_id.short(), e);
                    break;
                }
                Ok(Some(Ok(message))) => respond(&handle, &handlers, &connection, message).await,
            },
        }
    }

    handle.connection_closed(&peer_id, &connection);
}

async fn respond(handle: &PeerHandle, handlers: &HandlerTable, connection: &Connection, message: Message) {
    let kind = message.kind();
    if let Some(reply) = dispatch(handle, handlers, &message) {
        if let Err(e) = connection.send(reply).await {
            warn!("Failed to answer {} from {}: {}", kind, message.sender_id().short(), e);
        }
    }
}

fn dispatch(handle: &PeerHandle, handlers: &HandlerTable, message: &Message) -> Option<Message> {
    handle.touch(message.sender_id());
    let Some(handler) = handlers.get(&message.kind()) else {
        warn!("No handler for {} from {}", message.kind(), message.sender_id().short());
        return None;
    };
    match handler.handle(handle, message) {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Failed to handle {} from {}: {}", message.kind(), message.sender_id().short(), e);
            None
        }
    }
}

async fn accept_loop(listener: TcpListener, handle: PeerHandle, handlers: HandlerTable) {
    let mut shutdown = handle.shared.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!("Accepted connection from {}", remote);
                    let handle = handle.clone();
                    let handlers = handlers.clone();
                    tokio::spawn(async move {
                        match handshake(&handle, stream, remote).await {
                            Ok(established) => run_connection(handle, handlers, established).await,
                            Err(e) => warn!("Handshake with {} failed: {}", remote, e),
                        }
                    });
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            },
        }
    }
    debug!("Accept loop for {} stopped", handle.id().short());
}

async fn maintenance_loop(handle: PeerHandle) {
    let mut shutdown = handle.shared.shutdown.subscribe();
    let mut ticker = interval(handle.config().cleanup_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                handle.cleanup_stale();
                let expired = handle.requests().expire(handle.config().request_timeout() * 2);
                if expired > 0 {
                    debug!("Expired {} stale requests", expired);
                }
            }
        }
    }
}

fn builtin_handlers() -> HashMap<MessageKind, Arc<dyn MessageHandler>> {
    let mut handlers: HashMap<MessageKind, Arc<dyn MessageHandler>> = HashMap::new();
    handlers.insert(MessageKind::Hello, Arc::new(on_hello));
    handlers.insert(MessageKind::PeerList, Arc::new(on_peer_list));
    handlers.insert(MessageKind::FileList, Arc::new(on_file_list));
    handlers.insert(MessageKind::Ping, Arc::new(on_ping));
    handlers.insert(MessageKind::Pong, Arc::new(on_pong));
    handlers.insert(MessageKind::Goodbye, Arc::new(on_goodbye));
    handlers.insert(MessageKind::VersionResponse, Arc::new(on_response));
    handlers.insert(MessageKind::ChangesResponse, Arc::new(on_response));
    handlers
}

/// Registers the sender and answers with the peers we know to be online.
fn on_hello(peer: &PeerHandle, message: &Message) -> Result<Option<Message>, NetworkError> {
    let payload: HelloPayload = message.parse_payload()?;
    let sender = message.sender_id();
    let address = payload
        .address
        .or_else(|| peer.get_peer_info(sender).map(|record| record.address));
    if let Some(address) = address {
        peer.register_online(sender, address);
    }

    let summaries: Vec<PeerSummary> = peer
        .shared
        .peers
        .read()
        .values()
        .filter(|record| record.status == PeerStatus::Online && record.id != *sender)
        .map(|record| PeerSummary {
            id: record.id.clone(),
            address: record.address.clone(),
        })
        .collect();
    Ok(Some(Message::peer_list(peer.id(), &summaries)))
}

fn on_peer_list(peer: &PeerHandle, message: &Message) -> Result<Option<Message>, NetworkError> {
    let payload: PeerListPayload = message.parse_payload()?;
    let mut learned = 0;
    for summary in payload.peers {
        if summary.id == *peer.id() || peer.get_peer_info(&summary.id).is_some() {
            continue;
        }
        peer.register_online(&summary.id, summary.address);
        learned += 1;
    }
    if learned > 0 {
        debug!("Learned {} peers from {}", learned, message.sender_id().short());
    }
    Ok(None)
}

fn on_file_list(peer: &PeerHandle, message: &Message) -> Result<Option<Message>, NetworkError> {
    let payload: FileListPayload = message.parse_payload()?;
    let sender = message.sender_id();
    peer.with_registry(|registry| {
        for file in payload.files {
            if !registry.add_file(file, sender) {
                debug!("File list from unregistered node {}", sender.short());
                break;
            }
        }
    });
    Ok(None)
}

fn on_ping(peer: &PeerHandle, message: &Message) -> Result<Option<Message>, NetworkError> {
    let payload: PingPayload = message.parse_payload()?;
    Ok(Some(Message::pong(peer.id(), &payload.timestamp)))
}

fn on_pong(peer: &PeerHandle, message: &Message) -> Result<Option<Message>, NetworkError> {
    let payload: PongPayload = message.parse_payload()?;
    let sent = parse_timestamp(&payload.ping_timestamp)?;
    let rtt = (Utc::now() - sent).to_std().unwrap_or_default();
    if let Some(record) = peer.shared.peers.write().get_mut(message.sender_id()) {
        record.rtt = Some(rtt);
    }
    debug!("Pong from {} after {:?}", message.sender_id().short(), rtt);
    Ok(None)
}

fn on_goodbye(peer: &PeerHandle, message: &Message) -> Result<Option<Message>, NetworkError> {
    let sender = message.sender_id();
    peer.mark_offline(sender);
    if let Some(connection) = peer.shared.connections.read().get(sender) {
        connection.set_state(ConnectionState::Closing);
    }
    info!("Peer {} said goodbye", sender.short());
    Ok(None)
}

fn on_response(peer: &PeerHandle, message: &Message) -> Result<Option<Message>, NetworkError> {
    peer.requests().handle_response(message.clone());
    Ok(None)
}
