//! The connection manager: the registry of live connections, the listener,
//! the outbound reconnect schedule, service dispatch, ban scoring, and the
//! hourly maintenance sweep.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, AtomicI32, Ordering},
    Arc, Mutex,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use indexmap::IndexMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{
    run_connection, Command, ConnectionHandle, ConnectionId, Direction, Dispatcher, Priority,
};
use crate::constants::{
    reconnect_timeout_for_step, BAN_SCORE_THRESHOLD, BAN_SECONDS, GARBAGE_RETRY_DELAY,
    MAINTENANCE_INTERVAL, MAX_COOKIE_BYTES, RESOLVE_RETRY_DELAY, SCORE_DECAY,
};
use crate::error::Error;
use crate::protocol::message::{Message, TagValue};

/// The service id of the login handshake.
pub const LOGIN_SERVICE_ID: u32 = 40;
/// The login message within the login service.
pub const LOGIN_MESSAGE_ID: u32 = 0;
/// The body tag carrying the cookie bytes.
pub const LOGIN_COOKIE_DATA_TAG: u32 = 1;

/// A remote endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EndPoint {
    pub hostname: String,
    /// The port the peer announces. Outgoing connections always have this
    /// equal to `peer_port`, which is how auto-login recognizes them.
    pub announce_port: u16,
    pub peer_port: u16,
}

impl EndPoint {
    pub fn new(hostname: impl Into<String>, port: u16) -> EndPoint {
        EndPoint {
            hostname: hostname.into(),
            announce_port: port,
            peer_port: port,
        }
    }

    fn is_outbound(&self) -> bool {
        self.announce_port == self.peer_port
    }
}

/// Transport configuration.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NetworkConfig {
    /// Send the contents of this file as a login message on every outbound
    /// connection.
    pub cookie_file: Option<PathBuf>,
    /// Close and punish peers that address an unregistered service.
    pub strict_services: bool,
}

/// A handler for one service id.
pub trait NetworkService: Send + Sync {
    fn id(&self) -> u32;
    fn on_incoming_message(&self, message: &Message);
}

struct BannedPeer {
    address: IpAddr,
    until: DateTime<Utc>,
}

struct Peer {
    handle: ConnectionHandle,
    address: Option<IpAddr>,
    /// The configured endpoint, kept for reconnect bookkeeping on outbound
    /// connections.
    #[allow(dead_code)]
    endpoint: Option<EndPoint>,
    punishment: u32,
}

struct Inner {
    config: NetworkConfig,
    connections: Mutex<IndexMap<ConnectionId, Peer>>,
    banned: Mutex<Vec<BannedPeer>>,
    services: Mutex<HashMap<u32, Arc<dyn NetworkService>>>,
    next_id: AtomicI32,
    closing: AtomicBool,
}

/// The connection manager. Cheap to clone.
#[derive(Clone)]
pub struct NetworkManager {
    inner: Arc<Inner>,
}

impl Dispatcher for Inner {
    fn deliver(&self, message: Message) {
        let service = {
            let services = self.services.lock().expect("service registry poisoned");
            services.get(&message.service_id).cloned()
        };
        match service {
            Some(service) => service.on_incoming_message(&message),
            None => {
                debug!(service = message.service_id, "message for unknown service");
                if self.config.strict_services {
                    if let Some(remote) = message.remote {
                        self.punish(remote, Error::UnknownService(message.service_id).ban_score());
                    }
                }
            }
        }
    }
}

impl Inner {
    fn is_banned(&self, address: IpAddr) -> bool {
        let now = Utc::now();
        self.banned
            .lock()
            .expect("ban list poisoned")
            .iter()
            .any(|banned| banned.address == address && banned.until > now)
    }

    fn punish(&self, id: ConnectionId, score: u32) {
        if score == 0 {
            return;
        }
        let mut connections = self.connections.lock().expect("connection registry poisoned");
        let peer = match connections.get_mut(&id) {
            Some(peer) => peer,
            None => return,
        };
        peer.punishment = peer.punishment.saturating_add(score);
        if peer.punishment >= BAN_SCORE_THRESHOLD {
            if let Some(address) = peer.address {
                info!(%address, "banning misbehaving peer");
                self.banned.lock().expect("ban list poisoned").push(BannedPeer {
                    address,
                    until: Utc::now() + ChronoDuration::seconds(BAN_SECONDS),
                });
                metrics::counter!("network.peers.banned", 1);
            }
            peer.handle.close();
            connections.remove(&id);
        }
    }

    /// The once-an-hour sweep: decay misbehavior and evict expired bans.
    fn maintenance(&self) {
        let now = Utc::now();
        {
            let mut connections =
                self.connections.lock().expect("connection registry poisoned");
            for (_, peer) in connections.iter_mut() {
                peer.punishment = peer.punishment.saturating_sub(SCORE_DECAY);
            }
        }
        let mut banned = self.banned.lock().expect("ban list poisoned");
        banned.retain(|entry| entry.until > now);
        metrics::gauge!("network.peers.banned.active", banned.len() as _);
    }

    fn remove_connection(&self, id: ConnectionId) {
        self.connections
            .lock()
            .expect("connection registry poisoned")
            .remove(&id);
    }
}

impl NetworkManager {
    pub fn new(config: NetworkConfig) -> NetworkManager {
        let inner = Arc::new(Inner {
            config,
            connections: Mutex::new(IndexMap::new()),
            banned: Mutex::new(Vec::new()),
            services: Mutex::new(HashMap::new()),
            next_id: AtomicI32::new(1),
            closing: AtomicBool::new(false),
        });

        // Hourly maintenance: ban expiry and score decay.
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(inner) => inner.maintenance(),
                    None => return,
                }
            }
        });

        NetworkManager { inner }
    }

    /// Register a service handler. New services register at startup.
    pub fn add_service(&self, service: Arc<dyn NetworkService>) {
        self.inner
            .services
            .lock()
            .expect("service registry poisoned")
            .insert(service.id(), service);
    }

    /// Bind a listener and accept incoming connections. Returns the bound
    /// address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(%local, "listening");

        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                if manager.inner.closing.load(Ordering::SeqCst) {
                    return;
                }
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(%error, "accept failed");
                        continue;
                    }
                };
                // Banned endpoints are closed without reply.
                if manager.inner.is_banned(peer_addr.ip()) {
                    debug!(%peer_addr, "closing incoming connection (banned)");
                    drop(stream);
                    continue;
                }
                manager.spawn_connection(stream, Direction::Inbound, None);
            }
        });
        Ok(local)
    }

    /// Create an outbound connection with lazy reconnect. Returns the
    /// connection id immediately; frames queue until the socket is up.
    pub fn connect(&self, endpoint: EndPoint) -> ConnectionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let manager = self.clone();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.register(id, ConnectionHandle { sender }, None, Some(endpoint.clone()));

        tokio::spawn(manager.run_outbound(id, endpoint, receiver));
        id
    }

    async fn run_outbound(
        self,
        id: ConnectionId,
        endpoint: EndPoint,
        mut receiver: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut step: u32 = 0;
        loop {
            if self.inner.closing.load(Ordering::SeqCst) {
                return;
            }

            let target = format!("{}:{}", endpoint.hostname, endpoint.peer_port);
            let addrs: Vec<SocketAddr> = match tokio::net::lookup_host(&target).await {
                Ok(addrs) => addrs.collect(),
                Err(error) => {
                    warn!(%target, %error, "hostname did not resolve");
                    tokio::time::sleep(RESOLVE_RETRY_DELAY).await;
                    continue;
                }
            };
            let stream = match connect_any(&addrs).await {
                Some(stream) => stream,
                None => {
                    step += 1;
                    tokio::time::sleep(reconnect_timeout_for_step(step)).await;
                    continue;
                }
            };
            // Connected; the failure streak ends here.
            step = 0;

            let address = stream.peer_addr().ok().map(|addr| addr.ip());
            if let Some(peer) = self
                .inner
                .connections
                .lock()
                .expect("connection registry poisoned")
                .get_mut(&id)
            {
                peer.address = address;
            }

            let login = if endpoint.is_outbound() {
                self.login_message()
            } else {
                None
            };
            let result = run_connection(
                stream,
                id,
                Direction::Outbound,
                self.inner.clone() as Arc<dyn Dispatcher>,
                receiver,
                login,
            )
            .await;

            // The command channel was consumed; a fresh one replaces it so
            // queued sends survive the reconnect window.
            let (sender, new_receiver) = mpsc::unbounded_channel();
            receiver = new_receiver;
            if let Some(peer) = self
                .inner
                .connections
                .lock()
                .expect("connection registry poisoned")
                .get_mut(&id)
            {
                peer.handle = ConnectionHandle { sender };
            }

            match result {
                Ok(()) => {
                    // Closed locally; stop reconnecting.
                    self.inner.remove_connection(id);
                    return;
                }
                Err(Error::NotOurProtocol) => {
                    warn!(%target, "peer accepted TCP but spoke garbage");
                    tokio::time::sleep(GARBAGE_RETRY_DELAY).await;
                }
                Err(error) => {
                    let score = error.ban_score();
                    if score > 0 {
                        self.inner.punish(id, score);
                    }
                    debug!(%target, %error, "connection lost, scheduling reconnect");
                    step += 1;
                    tokio::time::sleep(reconnect_timeout_for_step(step)).await;
                }
            }
        }
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        direction: Direction,
        endpoint: Option<EndPoint>,
    ) -> ConnectionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::unbounded_channel();
        let address = stream.peer_addr().ok().map(|addr| addr.ip());
        self.register(id, ConnectionHandle { sender }, address, endpoint);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = run_connection(
                stream,
                id,
                direction,
                inner.clone() as Arc<dyn Dispatcher>,
                receiver,
                None,
            )
            .await;
            if let Err(error) = result {
                let score = error.ban_score();
                if score > 0 {
                    inner.punish(id, score);
                }
                debug!(id, %error, "incoming connection ended");
            }
            inner.remove_connection(id);
        });
        id
    }

    fn register(
        &self,
        id: ConnectionId,
        handle: ConnectionHandle,
        address: Option<IpAddr>,
        endpoint: Option<EndPoint>,
    ) {
        self.inner
            .connections
            .lock()
            .expect("connection registry poisoned")
            .insert(
                id,
                Peer {
                    handle,
                    address,
                    endpoint,
                    punishment: 0,
                },
            );
        metrics::gauge!(
            "network.connections",
            self.inner
                .connections
                .lock()
                .expect("connection registry poisoned")
                .len() as _
        );
    }

    /// The login message sent before user traffic on outbound connections,
    /// when a cookie file is configured.
    fn login_message(&self) -> Option<Message> {
        let path = self.inner.config.cookie_file.as_ref()?;
        let metadata = std::fs::metadata(path).ok()?;
        if metadata.len() >= MAX_COOKIE_BYTES {
            warn!(?path, "cookie file too large, not sending login");
            return None;
        }
        let cookie = match std::fs::read(path) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            _ => {
                warn!(?path, "cookie file empty or unreadable");
                return None;
            }
        };
        let body = Message::body_from_items(&[(LOGIN_COOKIE_DATA_TAG, TagValue::Bytes(cookie))]);
        Some(Message::new(LOGIN_SERVICE_ID, LOGIN_MESSAGE_ID, body))
    }

    /// Queue a message on a connection.
    pub fn send(&self, id: ConnectionId, message: Message, priority: Priority) {
        let connections = self
            .inner
            .connections
            .lock()
            .expect("connection registry poisoned");
        if let Some(peer) = connections.get(&id) {
            peer.handle.send(message, priority);
        }
    }

    /// Add to a connection's misbehavior score; at the threshold the peer
    /// is disconnected and its endpoint banned for a day.
    pub fn punish_node(&self, id: ConnectionId, score: u32) {
        self.inner.punish(id, score);
    }

    /// Whether an address is currently banned.
    pub fn is_banned(&self, address: IpAddr) -> bool {
        self.inner.is_banned(address)
    }

    /// The current misbehavior score of a connection, if it is still open.
    pub fn punishment(&self, id: ConnectionId) -> Option<u32> {
        self.inner
            .connections
            .lock()
            .expect("connection registry poisoned")
            .get(&id)
            .map(|peer| peer.punishment)
    }

    /// Run one maintenance sweep immediately.
    pub fn run_maintenance(&self) {
        self.inner.maintenance();
    }

    /// Close every connection and stop accepting work.
    pub fn shutdown(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let connections = self
            .inner
            .connections
            .lock()
            .expect("connection registry poisoned");
        for (_, peer) in connections.iter() {
            peer.handle.close();
        }
    }
}

async fn connect_any(addrs: &[SocketAddr]) -> Option<TcpStream> {
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Some(stream),
            Err(error) => debug!(%addr, %error, "connect attempt failed"),
        }
    }
    None
}
