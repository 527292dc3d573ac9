//! # Async DHT Service
//!
//! [`Dht`] is the public handle. It wraps a [`DhtNode`] in an actor task that
//! owns the UDP socket and multiplexes three event sources:
//!
//! - commands from [`Dht`] handles (cheap to clone, backed by an mpsc channel)
//! - datagrams from the socket
//! - a one second maintenance tick
//!
//! Lookups complete through callbacks inside the node; the actor bridges
//! each one to a `oneshot` so callers simply `.await` the result.
//!
//! ## Upload Limiting
//!
//! Outgoing queries are paced by a token bucket sized from
//! `upload_rate_limit` (bytes per second). Replies to incoming queries are
//! not throttled.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use ed25519_dalek::SigningKey;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::item::{Item, PUBLIC_KEY_LEN};
use crate::msg::{encode_dict, Dict, Value};
use crate::node::{DhtNode, NodeStatus};
use crate::node_id::NodeId;
use crate::protocols::{DatagramSocket, DhtObserver, NullObserver, SocketManager};
use crate::settings::DhtSettings;
use crate::state::DhtState;
use crate::storage::DefaultStorage;
use crate::traversal::{AnnounceFlags, GetPeersResult, SampleResult};

/// How often the node's timers run.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Receive buffer. Larger datagrams are truncated and then rejected by the
/// decoder.
const RECV_BUFFER_SIZE: usize = 2048;

const COMMAND_QUEUE_DEPTH: usize = 100;

// ============================================================================
// Upload quota
// ============================================================================

/// Byte budget refilled continuously at `rate` bytes per second, bursting up
/// to one second's worth.
#[derive(Debug, Clone, Copy)]
struct UploadQuota {
    tokens: f64,
    rate: f64,
    last_update: Instant,
}

impl UploadQuota {
    fn new(bytes_per_sec: usize) -> Self {
        Self {
            tokens: bytes_per_sec as f64,
            rate: bytes_per_sec as f64,
            last_update: Instant::now(),
        }
    }

    fn unlimited(&self) -> bool {
        self.rate <= 0.0
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        self.last_update = now;
    }

    fn has_quota(&mut self) -> bool {
        if self.unlimited() {
            return true;
        }
        self.refill();
        self.tokens > 0.0
    }

    /// Charge a sent packet. The balance may go negative; the debt is paid
    /// off before the next query goes out.
    fn consume(&mut self, bytes: usize) {
        if !self.unlimited() {
            self.tokens -= bytes as f64;
        }
    }
}

/// [`SocketManager`] over a shared datagram socket.
pub struct UdpSender<T: DatagramSocket> {
    socket: Arc<T>,
    quota: UploadQuota,
}

impl<T: DatagramSocket> UdpSender<T> {
    pub fn new(socket: Arc<T>, upload_rate_limit: usize) -> Self {
        Self {
            socket,
            quota: UploadQuota::new(upload_rate_limit),
        }
    }
}

impl<T: DatagramSocket> SocketManager for UdpSender<T> {
    fn has_quota(&mut self) -> bool {
        self.quota.has_quota()
    }

    fn send_packet(&mut self, dest: SocketAddr, msg: &Dict) -> bool {
        let buf = match encode_dict(msg.clone()) {
            Ok(buf) => buf,
            Err(e) => {
                warn!(endpoint = %dest, error = %e, "failed to encode outgoing message");
                return false;
            }
        };
        match self.socket.try_send_to(&buf, dest) {
            Ok(_) => {
                self.quota.consume(buf.len());
                true
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                trace!(endpoint = %dest, "socket buffer full, dropping packet");
                false
            }
            Err(e) => {
                debug!(endpoint = %dest, error = %e, "send failed");
                false
            }
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to a running DHT node.
#[derive(Clone)]
pub struct Dht {
    cmd_tx: mpsc::Sender<Command>,
    local_addr: SocketAddr,
}

enum Command {
    // Lookups
    Bootstrap(Vec<SocketAddr>, oneshot::Sender<Vec<(NodeId, SocketAddr)>>),
    FindNode(NodeId, oneshot::Sender<Vec<(NodeId, SocketAddr)>>),
    GetPeers {
        info_hash: NodeId,
        noseed: bool,
        scrape: bool,
        reply: oneshot::Sender<GetPeersResult>,
    },
    Announce(NodeId, AnnounceFlags, oneshot::Sender<GetPeersResult>),
    SampleInfohashes(NodeId, oneshot::Sender<SampleResult>),
    Ping(SocketAddr, oneshot::Sender<bool>),

    // Items
    GetImmutable(NodeId, oneshot::Sender<Option<Item>>),
    GetMutable {
        public_key: [u8; PUBLIC_KEY_LEN],
        salt: Vec<u8>,
        reply: oneshot::Sender<Option<Item>>,
    },
    PutImmutable(Value, oneshot::Sender<Result<(Item, usize)>>),
    PutMutable {
        key: Box<SigningKey>,
        salt: Vec<u8>,
        value: Value,
        reply: oneshot::Sender<Result<(Item, usize)>>,
    },

    // Routing table
    AddNode(SocketAddr),
    AddRouter(SocketAddr),

    // Introspection
    Status(oneshot::Sender<NodeStatus>),
    SaveState(oneshot::Sender<DhtState>),

    Quit,
}

fn stopped() -> anyhow::Error {
    anyhow!("DHT node has shut down")
}

impl Dht {
    /// Bind a UDP socket on `addr` and start a node on it.
    pub async fn bind(addr: SocketAddr, settings: DhtSettings, state: Option<DhtState>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind DHT socket on {}", addr))?;
        Self::spawn(socket, settings, state, Arc::new(NullObserver))
    }

    /// Start a node on an already bound socket.
    pub fn spawn<T: DatagramSocket>(
        socket: T,
        settings: DhtSettings,
        state: Option<DhtState>,
        observer: Arc<dyn DhtObserver>,
    ) -> Result<Self> {
        let local_addr = socket.local_addr().context("failed to read DHT socket address")?;
        let socket = Arc::new(socket);

        let (external, saved_id) = state
            .as_ref()
            .and_then(|s| s.node_ids.first())
            .map_or((None, None), |(ip, id)| (*ip, Some(*id)));

        let storage = Box::new(DefaultStorage::new(&settings));
        let sender = UdpSender::new(socket.clone(), settings.upload_rate_limit);
        let node = DhtNode::new(
            settings,
            sender,
            storage,
            observer,
            local_addr.is_ipv6(),
            saved_id,
            external,
        );

        info!(
            addr = %local_addr,
            id = hex::encode(&node.id().as_bytes()[..8]),
            "DHT node listening"
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let actor = DhtActor { node, socket, cmd_rx };
        tokio::spawn(actor.run());

        Ok(Self { cmd_tx, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Look up our own ID starting from `endpoints` (and whatever the
    /// routing table already holds). Returns the closest live nodes found.
    pub async fn bootstrap(&self, endpoints: Vec<SocketAddr>) -> Result<Vec<(NodeId, SocketAddr)>> {
        self.request(|tx| Command::Bootstrap(endpoints, tx)).await
    }

    pub async fn find_node(&self, target: NodeId) -> Result<Vec<(NodeId, SocketAddr)>> {
        self.request(|tx| Command::FindNode(target, tx)).await
    }

    pub async fn get_peers(&self, info_hash: NodeId, noseed: bool, scrape: bool) -> Result<GetPeersResult> {
        self.request(|reply| Command::GetPeers { info_hash, noseed, scrape, reply })
            .await
    }

    /// Find peers for `info_hash` and announce ourselves to the closest nodes.
    pub async fn announce(&self, info_hash: NodeId, flags: AnnounceFlags) -> Result<GetPeersResult> {
        self.request(|tx| Command::Announce(info_hash, flags, tx)).await
    }

    pub async fn sample_infohashes(&self, target: NodeId) -> Result<SampleResult> {
        self.request(|tx| Command::SampleInfohashes(target, tx)).await
    }

    /// Returns true if `endpoint` answered.
    pub async fn ping(&self, endpoint: SocketAddr) -> Result<bool> {
        self.request(|tx| Command::Ping(endpoint, tx)).await
    }

    pub async fn get_immutable(&self, target: NodeId) -> Result<Option<Item>> {
        self.request(|tx| Command::GetImmutable(target, tx)).await
    }

    pub async fn get_mutable(&self, public_key: [u8; PUBLIC_KEY_LEN], salt: Vec<u8>) -> Result<Option<Item>> {
        self.request(|reply| Command::GetMutable { public_key, salt, reply })
            .await
    }

    /// Store an immutable item. Returns the item and how many nodes took it.
    pub async fn put_immutable(&self, value: Value) -> Result<(Item, usize)> {
        self.request(|tx| Command::PutImmutable(value, tx)).await?
    }

    /// Store a mutable item, one sequence number past what the network has.
    pub async fn put_mutable(&self, key: SigningKey, salt: Vec<u8>, value: Value) -> Result<(Item, usize)> {
        self.request(|reply| Command::PutMutable { key: Box::new(key), salt, value, reply })
            .await?
    }

    /// Ping `endpoint` and add it to the routing table if it answers.
    pub async fn add_node(&self, endpoint: SocketAddr) -> Result<()> {
        self.cmd_tx
            .send(Command::AddNode(endpoint))
            .await
            .map_err(|_| stopped())
    }

    /// Register a bootstrap router. Routers seed lookups but never enter the
    /// routing table.
    pub async fn add_router(&self, endpoint: SocketAddr) -> Result<()> {
        self.cmd_tx
            .send(Command::AddRouter(endpoint))
            .await
            .map_err(|_| stopped())
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        self.request(Command::Status).await
    }

    pub async fn node_id(&self) -> Result<NodeId> {
        Ok(self.status().await?.id)
    }

    pub async fn save_state(&self) -> Result<DhtState> {
        self.request(Command::SaveState).await
    }

    /// Stop the node. Pending lookups complete with what they have.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Actor
// ============================================================================

struct DhtActor<T: DatagramSocket> {
    node: DhtNode<UdpSender<T>>,
    socket: Arc<T>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl<T: DatagramSocket> DhtActor<T> {
    async fn run(mut self) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Quit) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.node.incoming_packet(from, &buf[..len]),
                        Err(e) => debug!(error = %e, "DHT socket receive failed"),
                    }
                }
                _ = ticker.tick() => self.node.tick(),
            }
        }

        self.node.shutdown();
        info!(id = hex::encode(&self.node.id().as_bytes()[..8]), "DHT node stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Bootstrap(endpoints, reply) => {
                self.node.bootstrap(
                    &endpoints,
                    Some(Box::new(move |nodes| {
                        let _ = reply.send(nodes);
                    })),
                );
            }
            Command::FindNode(target, reply) => {
                self.node.find_node(
                    target,
                    Some(Box::new(move |nodes| {
                        let _ = reply.send(nodes);
                    })),
                );
            }
            Command::GetPeers { info_hash, noseed, scrape, reply } => {
                self.node.get_peers(
                    info_hash,
                    noseed,
                    scrape,
                    Some(Box::new(move |result| {
                        let _ = reply.send(result);
                    })),
                );
            }
            Command::Announce(info_hash, flags, reply) => {
                self.node.announce(
                    info_hash,
                    flags,
                    Some(Box::new(move |result| {
                        let _ = reply.send(result);
                    })),
                );
            }
            Command::SampleInfohashes(target, reply) => {
                self.node.sample_infohashes(
                    target,
                    Box::new(move |result| {
                        let _ = reply.send(result);
                    }),
                );
            }
            Command::Ping(endpoint, reply) => {
                self.node.ping(
                    endpoint,
                    Box::new(move |responses| {
                        let _ = reply.send(responses > 0);
                    }),
                );
            }
            Command::GetImmutable(target, reply) => {
                self.node.get_item(
                    target,
                    Box::new(move |item| {
                        let _ = reply.send(item);
                    }),
                );
            }
            Command::GetMutable { public_key, salt, reply } => {
                self.node.get_mutable_item(
                    public_key,
                    salt,
                    Box::new(move |item| {
                        let _ = reply.send(item);
                    }),
                );
            }
            Command::PutImmutable(value, reply) => {
                // completion is relayed from a second channel so a rejected
                // value can still be reported right away
                let (done_tx, done_rx) = oneshot::channel();
                let started = self.node.put_item(
                    value,
                    Some(Box::new(move |item, count| {
                        let _ = done_tx.send((item, count));
                    })),
                );
                forward_put(started.map(|_| done_rx), reply);
            }
            Command::PutMutable { key, salt, value, reply } => {
                let (done_tx, done_rx) = oneshot::channel();
                let started = self.node.put_mutable_item(
                    *key,
                    salt,
                    value,
                    Some(Box::new(move |item, count| {
                        let _ = done_tx.send((item, count));
                    })),
                );
                forward_put(started.map(|_| done_rx), reply);
            }
            Command::AddNode(endpoint) => self.node.add_node(endpoint),
            Command::AddRouter(endpoint) => self.node.add_router_node(endpoint),
            Command::Status(reply) => {
                let _ = reply.send(self.node.status());
            }
            Command::SaveState(reply) => {
                let _ = reply.send(self.node.save_state());
            }
            Command::Quit => {}
        }
    }
}

/// Relay a put's outcome to the caller without blocking the actor.
fn forward_put(
    started: std::result::Result<oneshot::Receiver<(Item, usize)>, crate::msg::KrpcError>,
    reply: oneshot::Sender<Result<(Item, usize)>>,
) {
    match started {
        Ok(done) => {
            tokio::spawn(async move {
                let outcome = done.await.map_err(|_| stopped());
                let _ = reply.send(outcome);
            });
        }
        Err(e) => {
            let _ = reply.send(Err(e.into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{bytes, DictExt};

    #[tokio::test(start_paused = true)]
    async fn quota_refills_over_time() {
        let mut q = UploadQuota::new(100);
        assert!(q.has_quota());
        q.consume(150);
        assert!(!q.has_quota());

        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(!q.has_quota());
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(q.has_quota());

        // the burst never exceeds one second's worth
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(q.has_quota());
        q.consume(100);
        assert!(!q.has_quota());
    }

    #[tokio::test]
    async fn zero_rate_is_unlimited() {
        let mut q = UploadQuota::new(0);
        q.consume(1_000_000);
        assert!(q.has_quota());
    }

    #[tokio::test]
    async fn sender_encodes_and_charges_quota() {
        let a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut sender = UdpSender::new(a, 5);

        let mut msg = Dict::new();
        msg.set("y", bytes("q"));
        assert!(sender.has_quota());
        assert!(sender.send_packet(b.local_addr().unwrap(), &msg));

        let mut buf = [0u8; 64];
        let (len, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"d1:y1:qe");
        assert!(!sender.has_quota());
    }
}
