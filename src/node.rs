//! # DHT Node Core
//!
//! [`DhtNode`] is the single-threaded heart of the DHT. It owns the routing
//! table, the outstanding query table, the running traversals and the
//! storage, and is driven from outside by three entry points:
//!
//! - [`DhtNode::incoming_packet`] for every datagram received
//! - [`DhtNode::tick`] about once a second
//! - the lookup/store operations (`find_node`, `get_peers`, `put_item`, ...)
//!
//! Nothing here blocks or spawns. Outgoing packets go through the injected
//! [`SocketManager`]; events go to the injected [`DhtObserver`].
//!
//! ## Incoming Queries
//!
//! | Method | Required args | Reply |
//! |--------|---------------|-------|
//! | `ping` | `id` | `id` |
//! | `find_node` | `target` | `nodes` / `nodes6` |
//! | `get_peers` | `info_hash` | `token`, `nodes`, `values` or `BFsd`/`BFpe` |
//! | `announce_peer` | `info_hash`, `port`, `token` | `id` |
//! | `get` | `target` | `token`, `nodes`, item fields |
//! | `put` | `token`, `v` | `id` |
//! | `sample_infohashes` | `target` | `interval`, `num`, `samples`, `nodes` |
//!
//! Every reply and error carries `ip`, the requester's endpoint as we see it.
//!
//! ## Security
//!
//! - Per-IP rate limiting through [`DosBlocker`] before anything is decoded
//! - Optional BEP 42 enforcement on node IDs of requesters and responders
//! - Write tokens bind `announce_peer` and `put` to a recent `get_peers`/`get`

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use sha1::{Digest, Sha1};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::dos_blocker::DosBlocker;
use crate::ip_voter::ExternalIpVoter;
use crate::item::{
    item_target_id, mutable_target_id, verify_mutable_item, Item, ITEM_MAX_SIZE, PUBLIC_KEY_LEN, SALT_MAX_SIZE,
    SIGNATURE_LEN,
};
use crate::msg::{
    bytes, compact_endpoint, encode, error_reply, read_endpoint, read_nodes, verify_message, write_node, Dict, DictExt, ErrorCode,
    KeyDesc, KeyType, KrpcError, Message, MessageKind, Value, OPTIONAL,
};
use crate::node_entry::RTT_UNKNOWN;
use crate::node_id::{
    distance_exp, generate_id, generate_prefix_mask, generate_random_id, verify_id, NodeId, ID_BITS, ID_LEN,
};
use crate::protocols::{DhtObserver, SocketManager};
use crate::routing_table::RoutingTable;
use crate::rpc_manager::{OutstandingQuery, RpcManager};
use crate::settings::DhtSettings;
use crate::state::DhtState;
use crate::storage::{DhtStorage, StorageCounters};
use crate::traversal::{
    AnnounceFlags, CountCallback, DirectRequest, Followup, ItemCallback, MutableLookup, NodesCallback,
    PeersCallback, PendingPut, PutCallback, SampleCallback, Traversal, TraversalContext, TraversalId, TraversalKind,
    INITIAL,
};

// ============================================================================
// Timing
// ============================================================================

/// How often the write-token secret rotates. A token stays valid for up to
/// two periods.
pub const KEY_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How often storage expires peers and items.
pub const STORAGE_TICK_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// How often the stalest routing-table entry is pinged.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum spacing of lookups on our own ID while the table is shallow.
const SELF_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Tables shallower than this get periodic lookups on our own ID.
const SELF_REFRESH_DEPTH: usize = 4;

const TOKEN_LEN: usize = 4;

// ============================================================================
// Query schemas
// ============================================================================

const TOP_LEVEL: [KeyDesc; 2] = [
    KeyDesc::new("q", KeyType::Bytes, 0, 0),
    KeyDesc::new("a", KeyType::Dict, 0, 0),
];

const ID_KEY: [KeyDesc; 1] = [KeyDesc::new("id", KeyType::Bytes, ID_LEN, 0)];

const TARGET_KEY: [KeyDesc; 1] = [KeyDesc::new("target", KeyType::Bytes, ID_LEN, 0)];

const GET_PEERS_KEYS: [KeyDesc; 3] = [
    KeyDesc::new("info_hash", KeyType::Bytes, ID_LEN, 0),
    KeyDesc::new("noseed", KeyType::Int, 0, OPTIONAL),
    KeyDesc::new("scrape", KeyType::Int, 0, OPTIONAL),
];

const ANNOUNCE_KEYS: [KeyDesc; 6] = [
    KeyDesc::new("info_hash", KeyType::Bytes, ID_LEN, 0),
    KeyDesc::new("port", KeyType::Int, 0, 0),
    KeyDesc::new("token", KeyType::Bytes, 0, 0),
    KeyDesc::new("n", KeyType::Bytes, 0, OPTIONAL),
    KeyDesc::new("seed", KeyType::Int, 0, OPTIONAL),
    KeyDesc::new("implied_port", KeyType::Int, 0, OPTIONAL),
];

const GET_KEYS: [KeyDesc; 2] = [
    KeyDesc::new("target", KeyType::Bytes, ID_LEN, 0),
    KeyDesc::new("seq", KeyType::Int, 0, OPTIONAL),
];

const PUT_KEYS: [KeyDesc; 6] = [
    KeyDesc::new("token", KeyType::Bytes, 0, 0),
    KeyDesc::new("seq", KeyType::Int, 0, OPTIONAL),
    KeyDesc::new("k", KeyType::Bytes, PUBLIC_KEY_LEN, OPTIONAL),
    KeyDesc::new("sig", KeyType::Bytes, SIGNATURE_LEN, OPTIONAL),
    KeyDesc::new("cas", KeyType::Int, 0, OPTIONAL),
    KeyDesc::new("salt", KeyType::Bytes, 0, OPTIONAL),
];

/// Snapshot of node health.
#[derive(Debug, Clone, Default)]
pub struct NodeStatus {
    pub id: NodeId,
    pub live_nodes: usize,
    pub replacement_nodes: usize,
    pub confirmed_nodes: usize,
    pub buckets: usize,
    pub estimated_global_nodes: u64,
    pub outstanding_queries: usize,
    pub running_traversals: usize,
    pub external_address: Option<IpAddr>,
    pub storage: StorageCounters,
}

pub struct DhtNode<S: SocketManager> {
    settings: DhtSettings,
    id: NodeId,
    v6: bool,
    table: RoutingTable,
    rpc: RpcManager,
    traversals: HashMap<TraversalId, Traversal>,
    next_traversal: TraversalId,
    storage: Box<dyn DhtStorage>,
    observer: Arc<dyn DhtObserver>,
    socket: S,
    blocker: DosBlocker,
    voter: ExternalIpVoter,
    secrets: [u32; 2],
    last_key_rotation: Instant,
    last_storage_tick: Instant,
    last_refresh: Instant,
    last_self_refresh: Option<Instant>,
}

impl<S: SocketManager> DhtNode<S> {
    /// Create a node. `saved_id` is reused when it still verifies against
    /// `external_address`; otherwise a fresh ID is generated.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: DhtSettings,
        socket: S,
        mut storage: Box<dyn DhtStorage>,
        observer: Arc<dyn DhtObserver>,
        v6: bool,
        saved_id: Option<NodeId>,
        external_address: Option<IpAddr>,
    ) -> Self {
        let id = match (saved_id, external_address) {
            (Some(id), Some(ext)) if verify_id(&id, &ext) => id,
            (Some(id), None) if !id.is_all_zeros() => id,
            (_, Some(ext)) => generate_id(&ext),
            (_, None) => generate_random_id(),
        };
        storage.update_node_ids(vec![id]);
        let now = Instant::now();

        info!(id = hex::encode(&id.as_bytes()[..8]), v6, read_only = settings.read_only, "DHT node created");

        Self {
            table: RoutingTable::new(id, &settings),
            rpc: RpcManager::new(id, &settings),
            blocker: DosBlocker::new(settings.dos_blocker_size, settings.block_ratelimit, settings.block_timeout),
            settings,
            id,
            v6,
            traversals: HashMap::new(),
            next_traversal: 1,
            storage,
            observer,
            socket,
            voter: ExternalIpVoter::new(),
            secrets: [rand::random(), rand::random()],
            last_key_rotation: now,
            last_storage_tick: now,
            last_refresh: now,
            last_self_refresh: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn settings(&self) -> &DhtSettings {
        &self.settings
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn storage(&self) -> &dyn DhtStorage {
        self.storage.as_ref()
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    pub fn num_traversals(&self) -> usize {
        self.traversals.len()
    }

    pub fn external_address(&self) -> Option<IpAddr> {
        self.voter.external_address()
    }

    // ------------------------------------------------------------------------
    // Packet intake
    // ------------------------------------------------------------------------

    /// Handle one datagram from `from`.
    pub fn incoming_packet(&mut self, from: SocketAddr, buf: &[u8]) {
        if !self.blocker.allow(from.ip(), Instant::now()) {
            return;
        }
        match Message::decode(from, buf) {
            Ok(msg) => self.incoming_message(msg),
            Err(e) => trace!(endpoint = %from, error = %e, "dropping undecodable packet"),
        }
    }

    /// Handle a decoded message.
    pub fn incoming_message(&mut self, msg: Message) {
        match msg.kind() {
            Some(MessageKind::Query) => self.incoming_request(&msg),
            Some(MessageKind::Response) | Some(MessageKind::Error) => self.incoming_reply(&msg),
            None => {
                if self.settings.read_only {
                    return;
                }
                let t = msg.transaction_id().unwrap_or_default().to_vec();
                let mut reply = error_reply(&t, &KrpcError::protocol("missing 'y' entry"));
                reply.set("ip", bytes(compact_endpoint(&msg.addr)));
                self.socket.send_packet(msg.addr, &reply);
            }
        }
    }

    fn incoming_request(&mut self, msg: &Message) {
        if self.settings.read_only {
            return;
        }
        let t = msg.transaction_id().unwrap_or_default().to_vec();
        let mut reply = match self.handle_query(msg) {
            Ok(r) => {
                let mut d = Dict::new();
                d.set("y", bytes("r"));
                d.set("t", bytes(t));
                d.set("r", Value::Dict(r));
                d
            }
            Err(e) => {
                trace!(endpoint = %msg.addr, error = %e, "rejecting query");
                error_reply(&t, &e)
            }
        };
        reply.set("ip", bytes(compact_endpoint(&msg.addr)));
        self.socket.send_packet(msg.addr, &reply);
    }

    fn handle_query(&mut self, msg: &Message) -> Result<Dict, KrpcError> {
        let [q, a] = verify_message(&msg.dict, &TOP_LEVEL).map_err(KrpcError::protocol)?;
        let (Some(Value::Bytes(method)), Some(Value::Dict(args))) = (q, a) else {
            return Err(KrpcError::protocol("missing 'q' key"));
        };
        let [id] = verify_message(args, &ID_KEY).map_err(KrpcError::protocol)?;
        let id = id
            .and_then(|v| match v {
                Value::Bytes(b) => NodeId::from_slice(b),
                _ => None,
            })
            .ok_or_else(|| KrpcError::protocol("missing 'id' key"))?;

        let addr = msg.addr;
        if self.settings.enforce_node_id && !verify_id(&id, &addr.ip()) {
            return Err(KrpcError::protocol("invalid node ID"));
        }
        let read_only = msg.read_only();
        if !read_only {
            self.table.heard_about(&id, addr);
        }

        let mut r = Dict::new();
        r.set("id", bytes(self.id.as_bytes().to_vec()));

        match method.as_slice() {
            b"ping" => {}
            b"find_node" => {
                let target = required_id(args, &TARGET_KEY)?;
                self.write_nodes(&mut r, &target, args);
            }
            b"get_peers" => self.handle_get_peers(&mut r, addr, args)?,
            b"announce_peer" => self.handle_announce(addr, id, read_only, args)?,
            b"get" => self.handle_get(&mut r, addr, args)?,
            b"put" => self.handle_put(addr, id, read_only, args)?,
            b"sample_infohashes" => {
                let target = required_id(args, &TARGET_KEY)?;
                self.write_nodes(&mut r, &target, args);
                let sample = self.storage.get_infohashes_sample();
                let mut samples = Vec::with_capacity(sample.samples.len() * ID_LEN);
                for ih in &sample.samples {
                    samples.extend_from_slice(ih.as_bytes());
                }
                r.set("interval", Value::Int(sample.interval.as_secs() as i64));
                r.set("num", Value::Int(sample.num as i64));
                r.set("samples", bytes(samples));
            }
            other => {
                if let Some(custom) = self.observer.on_dht_request(other, addr, args) {
                    for (k, v) in custom {
                        if k != b"id" {
                            r.insert(k, v);
                        }
                    }
                    return Ok(r);
                }
                // unknown methods naming a target are answered as find_node
                let target = args
                    .get_id("target")
                    .or_else(|| args.get_id("info_hash"))
                    .ok_or_else(|| KrpcError::new(ErrorCode::MethodUnknown, "unknown message"))?;
                self.write_nodes(&mut r, &target, args);
            }
        }
        Ok(r)
    }

    /// Add the nodes closest to `target` in our address family, unless the
    /// requester's `want` list excludes it.
    fn write_nodes(&self, r: &mut Dict, target: &NodeId, args: &Dict) {
        let family = if self.v6 { &b"n6"[..] } else { &b"n4"[..] };
        if let Some(want) = args.get_list("want") {
            let wanted = want.iter().any(|w| matches!(w, Value::Bytes(b) if b.as_slice() == family));
            if !wanted {
                return;
            }
        }
        let mut nodes = Vec::new();
        for n in self.table.find_node(target, false, 0) {
            write_node(&n.id, &n.endpoint, &mut nodes);
        }
        r.set(if self.v6 { "nodes6" } else { "nodes" }, bytes(nodes));
    }

    fn handle_get_peers(&mut self, r: &mut Dict, addr: SocketAddr, args: &Dict) -> Result<(), KrpcError> {
        let [ih, noseed, scrape] = verify_message(args, &GET_PEERS_KEYS).map_err(KrpcError::protocol)?;
        let info_hash = value_id(ih).ok_or_else(|| KrpcError::protocol("missing 'info_hash' key"))?;
        let noseed = value_int(noseed).is_some_and(|v| v != 0);
        let scrape = value_int(scrape).is_some_and(|v| v != 0);

        self.observer.get_peers(&info_hash);
        r.set("token", bytes(self.generate_token(&addr.ip(), &info_hash)));
        self.write_nodes(r, &info_hash, args);

        if let Some(peers) = self.storage.get_peers(&info_hash, noseed, scrape) {
            if let Some(name) = peers.name {
                r.set("n", bytes(name));
            }
            if let (Some(seeds), Some(downloaders)) = (peers.seeds_filter, peers.downloaders_filter) {
                r.set("BFsd", bytes(seeds));
                r.set("BFpe", bytes(downloaders));
            } else if !peers.peers.is_empty() {
                let values = peers.peers.iter().map(|p| bytes(compact_endpoint(p))).collect();
                r.set("values", Value::List(values));
            }
        }
        Ok(())
    }

    fn handle_announce(&mut self, addr: SocketAddr, id: NodeId, read_only: bool, args: &Dict) -> Result<(), KrpcError> {
        let [ih, port, token, name, seed, implied_port] =
            verify_message(args, &ANNOUNCE_KEYS).map_err(KrpcError::protocol)?;
        let info_hash = value_id(ih).ok_or_else(|| KrpcError::protocol("missing 'info_hash' key"))?;

        let port = if value_int(implied_port).is_some_and(|v| v != 0) {
            i64::from(addr.port())
        } else {
            value_int(port).unwrap_or(-1)
        };
        let port = u16::try_from(port).map_err(|_| KrpcError::protocol("invalid port"))?;

        let token = value_bytes(token).unwrap_or_default();
        if !self.verify_token(token, &info_hash, &addr.ip()) {
            return Err(KrpcError::protocol("invalid token"));
        }

        self.observer.announce(&info_hash, addr.ip(), port);
        // a valid token proves the address is not spoofed
        if !read_only {
            self.table.node_seen(&id, addr, RTT_UNKNOWN);
        }
        let seed = value_int(seed).is_some_and(|v| v != 0);
        let name = value_bytes(name).unwrap_or_default();
        self.storage
            .announce_peer(&info_hash, SocketAddr::new(addr.ip(), port), name, seed);
        Ok(())
    }

    fn handle_get(&mut self, r: &mut Dict, addr: SocketAddr, args: &Dict) -> Result<(), KrpcError> {
        let [target, seq] = verify_message(args, &GET_KEYS).map_err(KrpcError::protocol)?;
        let target = value_id(target).ok_or_else(|| KrpcError::protocol("missing 'target' key"))?;

        r.set("token", bytes(self.generate_token(&addr.ip(), &target)));
        self.write_nodes(r, &target, args);

        let mutable = match value_int(seq) {
            Some(seq) => self.storage.get_mutable_item(&target, seq, false),
            None => {
                if let Some(v) = self.storage.get_immutable_item(&target) {
                    r.set("v", v);
                    return Ok(());
                }
                self.storage.get_mutable_item(&target, -1, true)
            }
        };
        if let Some(m) = mutable {
            r.set("seq", Value::Int(m.seq));
            if let (Some(v), Some(sig), Some(k)) = (m.value, m.signature, m.public_key) {
                r.set("v", v);
                r.set("sig", bytes(sig.to_vec()));
                r.set("k", bytes(k.to_vec()));
            }
        }
        Ok(())
    }

    fn handle_put(&mut self, addr: SocketAddr, id: NodeId, read_only: bool, args: &Dict) -> Result<(), KrpcError> {
        let [token, seq, k, sig, cas, salt] = verify_message(args, &PUT_KEYS).map_err(KrpcError::protocol)?;
        let v = args
            .get_value("v")
            .ok_or_else(|| KrpcError::protocol("missing 'v' key"))?;

        let encoded = encode(v)?;
        if encoded.len() > ITEM_MAX_SIZE {
            return Err(KrpcError::new(ErrorCode::MessageTooBig, "message too big"));
        }
        let salt = value_bytes(salt).unwrap_or_default();
        if salt.len() > SALT_MAX_SIZE {
            return Err(KrpcError::new(ErrorCode::SaltTooBig, "salt too big"));
        }

        let seq = value_int(seq);
        let k = value_bytes(k).and_then(|b| <[u8; PUBLIC_KEY_LEN]>::try_from(b).ok());
        let sig = value_bytes(sig).and_then(|b| <[u8; SIGNATURE_LEN]>::try_from(b).ok());
        let token = value_bytes(token).unwrap_or_default();

        match (seq, k, sig) {
            (None, None, None) => {
                let target = item_target_id(&encoded);
                if !self.verify_token(token, &target, &addr.ip()) {
                    return Err(KrpcError::protocol("invalid token"));
                }
                self.storage.put_immutable_item(&target, v.clone(), addr.ip());
            }
            (Some(seq), Some(k), Some(sig)) => {
                let target = mutable_target_id(&k, salt);
                if !self.verify_token(token, &target, &addr.ip()) {
                    return Err(KrpcError::protocol("invalid token"));
                }
                if !verify_mutable_item(&encoded, salt, seq, &k, &sig) {
                    return Err(KrpcError::new(ErrorCode::InvalidSignature, "invalid signature"));
                }
                if let Some(stored) = self.storage.get_mutable_item_seq(&target) {
                    if value_int(cas).is_some_and(|cas| cas != stored) {
                        return Err(KrpcError::new(ErrorCode::CasMismatch, "CAS mismatch"));
                    }
                    if stored > seq {
                        return Err(KrpcError::new(
                            ErrorCode::SeqLessThanCurrent,
                            "sequence number less than current",
                        ));
                    }
                }
                self.storage
                    .put_mutable_item(&target, v.clone(), sig, seq, k, salt, addr.ip());
            }
            _ => return Err(KrpcError::protocol("missing required key")),
        }

        if !read_only {
            self.table.node_seen(&id, addr, RTT_UNKNOWN);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Write tokens
    // ------------------------------------------------------------------------

    fn token_with(secret: u32, addr: &IpAddr, target: &NodeId) -> [u8; TOKEN_LEN] {
        let mut h = Sha1::new();
        match addr {
            IpAddr::V4(v4) => h.update(v4.octets()),
            IpAddr::V6(v6) => h.update(v6.octets()),
        }
        h.update(secret.to_be_bytes());
        h.update(target.as_bytes());
        let digest = h.finalize();
        let mut token = [0u8; TOKEN_LEN];
        token.copy_from_slice(&digest[..TOKEN_LEN]);
        token
    }

    pub fn generate_token(&self, addr: &IpAddr, target: &NodeId) -> Vec<u8> {
        Self::token_with(self.secrets[0], addr, target).to_vec()
    }

    pub fn verify_token(&self, token: &[u8], target: &NodeId, addr: &IpAddr) -> bool {
        token.len() == TOKEN_LEN
            && self
                .secrets
                .iter()
                .any(|s| Self::token_with(*s, addr, target) == token)
    }

    fn rotate_write_key(&mut self) {
        self.secrets[1] = self.secrets[0];
        self.secrets[0] = rand::random();
    }

    // ------------------------------------------------------------------------
    // Replies
    // ------------------------------------------------------------------------

    fn incoming_reply(&mut self, msg: &Message) {
        let Some((query, rtt)) = self.rpc.incoming(msg, Instant::now()) else {
            return;
        };

        if msg.kind() == Some(MessageKind::Error) {
            if let Some(e) = msg.error() {
                debug!(endpoint = %msg.addr, method = query.method, code = e.code.code(), message = %e.message, "error reply");
            }
            // the node is alive, so its table entry is left alone
            self.fail_traversal_query(query.traversal, query.endpoint, false);
            return;
        }

        let Some(r) = msg.response() else {
            trace!(endpoint = %msg.addr, "reply without 'r'");
            self.query_failed(query);
            return;
        };
        let Some(id) = r.get_id("id") else {
            trace!(endpoint = %msg.addr, "reply without a valid 'id'");
            self.query_failed(query);
            return;
        };
        if self.settings.enforce_node_id && !verify_id(&id, &msg.addr.ip()) {
            trace!(endpoint = %msg.addr, "reply from node with invalid id");
            self.query_failed(query);
            return;
        }

        if let Some(ext) = msg.dict.get_bytes("ip").and_then(read_endpoint) {
            self.set_external_address(ext.ip(), msg.addr.ip());
        }

        let rtt_ms = u16::try_from(rtt.as_millis()).unwrap_or(RTT_UNKNOWN - 1).min(RTT_UNKNOWN - 1);
        self.table.node_seen(&id, msg.addr, rtt_ms);

        match query.traversal {
            Some(tid) => {
                let Some(t) = self.traversals.get_mut(&tid) else {
                    return;
                };
                let mut ctx = TraversalContext {
                    rpc: &mut self.rpc,
                    socket: &mut self.socket,
                    settings: &self.settings,
                    our_id: self.id,
                };
                if t.on_reply(&mut ctx, query.endpoint, id, r) {
                    self.complete(tid);
                }
            }
            None => {
                // refresh pings: learn whatever the node told us about
                let key = if self.v6 { "nodes6" } else { "nodes" };
                if let Some(nodes) = r.get_bytes(key) {
                    for (nid, ep) in read_nodes(nodes, self.v6) {
                        if nid != self.id {
                            self.table.heard_about(&nid, ep);
                        }
                    }
                }
            }
        }
    }

    /// A query timed out or got a malformed reply.
    fn query_failed(&mut self, query: OutstandingQuery) {
        if let Some(id) = query.node_id {
            self.table.node_failed(&id, &query.endpoint);
        }
        self.fail_traversal_query(query.traversal, query.endpoint, false);
    }

    fn fail_traversal_query(&mut self, traversal: Option<TraversalId>, endpoint: SocketAddr, short: bool) {
        let Some(tid) = traversal else {
            return;
        };
        let Some(t) = self.traversals.get_mut(&tid) else {
            return;
        };
        let mut ctx = TraversalContext {
            rpc: &mut self.rpc,
            socket: &mut self.socket,
            settings: &self.settings,
            our_id: self.id,
        };
        if t.on_failure(&mut ctx, endpoint, short) {
            self.complete(tid);
        }
    }

    /// `endpoint` reported unreachable; fail everything in flight to it.
    pub fn unreachable(&mut self, endpoint: &SocketAddr) {
        for q in self.rpc.unreachable(endpoint) {
            self.query_failed(q);
        }
    }

    // ------------------------------------------------------------------------
    // External address
    // ------------------------------------------------------------------------

    /// `source` says our address is `addr`.
    pub fn set_external_address(&mut self, addr: IpAddr, source: IpAddr) {
        self.observer.set_external_address(addr, source);
        if !self.voter.cast_vote(addr, source) {
            return;
        }
        info!(address = %addr, "external address changed");
        self.observer.external_address_changed(addr);
        if !verify_id(&self.id, &addr) {
            self.update_node_id(generate_id(&addr));
        }
    }

    /// Switch to a new node ID and re-seat the routing table under it.
    pub fn update_node_id(&mut self, id: NodeId) {
        if id == self.id {
            return;
        }
        info!(
            old = hex::encode(&self.id.as_bytes()[..8]),
            new = hex::encode(&id.as_bytes()[..8]),
            "node id changed"
        );
        self.id = id;
        self.table.update_node_id(id);
        self.rpc.set_our_id(id);
        self.storage.update_node_ids(vec![id]);
        self.observer.node_id_changed(id);
        self.find_node(id, None);
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Drive timeouts and periodic work. Call about once a second.
    pub fn tick(&mut self) {
        let now = Instant::now();
        let timeouts = self.rpc.tick(now);
        for q in timeouts.short {
            self.fail_traversal_query(q.traversal, q.endpoint, true);
        }
        for q in timeouts.full {
            self.query_failed(q);
        }

        if now.saturating_duration_since(self.last_key_rotation) >= KEY_ROTATION_INTERVAL {
            self.last_key_rotation = now;
            self.rotate_write_key();
        }
        if now.saturating_duration_since(self.last_storage_tick) >= STORAGE_TICK_INTERVAL {
            self.last_storage_tick = now;
            self.storage.tick();
        }
        if now.saturating_duration_since(self.last_refresh) >= REFRESH_INTERVAL {
            self.last_refresh = now;
            self.refresh_tick(now);
        }
    }

    fn refresh_tick(&mut self, now: Instant) {
        let due = self
            .last_self_refresh
            .map_or(true, |t| now.saturating_duration_since(t) >= SELF_REFRESH_INTERVAL);
        if due && self.table.depth() < SELF_REFRESH_DEPTH && self.table.size().live > 0 {
            self.last_self_refresh = Some(now);
            self.find_node(self.id, None);
            return;
        }

        let Some(ne) = self.table.next_refresh() else {
            return;
        };
        if ne.id == self.id {
            return;
        }
        // a random target inside the node's bucket, to learn its neighbours
        let bucket = (ID_BITS as i32 - 1 - distance_exp(&self.id, &ne.id)).max(0) as usize;
        let mask = generate_prefix_mask((bucket + 1).min(ID_BITS));
        let random = generate_random_id();
        let mut raw = [0u8; ID_LEN];
        for (i, b) in raw.iter_mut().enumerate() {
            let m = mask.as_bytes()[i];
            *b = (random.as_bytes()[i] & !m) | (self.id.as_bytes()[i] & m);
        }
        let target = NodeId::from_bytes(raw);

        let mut a = Dict::new();
        a.set("target", bytes(target.as_bytes().to_vec()));
        let mut q = Dict::new();
        q.set("q", bytes("find_node"));
        q.set("a", Value::Dict(a));
        trace!(endpoint = %ne.endpoint, bucket, "refreshing node");
        self.rpc.invoke(
            q,
            ne.endpoint,
            OutstandingQuery::new(None, ne.endpoint, Some(ne.id), "find_node"),
            &mut self.socket,
        );
    }

    /// Ping `endpoint`; if it answers it is added to the routing table.
    pub fn add_node(&mut self, endpoint: SocketAddr) {
        let mut q = Dict::new();
        q.set("q", bytes("ping"));
        q.set("a", Value::Dict(Dict::new()));
        self.rpc
            .invoke(q, endpoint, OutstandingQuery::new(None, endpoint, None, "ping"), &mut self.socket);
    }

    pub fn add_router_node(&mut self, endpoint: SocketAddr) {
        debug!(endpoint = %endpoint, "adding router node");
        self.table.add_router_node(endpoint);
    }

    // ------------------------------------------------------------------------
    // Traversals
    // ------------------------------------------------------------------------

    fn new_traversal(&mut self, target: NodeId, kind: TraversalKind) -> Traversal {
        let tid = self.next_traversal;
        self.next_traversal += 1;
        Traversal::new(tid, target, kind, &self.settings, self.v6)
    }

    /// Seed from the routing table, falling back to router nodes.
    fn seed(&self, t: &mut Traversal) {
        for n in self.table.find_node(&t.target(), false, 0) {
            t.add_entry(Some(n.id), n.endpoint, INITIAL, &self.settings);
        }
        if t.results().is_empty() {
            for r in self.table.router_nodes() {
                t.add_entry(None, *r, INITIAL, &self.settings);
            }
        }
    }

    fn run(&mut self, t: Traversal) -> TraversalId {
        let tid = t.id();
        self.traversals.insert(tid, t);
        let done = match self.traversals.get_mut(&tid) {
            Some(t) => {
                let mut ctx = TraversalContext {
                    rpc: &mut self.rpc,
                    socket: &mut self.socket,
                    settings: &self.settings,
                    our_id: self.id,
                };
                t.start(&mut ctx)
            }
            None => false,
        };
        if done {
            self.complete(tid);
        }
        tid
    }

    fn complete(&mut self, tid: TraversalId) {
        let Some(t) = self.traversals.remove(&tid) else {
            return;
        };
        let followup = t.finish(self.settings.bucket_size);
        self.run_followup(followup);
    }

    fn run_followup(&mut self, followup: Followup) {
        match followup {
            Followup::None => {}
            Followup::Ping(endpoints) => {
                for ep in endpoints {
                    self.add_node(ep);
                }
            }
            Followup::Store { target, request, targets, on_done } => {
                debug!(
                    method = request.method(),
                    target = hex::encode(&target.as_bytes()[..8]),
                    nodes = targets.len(),
                    "storing on closest nodes"
                );
                let branch = targets.len();
                let mut t = self.new_traversal(target, TraversalKind::Direct { request, on_done });
                for (id, ep, token) in targets {
                    t.add_store_target(id, ep, token);
                }
                t.set_branch_factor(branch);
                self.run(t);
            }
        }
    }

    /// Cancel a running traversal. Its callback fires with what it has.
    pub fn abort(&mut self, tid: TraversalId) {
        self.rpc.cancel_traversal(tid);
        if let Some(t) = self.traversals.remove(&tid) {
            debug!(kind = t.kind().name(), "traversal aborted");
            t.finish(self.settings.bucket_size).abandon();
        }
    }

    /// Abort everything in flight.
    pub fn shutdown(&mut self) {
        let running: Vec<TraversalId> = self.traversals.keys().copied().collect();
        for tid in running {
            self.abort(tid);
        }
        self.rpc.clear();
    }

    /// Look up our own ID starting from `endpoints`, then ping whatever we
    /// heard of but never queried.
    pub fn bootstrap(&mut self, endpoints: &[SocketAddr], on_done: Option<NodesCallback>) -> TraversalId {
        let mut t = self.new_traversal(self.id, TraversalKind::Bootstrap { on_done });
        for n in self.table.find_node(&self.id, false, 0) {
            t.add_entry(Some(n.id), n.endpoint, INITIAL, &self.settings);
        }
        for ep in endpoints {
            t.add_entry(None, *ep, INITIAL, &self.settings);
        }
        if t.results().is_empty() {
            for r in self.table.router_nodes() {
                t.add_entry(None, *r, INITIAL, &self.settings);
            }
        }
        info!(seeds = t.results().len(), "bootstrapping");
        self.run(t)
    }

    pub fn find_node(&mut self, target: NodeId, on_done: Option<NodesCallback>) -> TraversalId {
        let mut t = self.new_traversal(target, TraversalKind::find_node(on_done));
        self.seed(&mut t);
        self.run(t)
    }

    pub fn get_peers(
        &mut self,
        info_hash: NodeId,
        noseed: bool,
        scrape: bool,
        on_done: Option<PeersCallback>,
    ) -> TraversalId {
        let mut t = self.new_traversal(info_hash, TraversalKind::get_peers(noseed, scrape, None, on_done));
        self.seed(&mut t);
        self.run(t)
    }

    /// Find peers for `info_hash`, then announce ourselves to the closest
    /// nodes that handed out a token.
    pub fn announce(&mut self, info_hash: NodeId, flags: AnnounceFlags, on_done: Option<PeersCallback>) -> TraversalId {
        let noseed = flags.seed;
        let mut t = self.new_traversal(info_hash, TraversalKind::get_peers(noseed, false, Some(flags), on_done));
        self.seed(&mut t);
        self.run(t)
    }

    pub fn get_item(&mut self, target: NodeId, on_done: ItemCallback) -> TraversalId {
        let mut t = self.new_traversal(target, TraversalKind::get_item(None, Some(on_done), None));
        self.seed(&mut t);
        self.run(t)
    }

    pub fn get_mutable_item(
        &mut self,
        public_key: [u8; PUBLIC_KEY_LEN],
        salt: Vec<u8>,
        on_done: ItemCallback,
    ) -> TraversalId {
        let target = mutable_target_id(&public_key, &salt);
        let lookup = MutableLookup { public_key, salt };
        let mut t = self.new_traversal(target, TraversalKind::get_item(Some(lookup), Some(on_done), None));
        self.seed(&mut t);
        self.run(t)
    }

    /// Store an immutable item. Returns its target.
    pub fn put_item(&mut self, value: Value, on_done: Option<PutCallback>) -> Result<NodeId, KrpcError> {
        let item = Item::immutable(value)?;
        if item.encoded_value().len() > ITEM_MAX_SIZE {
            return Err(KrpcError::new(ErrorCode::MessageTooBig, "message too big"));
        }
        let target = item.target();
        let put = PendingPut::Immutable { item, on_done };
        let mut t = self.new_traversal(target, TraversalKind::get_item(None, None, Some(put)));
        self.seed(&mut t);
        self.run(t);
        Ok(target)
    }

    /// Store a mutable item under `key` and `salt`. The sequence number is
    /// one past the highest version found on the network.
    pub fn put_mutable_item(
        &mut self,
        key: SigningKey,
        salt: Vec<u8>,
        value: Value,
        on_done: Option<PutCallback>,
    ) -> Result<NodeId, KrpcError> {
        if salt.len() > SALT_MAX_SIZE {
            return Err(KrpcError::new(ErrorCode::SaltTooBig, "salt too big"));
        }
        let provisional = Item::mutable(value, salt.clone(), 0, &key)?;
        if provisional.encoded_value().len() > ITEM_MAX_SIZE {
            return Err(KrpcError::new(ErrorCode::MessageTooBig, "message too big"));
        }
        let target = provisional.target();
        let lookup = MutableLookup { public_key: key.verifying_key().to_bytes(), salt };
        let put = PendingPut::Mutable { key, provisional, on_done };
        let mut t = self.new_traversal(target, TraversalKind::get_item(Some(lookup), None, Some(put)));
        self.seed(&mut t);
        self.run(t);
        Ok(target)
    }

    /// Collect BEP 51 info-hash samples from nodes around `target`.
    pub fn sample_infohashes(&mut self, target: NodeId, on_done: SampleCallback) -> TraversalId {
        let mut t = self.new_traversal(target, TraversalKind::sample_infohashes(Some(on_done)));
        self.seed(&mut t);
        self.run(t)
    }

    /// Ping one endpoint. The callback gets 1 if it answered, 0 otherwise.
    pub fn ping(&mut self, endpoint: SocketAddr, on_done: CountCallback) -> TraversalId {
        let mut t = self.new_traversal(
            generate_random_id(),
            TraversalKind::Direct { request: DirectRequest::Ping, on_done: Some(on_done) },
        );
        t.add_entry(None, endpoint, INITIAL, &self.settings);
        self.run(t)
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn status(&self) -> NodeStatus {
        let size = self.table.size();
        NodeStatus {
            id: self.id,
            live_nodes: size.live,
            replacement_nodes: size.replacements,
            confirmed_nodes: size.confirmed,
            buckets: self.table.num_buckets(),
            estimated_global_nodes: self.table.num_global_nodes(),
            outstanding_queries: self.rpc.num_outstanding(),
            running_traversals: self.traversals.len(),
            external_address: self.voter.external_address(),
            storage: self.storage.counters(),
        }
    }

    /// Our ID plus every endpoint in the table, for the next start.
    pub fn save_state(&self) -> DhtState {
        let mut state = DhtState {
            node_ids: vec![(self.voter.external_address(), self.id)],
            ..DhtState::default()
        };
        for n in self.table.live_nodes().chain(self.table.replacement_nodes()) {
            if n.endpoint.is_ipv6() {
                state.nodes6.push(n.endpoint);
            } else {
                state.nodes.push(n.endpoint);
            }
        }
        state
    }
}

// ============================================================================
// Argument helpers
// ============================================================================

fn value_id(v: Option<&Value>) -> Option<NodeId> {
    match v {
        Some(Value::Bytes(b)) => NodeId::from_slice(b),
        _ => None,
    }
}

fn value_int(v: Option<&Value>) -> Option<i64> {
    match v {
        Some(Value::Int(i)) => Some(*i),
        _ => None,
    }
}

fn value_bytes(v: Option<&Value>) -> Option<&[u8]> {
    match v {
        Some(Value::Bytes(b)) => Some(b.as_slice()),
        _ => None,
    }
}

fn required_id(args: &Dict, desc: &[KeyDesc; 1]) -> Result<NodeId, KrpcError> {
    let [v] = verify_message(args, desc).map_err(KrpcError::protocol)?;
    value_id(v).ok_or_else(|| KrpcError::protocol(format!("missing '{}' key", desc[0].name)))
}
