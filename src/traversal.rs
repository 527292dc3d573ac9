//! # Iterative Lookups
//!
//! A [`Traversal`] walks toward a target ID: it keeps the candidates it knows
//! about sorted by XOR distance, keeps up to `search_branching` queries in
//! flight to the closest unqueried ones, and merges the nodes each reply
//! returns back into the candidate list.
//!
//! ## Kinds
//!
//! | Kind | Query | Result |
//! |------|-------|--------|
//! | FindNode | `find_node` | closest live nodes |
//! | Bootstrap | `find_node` on our ID | closest live nodes; pings the rest |
//! | GetPeers | `get_peers` | peers, scrape estimates; optional announce |
//! | GetItem | `get` | best item found; optional put |
//! | SampleInfohashes | `sample_infohashes` | merged BEP 51 samples |
//! | Direct | ping / announce_peer / put | count of nodes that answered |
//!
//! ## Completion
//!
//! A traversal is done once the `bucket_size` closest candidates have
//! answered with nothing in flight among them, or when nothing is in flight
//! at all. The node removes it from its table before running the callback,
//! so the callback fires exactly once regardless of reply ordering.

use std::collections::HashSet;
use std::net::SocketAddr;

use ed25519_dalek::SigningKey;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::ip_set::compare_ip_cidr;
use crate::item::{hash, Item, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::msg::{bytes, encode, read_endpoint, read_nodes, Dict, DictExt, Value};
use crate::node_id::{compare_ref, generate_random_id, NodeId, ID_LEN};
use crate::protocols::SocketManager;
use crate::rpc_manager::{OutstandingQuery, RpcManager};
use crate::settings::DhtSettings;
use crate::storage::BloomFilter;

pub type TraversalId = u64;

// ============================================================================
// Candidate flags
// ============================================================================

pub const QUERIED: u8 = 0x01;
/// Seeded by the caller rather than learned from a reply.
pub const INITIAL: u8 = 0x02;
/// ID unknown; the stored ID is random and only used for ordering.
pub const NO_ID: u8 = 0x04;
pub const SHORT_TIMEOUT: u8 = 0x08;
pub const FAILED: u8 = 0x10;
pub const ALIVE: u8 = 0x20;
pub const DONE: u8 = 0x40;

/// Candidate list ceiling.
/// SECURITY: a flood of fabricated `nodes` cannot grow a lookup unboundedly.
pub const MAX_RESULTS: usize = 100;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: NodeId,
    pub endpoint: SocketAddr,
    pub flags: u8,
    /// Write token handed out by this node, if any.
    pub token: Option<Vec<u8>>,
}

impl Candidate {
    fn in_flight(&self) -> bool {
        self.flags & QUERIED != 0 && self.flags & DONE == 0
    }
}

// ============================================================================
// Results and callbacks
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct GetPeersResult {
    pub peers: Vec<SocketAddr>,
    /// Estimated seeds, from merged `BFsd` filters (scrape only).
    pub num_seeds: Option<usize>,
    /// Estimated downloaders, from merged `BFpe` filters (scrape only).
    pub num_peers: Option<usize>,
    pub nodes: Vec<(NodeId, SocketAddr)>,
}

#[derive(Debug, Clone, Default)]
pub struct SampleResult {
    pub samples: Vec<NodeId>,
    /// Largest `num` any responder reported.
    pub num: usize,
    /// Shortest `interval` any responder asked for.
    pub interval: Option<Duration>,
    pub responders: usize,
}

pub type NodesCallback = Box<dyn FnOnce(Vec<(NodeId, SocketAddr)>) + Send>;
pub type PeersCallback = Box<dyn FnOnce(GetPeersResult) + Send>;
pub type ItemCallback = Box<dyn FnOnce(Option<Item>) + Send>;
pub type PutCallback = Box<dyn FnOnce(Item, usize) + Send>;
pub type SampleCallback = Box<dyn FnOnce(SampleResult) + Send>;
pub type CountCallback = Box<dyn FnOnce(usize) + Send>;

/// Arguments of an `announce_peer` sent after a `get_peers` lookup.
#[derive(Debug, Clone, Default)]
pub struct AnnounceFlags {
    pub port: u16,
    /// Ask receivers to use our source port instead of `port`.
    pub implied_port: bool,
    pub seed: bool,
    pub name: Option<Vec<u8>>,
}

/// What a `Direct` traversal sends to each of its fixed targets.
#[derive(Debug, Clone)]
pub enum DirectRequest {
    Ping,
    AnnouncePeer(AnnounceFlags),
    Put { item: Item, cas: Option<i64> },
}

impl DirectRequest {
    pub fn method(&self) -> &'static str {
        match self {
            DirectRequest::Ping => "ping",
            DirectRequest::AnnouncePeer(_) => "announce_peer",
            DirectRequest::Put { .. } => "put",
        }
    }
}

/// Store phase queued behind a `get` lookup.
pub enum PendingPut {
    Immutable {
        item: Item,
        on_done: Option<PutCallback>,
    },
    Mutable {
        key: SigningKey,
        /// Signed at seq 0; reported if re-signing fails.
        provisional: Item,
        on_done: Option<PutCallback>,
    },
}

/// Mutable item a `get` is looking for.
#[derive(Debug, Clone)]
pub struct MutableLookup {
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub salt: Vec<u8>,
}

pub enum TraversalKind {
    FindNode {
        on_done: Option<NodesCallback>,
    },
    Bootstrap {
        on_done: Option<NodesCallback>,
    },
    GetPeers {
        noseed: bool,
        scrape: bool,
        peers: Vec<SocketAddr>,
        seeds: BloomFilter<256>,
        downloaders: BloomFilter<256>,
        on_done: Option<PeersCallback>,
        announce: Option<AnnounceFlags>,
    },
    GetItem {
        mutable: Option<MutableLookup>,
        best: Option<Item>,
        on_done: Option<ItemCallback>,
        put: Option<PendingPut>,
    },
    SampleInfohashes {
        result: SampleResult,
        seen: HashSet<NodeId>,
        on_done: Option<SampleCallback>,
    },
    Direct {
        request: DirectRequest,
        on_done: Option<CountCallback>,
    },
}

impl TraversalKind {
    pub fn find_node(on_done: Option<NodesCallback>) -> Self {
        TraversalKind::FindNode { on_done }
    }

    pub fn get_peers(noseed: bool, scrape: bool, announce: Option<AnnounceFlags>, on_done: Option<PeersCallback>) -> Self {
        TraversalKind::GetPeers {
            noseed,
            scrape,
            peers: Vec::new(),
            seeds: BloomFilter::default(),
            downloaders: BloomFilter::default(),
            on_done,
            announce,
        }
    }

    pub fn get_item(mutable: Option<MutableLookup>, on_done: Option<ItemCallback>, put: Option<PendingPut>) -> Self {
        TraversalKind::GetItem { mutable, best: None, on_done, put }
    }

    pub fn sample_infohashes(on_done: Option<SampleCallback>) -> Self {
        TraversalKind::SampleInfohashes {
            result: SampleResult::default(),
            seen: HashSet::new(),
            on_done,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TraversalKind::FindNode { .. } => "find_node",
            TraversalKind::Bootstrap { .. } => "bootstrap",
            TraversalKind::GetPeers { .. } => "get_peers",
            TraversalKind::GetItem { .. } => "get",
            TraversalKind::SampleInfohashes { .. } => "sample_infohashes",
            TraversalKind::Direct { request, .. } => request.method(),
        }
    }

    fn is_direct(&self) -> bool {
        matches!(self, TraversalKind::Direct { .. })
    }
}

/// Work the node has to start after a traversal finished.
pub enum Followup {
    None,
    /// Ping endpoints we heard of but never queried.
    Ping(Vec<SocketAddr>),
    /// Send `request` to each target with the token it gave us.
    Store {
        target: NodeId,
        request: DirectRequest,
        targets: Vec<(NodeId, SocketAddr, Vec<u8>)>,
        on_done: Option<CountCallback>,
    },
}

impl Followup {
    /// Settle a followup that will never run.
    pub fn abandon(self) {
        if let Followup::Store { on_done: Some(cb), .. } = self {
            cb(0);
        }
    }
}

/// Borrowed node state a traversal needs to send queries.
pub struct TraversalContext<'a> {
    pub rpc: &'a mut RpcManager,
    pub socket: &'a mut dyn SocketManager,
    pub settings: &'a DhtSettings,
    pub our_id: NodeId,
}

// ============================================================================
// Traversal
// ============================================================================

pub struct Traversal {
    id: TraversalId,
    target: NodeId,
    kind: TraversalKind,
    results: Vec<Candidate>,
    invoke_count: usize,
    branch_factor: usize,
    responses: usize,
    timeouts: usize,
    v6: bool,
    started: Instant,
}

impl Traversal {
    pub fn new(id: TraversalId, target: NodeId, kind: TraversalKind, settings: &DhtSettings, v6: bool) -> Self {
        Self {
            id,
            target,
            kind,
            results: Vec::new(),
            invoke_count: 0,
            branch_factor: settings.search_branching.max(1),
            responses: 0,
            timeouts: 0,
            v6,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> TraversalId {
        self.id
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn kind(&self) -> &TraversalKind {
        &self.kind
    }

    pub fn results(&self) -> &[Candidate] {
        &self.results
    }

    pub fn invoke_count(&self) -> usize {
        self.invoke_count
    }

    pub fn branch_factor(&self) -> usize {
        self.branch_factor
    }

    /// Send to every target at once. Used for direct traversals.
    pub fn set_branch_factor(&mut self, branch_factor: usize) {
        self.branch_factor = branch_factor.max(1);
    }

    /// Add a candidate. `None` for the ID means we only know the endpoint.
    pub fn add_entry(&mut self, id: Option<NodeId>, endpoint: SocketAddr, flags: u8, settings: &DhtSettings) {
        if endpoint.is_ipv6() != self.v6 {
            return;
        }
        let (id, flags) = match id {
            Some(id) => (id, flags),
            None => (generate_random_id(), flags | NO_ID),
        };

        if self.results.iter().any(|c| c.endpoint == endpoint) {
            return;
        }
        if flags & NO_ID == 0 && self.results.iter().any(|c| c.flags & NO_ID == 0 && c.id == id) {
            return;
        }
        if settings.restrict_search_ips
            && flags & INITIAL == 0
            && self
                .results
                .iter()
                .any(|c| compare_ip_cidr(&c.endpoint.ip(), &endpoint.ip()))
        {
            trace!(endpoint = %endpoint, "candidate shares a subnet with an existing one");
            return;
        }

        let target = self.target;
        let pos = self
            .results
            .partition_point(|c| compare_ref(&c.id, &id, &target).is_lt());
        self.results.insert(pos, Candidate { id, endpoint, flags, token: None });

        if self.results.len() > MAX_RESULTS {
            for c in self.results.split_off(MAX_RESULTS) {
                if c.in_flight() {
                    self.invoke_count = self.invoke_count.saturating_sub(1);
                    if c.flags & SHORT_TIMEOUT != 0 {
                        self.branch_factor = self.branch_factor.saturating_sub(1).max(1);
                    }
                }
            }
        }
    }

    /// Add a node that gave us `token`, for a direct store.
    pub fn add_store_target(&mut self, id: NodeId, endpoint: SocketAddr, token: Vec<u8>) {
        if endpoint.is_ipv6() != self.v6 || self.results.iter().any(|c| c.endpoint == endpoint) {
            return;
        }
        let target = self.target;
        let pos = self
            .results
            .partition_point(|c| compare_ref(&c.id, &id, &target).is_lt());
        self.results.insert(pos, Candidate { id, endpoint, flags: INITIAL, token: Some(token) });
    }

    /// Begin querying. Returns true if the traversal is already done.
    pub fn start(&mut self, ctx: &mut TraversalContext<'_>) -> bool {
        debug!(
            kind = self.kind.name(),
            target = hex::encode(&self.target.as_bytes()[..8]),
            candidates = self.results.len(),
            "traversal started"
        );
        self.add_requests(ctx)
    }

    /// Issue queries to the closest unqueried candidates.
    ///
    /// Returns true when the traversal has converged.
    pub fn add_requests(&mut self, ctx: &mut TraversalContext<'_>) -> bool {
        let aggressive = ctx.settings.aggressive_lookups;
        let mut results_target = ctx.settings.bucket_size;
        let mut outstanding = 0usize;

        let mut i = 0;
        while i < self.results.len()
            && results_target > 0
            && (if aggressive { outstanding } else { self.invoke_count }) < self.branch_factor
        {
            let flags = self.results[i].flags;
            if flags & ALIVE != 0 {
                results_target -= 1;
                i += 1;
                continue;
            }
            if flags & QUERIED != 0 {
                // queried, not alive and not failed means in flight
                if flags & FAILED == 0 {
                    outstanding += 1;
                }
                i += 1;
                continue;
            }

            self.results[i].flags |= QUERIED;
            if self.invoke(i, ctx) {
                self.invoke_count += 1;
                outstanding += 1;
            } else {
                self.results[i].flags |= FAILED | DONE;
            }
            i += 1;
        }

        (results_target == 0 && outstanding == 0) || self.invoke_count == 0
    }

    fn invoke(&self, index: usize, ctx: &mut TraversalContext<'_>) -> bool {
        let c = &self.results[index];
        let (method, query) = self.build_query(c);
        let node_id = if c.flags & NO_ID == 0 { Some(c.id) } else { None };
        let observer = OutstandingQuery::new(Some(self.id), c.endpoint, node_id, method);
        ctx.rpc.invoke(query, c.endpoint, observer, &mut *ctx.socket)
    }

    fn build_query(&self, c: &Candidate) -> (&'static str, Dict) {
        let target = bytes(self.target.as_bytes().to_vec());
        let mut a = Dict::new();
        let method = match &self.kind {
            TraversalKind::FindNode { .. } | TraversalKind::Bootstrap { .. } => {
                a.set("target", target);
                "find_node"
            }
            TraversalKind::GetPeers { noseed, scrape, .. } => {
                a.set("info_hash", target);
                if *noseed {
                    a.set("noseed", Value::Int(1));
                }
                if *scrape {
                    a.set("scrape", Value::Int(1));
                }
                "get_peers"
            }
            TraversalKind::GetItem { .. } => {
                a.set("target", target);
                "get"
            }
            TraversalKind::SampleInfohashes { .. } => {
                a.set("target", target);
                "sample_infohashes"
            }
            TraversalKind::Direct { request, .. } => {
                let token = c.token.clone().unwrap_or_default();
                match request {
                    DirectRequest::Ping => {}
                    DirectRequest::AnnouncePeer(f) => {
                        a.set("info_hash", target);
                        a.set("port", Value::Int(i64::from(f.port)));
                        a.set("token", bytes(token));
                        if f.implied_port {
                            a.set("implied_port", Value::Int(1));
                        }
                        if f.seed {
                            a.set("seed", Value::Int(1));
                        }
                        if let Some(name) = &f.name {
                            a.set("n", bytes(name.clone()));
                        }
                    }
                    DirectRequest::Put { item, cas } => {
                        a.set("token", bytes(token));
                        a.set("v", item.value().clone());
                        if let (Some(pk), Some(sig)) = (item.public_key(), item.signature()) {
                            a.set("k", bytes(pk.to_vec()));
                            a.set("sig", bytes(sig.to_vec()));
                            a.set("seq", Value::Int(item.seq()));
                            if !item.salt().is_empty() {
                                a.set("salt", bytes(item.salt().to_vec()));
                            }
                            if let Some(cas) = cas {
                                a.set("cas", Value::Int(*cas));
                            }
                        }
                    }
                }
                request.method()
            }
        };
        let mut q = Dict::new();
        q.set("q", bytes(method));
        q.set("a", Value::Dict(a));
        (method, q)
    }

    /// Handle a reply body `r` from `from`, whose ID is `responder`.
    ///
    /// Returns true when the traversal is done.
    pub fn on_reply(&mut self, ctx: &mut TraversalContext<'_>, from: SocketAddr, responder: NodeId, r: &Dict) -> bool {
        let Some(idx) = self.results.iter().position(|c| c.endpoint == from) else {
            return false;
        };
        let flags = self.results[idx].flags;
        if flags & QUERIED == 0 || flags & DONE != 0 {
            return false;
        }

        let c = &mut self.results[idx];
        if c.flags & SHORT_TIMEOUT != 0 {
            self.branch_factor = self.branch_factor.saturating_sub(1).max(1);
        }
        c.flags |= ALIVE | DONE;
        c.token = r.get_bytes("token").map(<[u8]>::to_vec);
        let mut reordered = false;
        if c.flags & NO_ID != 0 {
            c.id = responder;
            c.flags &= !NO_ID;
            reordered = true;
        }
        self.responses += 1;
        self.invoke_count = self.invoke_count.saturating_sub(1);

        if reordered {
            // an unqueried duplicate of the now-known ID is redundant
            if let Some(dup) = self
                .results
                .iter()
                .position(|c| c.id == responder && c.endpoint != from && c.flags & QUERIED == 0)
            {
                self.results.remove(dup);
            }
            let target = self.target;
            self.results.sort_by(|a, b| compare_ref(&a.id, &b.id, &target));
        }

        let finished_early = self.absorb_reply(responder, r);

        if !self.kind.is_direct() {
            let key = if self.v6 { "nodes6" } else { "nodes" };
            if let Some(nodes) = r.get_bytes(key) {
                for (id, ep) in read_nodes(nodes, self.v6) {
                    if id == ctx.our_id {
                        continue;
                    }
                    self.add_entry(Some(id), ep, 0, ctx.settings);
                }
            }
        }

        if finished_early {
            return true;
        }
        self.add_requests(ctx)
    }

    /// Kind-specific reply handling. Returns true if the lookup can stop.
    fn absorb_reply(&mut self, responder: NodeId, r: &Dict) -> bool {
        let target = self.target;
        match &mut self.kind {
            TraversalKind::GetPeers { peers, seeds, downloaders, .. } => {
                if let Some(values) = r.get_list("values") {
                    for v in values {
                        if let Value::Bytes(b) = v {
                            if let Some(ep) = read_endpoint(b) {
                                if !peers.contains(&ep) {
                                    peers.push(ep);
                                }
                            }
                        }
                    }
                }
                if let Some(bf) = r.get_bytes("BFsd").and_then(BloomFilter::from_bytes) {
                    seeds.merge(&bf);
                }
                if let Some(bf) = r.get_bytes("BFpe").and_then(BloomFilter::from_bytes) {
                    downloaders.merge(&bf);
                }
                false
            }
            TraversalKind::GetItem { mutable, best, .. } => {
                let Some(v) = r.get_value("v") else {
                    return false;
                };
                match mutable {
                    None => {
                        let Ok(encoded) = encode(v) else {
                            return false;
                        };
                        if hash(&encoded) != target {
                            trace!(id = hex::encode(&responder.as_bytes()[..8]), "immutable item hash mismatch");
                            return false;
                        }
                        match Item::immutable(v.clone()) {
                            Ok(item) => {
                                *best = Some(item);
                                true
                            }
                            Err(_) => false,
                        }
                    }
                    Some(lookup) => {
                        let (Some(k), Some(sig), Some(seq)) =
                            (r.get_bytes("k"), r.get_bytes("sig"), r.get_int("seq"))
                        else {
                            return false;
                        };
                        let (Ok(k), Ok(sig)) = (
                            <[u8; PUBLIC_KEY_LEN]>::try_from(k),
                            <[u8; SIGNATURE_LEN]>::try_from(sig),
                        ) else {
                            return false;
                        };
                        if k != lookup.public_key {
                            return false;
                        }
                        if best.as_ref().is_some_and(|b| b.seq() >= seq) {
                            return false;
                        }
                        match Item::from_signed(v.clone(), k, sig, seq, lookup.salt.clone()) {
                            Some(item) => *best = Some(item),
                            None => {
                                trace!(id = hex::encode(&responder.as_bytes()[..8]), "mutable item with bad signature");
                            }
                        }
                        false
                    }
                }
            }
            TraversalKind::SampleInfohashes { result, seen, .. } => {
                result.responders += 1;
                if let Some(samples) = r.get_bytes("samples") {
                    for chunk in samples.chunks_exact(ID_LEN) {
                        if let Some(ih) = NodeId::from_slice(chunk) {
                            if seen.insert(ih) {
                                result.samples.push(ih);
                            }
                        }
                    }
                }
                if let Some(num) = r.get_int("num").and_then(|n| usize::try_from(n).ok()) {
                    result.num = result.num.max(num);
                }
                if let Some(secs) = r.get_int("interval").and_then(|n| u64::try_from(n).ok()) {
                    let interval = Duration::from_secs(secs);
                    result.interval = Some(result.interval.map_or(interval, |i| i.min(interval)));
                }
                false
            }
            _ => false,
        }
    }

    /// A query to `endpoint` timed out or failed.
    ///
    /// A short timeout keeps the query in flight but lets one more request
    /// go out. Returns true when the traversal is done.
    pub fn on_failure(&mut self, ctx: &mut TraversalContext<'_>, endpoint: SocketAddr, short: bool) -> bool {
        let Some(c) = self.results.iter_mut().find(|c| c.endpoint == endpoint) else {
            return false;
        };
        if c.flags & DONE != 0 {
            return false;
        }

        if short {
            if c.flags & SHORT_TIMEOUT == 0 {
                self.branch_factor += 1;
            }
            c.flags |= SHORT_TIMEOUT;
        } else {
            if c.flags & SHORT_TIMEOUT != 0 {
                self.branch_factor = self.branch_factor.saturating_sub(1).max(1);
            }
            c.flags |= FAILED | DONE;
            self.timeouts += 1;
            self.invoke_count = self.invoke_count.saturating_sub(1);
        }
        self.add_requests(ctx)
    }

    fn alive(&self, k: usize) -> impl Iterator<Item = &Candidate> {
        self.results.iter().filter(|c| c.flags & ALIVE != 0).take(k)
    }

    /// Store targets: the `k` closest responders that gave us a token.
    fn token_holders(&self, k: usize) -> Vec<(NodeId, SocketAddr, Vec<u8>)> {
        self.results
            .iter()
            .filter(|c| c.flags & ALIVE != 0)
            .filter_map(|c| c.token.clone().map(|t| (c.id, c.endpoint, t)))
            .take(k)
            .collect()
    }

    /// Deliver the result. Consumes the traversal so this runs once.
    pub fn finish(self, k: usize) -> Followup {
        debug!(
            kind = self.kind.name(),
            target = hex::encode(&self.target.as_bytes()[..8]),
            responses = self.responses,
            timeouts = self.timeouts,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "traversal complete"
        );

        let closest: Vec<(NodeId, SocketAddr)> = self.alive(k).map(|c| (c.id, c.endpoint)).collect();
        let targets = self.token_holders(k);
        let target = self.target;

        match self.kind {
            TraversalKind::FindNode { on_done } => {
                if let Some(cb) = on_done {
                    cb(closest);
                }
                Followup::None
            }
            TraversalKind::Bootstrap { on_done } => {
                let unqueried = self
                    .results
                    .iter()
                    .filter(|c| c.flags & QUERIED == 0)
                    .map(|c| c.endpoint)
                    .collect();
                if let Some(cb) = on_done {
                    cb(closest);
                }
                Followup::Ping(unqueried)
            }
            TraversalKind::GetPeers { scrape, peers, seeds, downloaders, on_done, announce, .. } => {
                if let Some(cb) = on_done {
                    cb(GetPeersResult {
                        peers,
                        num_seeds: scrape.then(|| seeds.size().round() as usize),
                        num_peers: scrape.then(|| downloaders.size().round() as usize),
                        nodes: closest,
                    });
                }
                match announce {
                    Some(flags) => Followup::Store {
                        target,
                        request: DirectRequest::AnnouncePeer(flags),
                        targets,
                        on_done: None,
                    },
                    None => Followup::None,
                }
            }
            TraversalKind::GetItem { best, on_done, put, .. } => {
                if let Some(cb) = on_done {
                    cb(best.clone());
                }
                match put {
                    None => Followup::None,
                    Some(PendingPut::Immutable { item, on_done }) => {
                        let reported = item.clone();
                        Followup::Store {
                            target,
                            request: DirectRequest::Put { item, cas: None },
                            targets,
                            on_done: on_done.map(|cb| -> CountCallback { Box::new(move |n| cb(reported, n)) }),
                        }
                    }
                    Some(PendingPut::Mutable { key, provisional, on_done }) => {
                        let found = best.as_ref().map(Item::seq);
                        let seq = found.map_or(1, |s| s.saturating_add(1));
                        match Item::mutable(provisional.value().clone(), provisional.salt().to_vec(), seq, &key) {
                            Ok(item) => {
                                let reported = item.clone();
                                Followup::Store {
                                    target,
                                    request: DirectRequest::Put { item, cas: found },
                                    targets,
                                    on_done: on_done.map(|cb| -> CountCallback { Box::new(move |n| cb(reported, n)) }),
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "failed to sign mutable item");
                                if let Some(cb) = on_done {
                                    cb(provisional, 0);
                                }
                                Followup::None
                            }
                        }
                    }
                }
            }
            TraversalKind::SampleInfohashes { result, on_done, .. } => {
                if let Some(cb) = on_done {
                    cb(result);
                }
                Followup::None
            }
            TraversalKind::Direct { on_done, .. } => {
                if let Some(cb) = on_done {
                    cb(self.responses);
                }
                Followup::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc_manager::tests::RecordingSocket;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn id_with_first(b: u8) -> NodeId {
        let mut raw = [0u8; 20];
        raw[0] = b;
        NodeId::from_bytes(raw)
    }

    fn ep(i: u8) -> SocketAddr {
        SocketAddr::from(([10, i, 0, 1], 6881))
    }

    struct Harness {
        rpc: RpcManager,
        socket: RecordingSocket,
        settings: DhtSettings,
    }

    impl Harness {
        fn new(settings: DhtSettings) -> Self {
            Self {
                rpc: RpcManager::new(NodeId::max(), &settings),
                socket: RecordingSocket::default(),
                settings,
            }
        }

        fn ctx(&mut self) -> TraversalContext<'_> {
            TraversalContext {
                rpc: &mut self.rpc,
                socket: &mut self.socket,
                settings: &self.settings,
                our_id: NodeId::max(),
            }
        }

        fn sent_to(&self) -> Vec<SocketAddr> {
            self.socket.sent.iter().map(|(to, _)| *to).collect()
        }
    }

    fn plain_settings() -> DhtSettings {
        DhtSettings {
            search_branching: 3,
            bucket_size: 2,
            aggressive_lookups: false,
            restrict_search_ips: false,
            ..Default::default()
        }
    }

    fn counting_find_node(counter: Arc<AtomicUsize>, got: Arc<Mutex<Vec<NodeId>>>) -> TraversalKind {
        TraversalKind::find_node(Some(Box::new(move |nodes| {
            counter.fetch_add(1, Ordering::SeqCst);
            got.lock().unwrap().extend(nodes.into_iter().map(|(id, _)| id));
        })))
    }

    #[test]
    fn queries_closest_candidates_first() {
        let mut h = Harness::new(plain_settings());
        let mut t = Traversal::new(1, NodeId::min(), TraversalKind::find_node(None), &h.settings, false);
        for i in (1..=10u8).rev() {
            t.add_entry(Some(id_with_first(i)), ep(i), 0, &h.settings);
        }
        assert!(!t.start(&mut h.ctx()));
        assert_eq!(h.sent_to(), vec![ep(1), ep(2), ep(3)]);
        assert_eq!(t.invoke_count(), 3);

        let (_, q) = &h.socket.sent[0];
        assert_eq!(q.get_bytes("q"), Some(&b"find_node"[..]));
        assert_eq!(q.get_dict("a").unwrap().get_id("target"), Some(NodeId::min()));
    }

    #[test]
    fn converges_once_k_closest_answer() {
        let mut h = Harness::new(plain_settings());
        let counter = Arc::new(AtomicUsize::new(0));
        let got = Arc::new(Mutex::new(Vec::new()));
        let mut t = Traversal::new(
            1,
            NodeId::min(),
            counting_find_node(counter.clone(), got.clone()),
            &h.settings,
            false,
        );
        for i in 1..=3u8 {
            t.add_entry(Some(id_with_first(i)), ep(i), 0, &h.settings);
        }
        t.start(&mut h.ctx());

        let empty = Dict::new();
        assert!(!t.on_reply(&mut h.ctx(), ep(1), id_with_first(1), &empty));
        // the k closest have answered; the farthest is still in flight
        assert!(t.on_reply(&mut h.ctx(), ep(2), id_with_first(2), &empty));
        assert_eq!(t.invoke_count(), 1);

        t.finish(h.settings.bucket_size);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(*got.lock().unwrap(), vec![id_with_first(1), id_with_first(2)]);
    }

    #[test]
    fn reply_nodes_are_merged_by_distance() {
        let mut h = Harness::new(DhtSettings { search_branching: 1, ..plain_settings() });
        let mut t = Traversal::new(1, NodeId::min(), TraversalKind::find_node(None), &h.settings, false);
        t.add_entry(Some(id_with_first(0x80)), ep(1), 0, &h.settings);
        t.start(&mut h.ctx());

        let mut nodes = Vec::new();
        crate::msg::write_node(&id_with_first(0x10), &ep(2), &mut nodes);
        crate::msg::write_node(&id_with_first(0x08), &ep(3), &mut nodes);
        // our own ID is never a candidate
        crate::msg::write_node(&NodeId::max(), &ep(4), &mut nodes);
        let mut r = Dict::new();
        r.set("nodes", bytes(nodes));

        t.on_reply(&mut h.ctx(), ep(1), id_with_first(0x80), &r);
        let ids: Vec<NodeId> = t.results().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![id_with_first(0x08), id_with_first(0x10), id_with_first(0x80)]);
        // the closest new node is queried next
        assert_eq!(h.sent_to().last(), Some(&ep(3)));
    }

    #[test]
    fn restrict_search_ips_drops_same_subnet() {
        let settings = DhtSettings { restrict_search_ips: true, ..plain_settings() };
        let mut t = Traversal::new(1, NodeId::min(), TraversalKind::find_node(None), &settings, false);
        t.add_entry(Some(id_with_first(1)), "1.2.3.4:1".parse().unwrap(), 0, &settings);
        t.add_entry(Some(id_with_first(2)), "1.2.3.99:1".parse().unwrap(), 0, &settings);
        t.add_entry(Some(id_with_first(3)), "1.2.4.1:1".parse().unwrap(), 0, &settings);
        // seeded candidates are exempt
        t.add_entry(Some(id_with_first(4)), "1.2.3.100:1".parse().unwrap(), INITIAL, &settings);
        assert_eq!(t.results().len(), 3);
    }

    #[test]
    fn duplicates_and_wrong_family_are_ignored() {
        let settings = plain_settings();
        let mut t = Traversal::new(1, NodeId::min(), TraversalKind::find_node(None), &settings, false);
        t.add_entry(Some(id_with_first(1)), ep(1), 0, &settings);
        t.add_entry(Some(id_with_first(1)), ep(2), 0, &settings);
        t.add_entry(Some(id_with_first(5)), ep(1), 0, &settings);
        t.add_entry(Some(id_with_first(6)), "[::1]:6881".parse().unwrap(), 0, &settings);
        assert_eq!(t.results().len(), 1);
    }

    #[test]
    fn result_set_is_capped() {
        let settings = plain_settings();
        let mut t = Traversal::new(1, NodeId::min(), TraversalKind::find_node(None), &settings, false);
        for i in 0..150u32 {
            let mut raw = [0u8; 20];
            raw[..4].copy_from_slice(&(i + 1).to_be_bytes());
            let addr = SocketAddr::from(([10, (i >> 8) as u8, i as u8, 1], 6881));
            t.add_entry(Some(NodeId::from_bytes(raw)), addr, 0, &settings);
        }
        assert_eq!(t.results().len(), MAX_RESULTS);
        // the farthest ones were dropped
        let last = t.results().last().unwrap().id;
        assert_eq!(&last.as_bytes()[..4], &100u32.to_be_bytes());
    }

    #[test]
    fn short_timeout_opens_a_slot_and_full_timeout_counts() {
        let mut h = Harness::new(DhtSettings { search_branching: 1, ..plain_settings() });
        let mut t = Traversal::new(1, NodeId::min(), TraversalKind::find_node(None), &h.settings, false);
        for i in 1..=3u8 {
            t.add_entry(Some(id_with_first(i)), ep(i), 0, &h.settings);
        }
        t.start(&mut h.ctx());
        assert_eq!(h.sent_to(), vec![ep(1)]);

        assert!(!t.on_failure(&mut h.ctx(), ep(1), true));
        assert_eq!(t.branch_factor(), 2);
        assert_eq!(h.sent_to(), vec![ep(1), ep(2)]);

        assert!(!t.on_failure(&mut h.ctx(), ep(1), false));
        assert_eq!(t.branch_factor(), 1);
        assert_eq!(t.invoke_count(), 1);
    }

    #[test]
    fn all_failures_finish_the_lookup() {
        let mut h = Harness::new(plain_settings());
        let mut t = Traversal::new(1, NodeId::min(), TraversalKind::find_node(None), &h.settings, false);
        t.add_entry(Some(id_with_first(1)), ep(1), 0, &h.settings);
        t.start(&mut h.ctx());
        assert!(t.on_failure(&mut h.ctx(), ep(1), false));
    }

    #[test]
    fn immutable_get_stops_at_first_valid_item() {
        let mut h = Harness::new(plain_settings());
        let item = Item::immutable(Value::Bytes(b"Hello World!".to_vec())).unwrap();
        let got = Arc::new(Mutex::new(None));
        let sink = got.clone();
        let kind = TraversalKind::get_item(None, Some(Box::new(move |i| *sink.lock().unwrap() = i)), None);
        let mut t = Traversal::new(1, item.target(), kind, &h.settings, false);
        for i in 1..=3u8 {
            t.add_entry(Some(id_with_first(i)), ep(i), 0, &h.settings);
        }
        t.start(&mut h.ctx());

        let mut bogus = Dict::new();
        bogus.set("v", Value::Bytes(b"something else".to_vec()));
        assert!(!t.on_reply(&mut h.ctx(), ep(1), id_with_first(1), &bogus));

        let mut r = Dict::new();
        r.set("v", item.value().clone());
        assert!(t.on_reply(&mut h.ctx(), ep(2), id_with_first(2), &r));
        t.finish(2);
        let found = got.lock().unwrap().take().unwrap();
        assert_eq!(found.encoded_value(), b"12:Hello World!");
    }

    #[test]
    fn mutable_get_keeps_highest_sequence() {
        use rand::rngs::OsRng;
        let key = SigningKey::generate(&mut OsRng);
        let old = Item::mutable(Value::Int(1), Vec::new(), 3, &key).unwrap();
        let new = Item::mutable(Value::Int(2), Vec::new(), 9, &key).unwrap();

        let mut h = Harness::new(plain_settings());
        let got = Arc::new(Mutex::new(None));
        let sink = got.clone();
        let lookup = MutableLookup { public_key: key.verifying_key().to_bytes(), salt: Vec::new() };
        let kind = TraversalKind::get_item(Some(lookup), Some(Box::new(move |i| *sink.lock().unwrap() = i)), None);
        let mut t = Traversal::new(1, old.target(), kind, &h.settings, false);
        for i in 1..=2u8 {
            t.add_entry(Some(id_with_first(i)), ep(i), 0, &h.settings);
        }
        t.start(&mut h.ctx());

        let reply = |item: &Item| {
            let mut r = Dict::new();
            r.set("v", item.value().clone());
            r.set("k", bytes(item.public_key().unwrap().to_vec()));
            r.set("sig", bytes(item.signature().unwrap().to_vec()));
            r.set("seq", Value::Int(item.seq()));
            r.set("token", bytes(vec![1, 2, 3, 4]));
            r
        };
        t.on_reply(&mut h.ctx(), ep(1), id_with_first(1), &reply(&new));
        assert!(t.on_reply(&mut h.ctx(), ep(2), id_with_first(2), &reply(&old)));
        t.finish(2);
        assert_eq!(got.lock().unwrap().as_ref().map(Item::seq), Some(9));
    }

    #[test]
    fn mutable_put_sends_next_sequence_with_cas() {
        use rand::rngs::OsRng;
        let key = SigningKey::generate(&mut OsRng);
        let stored = Item::mutable(Value::Int(1), Vec::new(), 4, &key).unwrap();
        let provisional = Item::mutable(Value::Int(2), Vec::new(), 0, &key).unwrap();

        let mut h = Harness::new(plain_settings());
        let lookup = MutableLookup { public_key: key.verifying_key().to_bytes(), salt: Vec::new() };
        let put = PendingPut::Mutable { key: key.clone(), provisional, on_done: None };
        let kind = TraversalKind::get_item(Some(lookup), None, Some(put));
        let mut t = Traversal::new(1, stored.target(), kind, &h.settings, false);
        t.add_entry(Some(id_with_first(1)), ep(1), 0, &h.settings);
        t.start(&mut h.ctx());

        let mut r = Dict::new();
        r.set("v", stored.value().clone());
        r.set("k", bytes(stored.public_key().unwrap().to_vec()));
        r.set("sig", bytes(stored.signature().unwrap().to_vec()));
        r.set("seq", Value::Int(4));
        r.set("token", bytes(b"tokn".to_vec()));
        assert!(t.on_reply(&mut h.ctx(), ep(1), id_with_first(1), &r));

        match t.finish(2) {
            Followup::Store { request: DirectRequest::Put { item, cas }, targets, .. } => {
                assert_eq!(item.seq(), 5);
                assert_eq!(cas, Some(4));
                assert_eq!(targets, vec![(id_with_first(1), ep(1), b"tokn".to_vec())]);
            }
            _ => panic!("expected a put followup"),
        }
    }

    #[test]
    fn bootstrap_pings_unqueried_candidates() {
        let mut h = Harness::new(DhtSettings { search_branching: 1, ..plain_settings() });
        let kind = TraversalKind::Bootstrap { on_done: None };
        let mut t = Traversal::new(1, NodeId::min(), kind, &h.settings, false);
        t.add_entry(None, ep(9), INITIAL, &h.settings);
        t.start(&mut h.ctx());

        let mut nodes = Vec::new();
        crate::msg::write_node(&id_with_first(0x40), &ep(2), &mut nodes);
        crate::msg::write_node(&id_with_first(0x41), &ep(3), &mut nodes);
        let mut r = Dict::new();
        r.set("nodes", bytes(nodes));
        t.on_reply(&mut h.ctx(), ep(9), id_with_first(0x20), &r);
        t.on_reply(&mut h.ctx(), ep(2), id_with_first(0x40), &Dict::new());

        match t.finish(2) {
            Followup::Ping(eps) => assert_eq!(eps, vec![ep(3)]),
            _ => panic!("expected pings"),
        }
    }

    #[test]
    fn direct_announce_carries_each_token() {
        let mut h = Harness::new(plain_settings());
        let flags = AnnounceFlags { port: 6881, seed: true, ..Default::default() };
        let kind = TraversalKind::Direct { request: DirectRequest::AnnouncePeer(flags), on_done: None };
        let mut t = Traversal::new(1, id_with_first(7), kind, &h.settings, false);
        t.add_store_target(id_with_first(1), ep(1), b"abcd".to_vec());
        t.start(&mut h.ctx());

        let (_, q) = &h.socket.sent[0];
        assert_eq!(q.get_bytes("q"), Some(&b"announce_peer"[..]));
        let a = q.get_dict("a").unwrap();
        assert_eq!(a.get_bytes("token"), Some(&b"abcd"[..]));
        assert_eq!(a.get_int("port"), Some(6881));
        assert_eq!(a.get_int("seed"), Some(1));
        assert_eq!(a.get_id("info_hash"), Some(id_with_first(7)));
    }
}
