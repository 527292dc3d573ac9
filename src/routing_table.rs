//! # Kademlia Routing Table
//!
//! An ordered list of buckets. Bucket `i` holds nodes whose ID shares exactly
//! `i` leading bits with ours, except the last bucket, which holds every node
//! sharing at least `i` bits and is the only bucket that can split.
//!
//! ## Buckets
//!
//! Each bucket keeps a list of live nodes (all of which have answered us at
//! least once) and a replacement cache of candidates waiting for a slot.
//!
//! | Bucket | Live capacity (extended table) |
//! |--------|--------------------------------|
//! | 0 | 16 × k |
//! | 1 | 8 × k |
//! | 2 | 4 × k |
//! | 3 | 2 × k |
//! | 4.. | k |
//!
//! Replacement caches are always capped at k.
//!
//! ## Admission
//!
//! [`RoutingTable::add_node`] resolves every candidate to added, split-and-retry
//! or rejected. Rejections cover router nodes, ourselves, ID/endpoint
//! mismatches and, with `restrict_routing_ips`, addresses sharing a /24 (/64)
//! with an existing entry. When a full bucket cannot split,
//! [`replace_node_impl`] picks an eviction victim that keeps the bucket's IDs
//! spread across sub-prefixes.
//!
//! ## Invariants
//!
//! - The `IpSet` always equals the multiset of live-entry addresses.
//! - No two live entries share a raw IP. A replacement whose IP is already
//!   live waits in its cache until that entry leaves.
//! - No live list exceeds [`RoutingTable::bucket_limit`]; no replacement cache exceeds k.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::ip_set::{compare_ip_cidr, IpSet};
use crate::node_entry::NodeEntry;
use crate::node_id::{classify_prefix, compare_ref, distance_exp, verify_id, NodeId, ID_BITS};
use crate::settings::DhtSettings;

/// Upper bound on buckets reachable through splitting.
///
/// Real tables are 20-30 buckets deep. A deeper table means someone is
/// crafting IDs close to ours; beyond this we stop splitting and let the
/// candidate compete for the existing slots.
pub const MAX_SPLIT_DEPTH: usize = 80;

/// After a suspected ID hijack, bucket peers not queried within this window
/// are scheduled for re-verification.
const REVERIFY_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Multipliers widening the first buckets of an extended table.
const EXTENDED_BUCKET_FACTORS: [usize; 4] = [16, 8, 4, 2];

#[derive(Debug, Clone, Default)]
pub struct Bucket {
    pub live_nodes: Vec<NodeEntry>,
    pub replacements: Vec<NodeEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddNodeStatus {
    Added,
    NeedSplit,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Live(usize),
    Replacement(usize),
}

/// Node counts across the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableSize {
    pub live: usize,
    pub replacements: usize,
    pub confirmed: usize,
}

pub struct RoutingTable {
    id: NodeId,
    buckets: Vec<Bucket>,
    bucket_size: usize,
    ips: IpSet,
    router_nodes: HashSet<SocketAddr>,
    restrict_routing_ips: bool,
    extended_routing_table: bool,
    prefer_verified_node_ids: bool,
    enforce_node_id: bool,
    max_fail_count: u8,
}

impl RoutingTable {
    pub fn new(id: NodeId, settings: &DhtSettings) -> Self {
        Self {
            id,
            buckets: Vec::new(),
            bucket_size: settings.bucket_size.max(1).next_power_of_two(),
            ips: IpSet::new(),
            router_nodes: HashSet::new(),
            restrict_routing_ips: settings.restrict_routing_ips,
            extended_routing_table: settings.extended_routing_table,
            prefer_verified_node_ids: settings.prefer_verified_node_ids,
            enforce_node_id: settings.enforce_node_id,
            max_fail_count: settings.max_fail_count,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Base bucket size (k).
    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn ip_set(&self) -> &IpSet {
        &self.ips
    }

    /// Live capacity of bucket `index`.
    pub fn bucket_limit(&self, index: usize) -> usize {
        if !self.extended_routing_table {
            return self.bucket_size;
        }
        match EXTENDED_BUCKET_FACTORS.get(index) {
            Some(factor) => self.bucket_size * factor,
            None => self.bucket_size,
        }
    }

    pub fn size(&self) -> TableSize {
        let mut size = TableSize::default();
        for b in &self.buckets {
            size.live += b.live_nodes.len();
            size.replacements += b.replacements.len();
            size.confirmed += b.live_nodes.iter().filter(|n| n.confirmed()).count();
        }
        size
    }

    /// Index of the deepest bucket still at least half full.
    pub fn depth(&self) -> usize {
        let half = self.bucket_size / 2;
        let mut depth = 0;
        while depth + 1 < self.buckets.len() && self.buckets[depth + 1].live_nodes.len() >= half {
            depth += 1;
        }
        depth
    }

    /// Rough size of the whole DHT, extrapolated from how deep our table is full.
    pub fn num_global_nodes(&self) -> u64 {
        let mut deepest_bucket = 0u32;
        let mut deepest_size = 0usize;
        for b in &self.buckets {
            deepest_size = b.live_nodes.len();
            if deepest_size < self.bucket_size {
                break;
            }
            deepest_bucket += 1;
        }
        if deepest_bucket == 0 {
            return 1 + deepest_size as u64;
        }
        let deepest_bucket = deepest_bucket.min(62);
        if deepest_size < self.bucket_size / 2 {
            (1u64 << deepest_bucket) * self.bucket_size as u64
        } else {
            (2u64 << deepest_bucket) * deepest_size as u64
        }
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.buckets.iter().flat_map(|b| b.live_nodes.iter())
    }

    pub fn replacement_nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.buckets.iter().flat_map(|b| b.replacements.iter())
    }

    // ------------------------------------------------------------------------
    // Router nodes
    // ------------------------------------------------------------------------

    /// Register a bootstrap endpoint. Router nodes seed traversals but are
    /// never admitted to the table.
    pub fn add_router_node(&mut self, endpoint: SocketAddr) {
        self.router_nodes.insert(endpoint);
    }

    pub fn is_router(&self, endpoint: &SocketAddr) -> bool {
        self.router_nodes.contains(endpoint)
    }

    pub fn router_nodes(&self) -> impl Iterator<Item = &SocketAddr> {
        self.router_nodes.iter()
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    /// Bucket responsible for `id`, creating the first bucket if needed.
    fn find_bucket(&mut self, id: &NodeId) -> usize {
        if self.buckets.is_empty() {
            self.buckets.push(Bucket::default());
        }
        self.bucket_index_for(id)
    }

    fn bucket_index_for(&self, id: &NodeId) -> usize {
        let num_buckets = self.buckets.len().max(1);
        let index = (ID_BITS as i32 - 1 - distance_exp(&self.id, id)) as usize;
        index.min(num_buckets - 1)
    }

    fn find_by_endpoint(&self, endpoint: &SocketAddr) -> Option<(usize, Slot)> {
        for (bi, b) in self.buckets.iter().enumerate() {
            if let Some(j) = b.live_nodes.iter().position(|n| n.endpoint == *endpoint) {
                return Some((bi, Slot::Live(j)));
            }
            if let Some(j) = b.replacements.iter().position(|n| n.endpoint == *endpoint) {
                return Some((bi, Slot::Replacement(j)));
            }
        }
        None
    }

    fn entry_mut(&mut self, bucket: usize, slot: Slot) -> &mut NodeEntry {
        match slot {
            Slot::Live(j) => &mut self.buckets[bucket].live_nodes[j],
            Slot::Replacement(j) => &mut self.buckets[bucket].replacements[j],
        }
    }

    fn remove_entry(&mut self, bucket: usize, slot: Slot) -> NodeEntry {
        match slot {
            Slot::Live(j) => {
                let removed = self.buckets[bucket].live_nodes.remove(j);
                self.ips.erase(&removed.addr());
                removed
            }
            Slot::Replacement(j) => self.buckets[bucket].replacements.remove(j),
        }
    }

    /// Look up a live or cached entry by ID.
    pub fn find_entry(&self, id: &NodeId) -> Option<&NodeEntry> {
        if self.buckets.is_empty() {
            return None;
        }
        let b = &self.buckets[self.bucket_index_for(id)];
        b.live_nodes
            .iter()
            .chain(b.replacements.iter())
            .find(|n| n.id == *id)
    }

    /// Up to `count` nodes closest to `target` (k when `count` is zero),
    /// sorted by XOR distance. Unconfirmed nodes are skipped unless
    /// `include_failed` is set.
    pub fn find_node(&self, target: &NodeId, include_failed: bool, count: usize) -> Vec<NodeEntry> {
        let count = if count == 0 { self.bucket_size } else { count };
        if self.buckets.is_empty() {
            return Vec::new();
        }
        let start = self.bucket_index_for(target);
        let mut out: Vec<NodeEntry> = Vec::with_capacity(self.bucket_limit(start));

        let usable = |n: &&NodeEntry| include_failed || n.confirmed();

        for b in &self.buckets[start..] {
            out.extend(b.live_nodes.iter().filter(usable).cloned());
            if out.len() >= count {
                break;
            }
        }
        if out.len() < count {
            for b in self.buckets[..start].iter().rev() {
                out.extend(b.live_nodes.iter().filter(usable).cloned());
                if out.len() >= count {
                    break;
                }
            }
        }

        out.sort_by(|a, b| compare_ref(&a.id, &b.id, target));
        out.truncate(count);
        out
    }

    /// Pick the node most in need of a ping and stamp it as queried.
    ///
    /// Prefers never-queried live nodes, walking from the deepest bucket out,
    /// then the least recently queried one. Unpinged replacements are picked
    /// from the last bucket or any bucket with free slots.
    pub fn next_refresh(&mut self) -> Option<NodeEntry> {
        let num_buckets = self.buckets.len();
        let mut candidate: Option<(usize, Slot)> = None;
        let mut oldest: Option<Option<Instant>> = None;

        'scan: for bi in (0..num_buckets).rev() {
            let limit = self.bucket_limit(bi);
            let b = &self.buckets[bi];
            for (j, n) in b.live_nodes.iter().enumerate() {
                if n.id == self.id {
                    continue;
                }
                if n.last_queried.is_none() {
                    candidate = Some((bi, Slot::Live(j)));
                    break 'scan;
                }
                if oldest.map_or(true, |t| n.last_queried < t) {
                    oldest = Some(n.last_queried);
                    candidate = Some((bi, Slot::Live(j)));
                }
            }

            if bi + 1 == num_buckets || b.live_nodes.len() < limit {
                if let Some(j) = b
                    .replacements
                    .iter()
                    .position(|n| !n.pinged() && n.last_queried.is_none())
                {
                    candidate = Some((bi, Slot::Replacement(j)));
                    break 'scan;
                }
            }
        }

        let (bi, slot) = candidate?;
        let entry = self.entry_mut(bi, slot);
        entry.last_queried = Some(Instant::now());
        Some(entry.clone())
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    fn verify_node_address(&self, id: &NodeId, endpoint: &SocketAddr) -> bool {
        !self.enforce_node_id || verify_id(id, &endpoint.ip())
    }

    /// A node was mentioned by someone else; it has not answered us yet.
    pub fn heard_about(&mut self, id: &NodeId, endpoint: SocketAddr) {
        if !self.verify_node_address(id, &endpoint) {
            return;
        }
        self.add_node(NodeEntry::new(*id, endpoint, crate::node_entry::RTT_UNKNOWN, false));
    }

    /// A node answered one of our queries after `rtt` milliseconds.
    ///
    /// Returns true when the node ended up in the table, meaning our view of
    /// its neighbourhood changed and a refresh around it may pay off.
    pub fn node_seen(&mut self, id: &NodeId, endpoint: SocketAddr, rtt: u16) -> bool {
        self.verify_node_address(id, &endpoint)
            && self.add_node(NodeEntry::new(*id, endpoint, rtt, true))
    }

    /// Insert `e`, splitting the last bucket as often as needed. Returns true
    /// if the node is now live or cached as a replacement.
    pub fn add_node(&mut self, e: NodeEntry) -> bool {
        let mut status = self.add_node_impl(e.clone());
        while status == AddNodeStatus::NeedSplit {
            self.split_bucket();

            if self.buckets.len() > MAX_SPLIT_DEPTH {
                debug!(
                    buckets = self.buckets.len(),
                    id = hex::encode(&e.id.as_bytes()[..8]),
                    "routing table split ceiling reached"
                );
                status = self.add_node_impl(e);
                break;
            }

            let last = self.buckets.len() - 1;
            if self.buckets[last].live_nodes.len() > self.bucket_limit(last) {
                continue;
            }

            status = self.add_node_impl(e.clone());
            self.prune_empty_bucket();
        }
        self.check_invariant();
        status == AddNodeStatus::Added
    }

    /// Single insertion attempt. Never splits; reports `NeedSplit` instead.
    pub fn add_node_impl(&mut self, mut e: NodeEntry) -> AddNodeStatus {
        if self.router_nodes.contains(&e.endpoint) {
            return AddNodeStatus::Failed;
        }

        if self.ips.exists(&e.addr()) {
            match self.find_by_endpoint(&e.endpoint) {
                None => {
                    // same IP, different port
                    if self.restrict_routing_ips {
                        return AddNodeStatus::Failed;
                    }
                }
                Some((bi, slot)) => {
                    let existing = self.entry_mut(bi, slot);
                    if existing.id == e.id {
                        existing.reset_fail_count();
                        if e.pinged() {
                            existing.set_pinged();
                            existing.update_rtt(e.rtt);
                            existing.last_queried = e.last_queried;
                        }
                        self.fill_from_replacements(bi);
                        self.prune_empty_bucket();
                        return AddNodeStatus::Added;
                    }
                    if existing.id.is_all_zeros() {
                        self.remove_entry(bi, slot);
                    } else if !e.pinged() {
                        return AddNodeStatus::Failed;
                    } else {
                        let evicted = self.remove_entry(bi, slot);
                        debug!(
                            endpoint = %e.endpoint,
                            old = hex::encode(&evicted.id.as_bytes()[..8]),
                            new = hex::encode(&e.id.as_bytes()[..8]),
                            "endpoint changed node id, evicting and re-verifying bucket"
                        );
                        self.fill_from_replacements(bi);
                        let now = Instant::now();
                        for n in &mut self.buckets[bi].live_nodes {
                            let recent = n
                                .last_queried
                                .map_or(false, |t| now.saturating_duration_since(t) < REVERIFY_WINDOW);
                            if !recent {
                                n.last_queried = None;
                            }
                        }
                        self.prune_empty_bucket();
                        return AddNodeStatus::Failed;
                    }
                }
            }
        }

        if e.id == self.id {
            return AddNodeStatus::Failed;
        }

        let bi = self.find_bucket(&e.id);
        let limit = self.bucket_limit(bi);
        let last_bucket = bi + 1 == self.buckets.len();

        if let Some(n) = self.buckets[bi].live_nodes.iter_mut().find(|n| n.id == e.id) {
            // a different endpoint claiming a known ID is ignored
            if n.endpoint != e.endpoint {
                return AddNodeStatus::Failed;
            }
            n.reset_fail_count();
            n.update_rtt(e.rtt);
            return AddNodeStatus::Added;
        }

        let rb = &mut self.buckets[bi].replacements;
        if let Some(j) = rb.iter().position(|n| n.id == e.id) {
            if rb[j].endpoint != e.endpoint {
                return AddNodeStatus::Failed;
            }
            let mut cached = rb.remove(j);
            cached.reset_fail_count();
            cached.update_rtt(e.rtt);
            if e.pinged() {
                cached.set_pinged();
                cached.last_queried = e.last_queried;
            }
            e = cached;
        }

        if self.restrict_routing_ips {
            let addr = e.addr();
            let b = &self.buckets[bi];
            if b.live_nodes
                .iter()
                .chain(b.replacements.iter())
                .any(|n| compare_ip_cidr(&n.addr(), &addr))
            {
                trace!(endpoint = %e.endpoint, "rejecting node close to an existing entry's address");
                return AddNodeStatus::Failed;
            }
        }

        // same IP on another port, only ever cached
        let ip_free = !self.ips.exists(&e.addr());
        let can_split = ip_free && self.can_split(bi, &e);
        // A splittable bucket fills only to the next bucket's size, so the
        // split never has to push live nodes into replacement caches.
        let capacity = if can_split { self.bucket_limit(bi + 1).min(limit) } else { limit };

        if e.pinged() && ip_free && self.buckets[bi].live_nodes.len() < capacity {
            self.ips.insert(e.addr());
            self.buckets[bi].live_nodes.push(e);
            return AddNodeStatus::Added;
        }

        if can_split {
            return AddNodeStatus::NeedSplit;
        }

        if e.confirmed() && ip_free {
            let live = &self.buckets[bi].live_nodes;
            if live.len() >= limit {
                if let Some(j) = replace_node_impl(&e, live, bi, limit, last_bucket) {
                    let addr = e.addr();
                    let old = std::mem::replace(&mut self.buckets[bi].live_nodes[j], e);
                    self.ips.erase(&old.addr());
                    self.ips.insert(addr);
                    trace!(
                        evicted = hex::encode(&old.id.as_bytes()[..8]),
                        bucket = bi,
                        "replaced live node"
                    );
                    return AddNodeStatus::Added;
                }
            }
        }

        let bucket_size = self.bucket_size;
        let rb = &mut self.buckets[bi].replacements;
        if rb.len() >= bucket_size {
            match rb.iter().position(|n| !n.pinged()) {
                Some(j) => {
                    rb.remove(j);
                }
                None => {
                    return match replace_node_impl(&e, rb, bi, bucket_size, last_bucket) {
                        Some(j) => {
                            rb[j] = e;
                            AddNodeStatus::Added
                        }
                        None => AddNodeStatus::Failed,
                    };
                }
            }
        }
        rb.push(e);
        AddNodeStatus::Added
    }

    fn can_split(&self, bi: usize, e: &NodeEntry) -> bool {
        let live = &self.buckets[bi].live_nodes;
        bi + 1 == self.buckets.len()
            && self.buckets.len() < ID_BITS - 1
            && (!self.prefer_verified_node_ids || (e.verified && mostly_verified_nodes(live)))
            && e.confirmed()
            && (bi == 0 || self.buckets[bi - 1].live_nodes.len() > 1)
            && !all_in_same_bucket(live, &e.id, bi)
    }

    /// Append a bucket and move every entry of the old last bucket that now
    /// belongs deeper into it.
    pub fn split_bucket(&mut self) {
        let bi = self.buckets.len() - 1;
        let old_limit = self.bucket_limit(bi);
        let new_limit = self.bucket_limit(bi + 1);
        let bucket_size = self.bucket_size;
        let stay_exp = ID_BITS as i32 - 1 - bi as i32;
        let own = self.id;
        let restrict = self.restrict_routing_ips;

        let old = std::mem::take(&mut self.buckets[bi]);
        let mut keep = Bucket::default();
        let mut moved = Bucket::default();
        let mut dropped = 0usize;

        for n in old.live_nodes {
            if distance_exp(&own, &n.id) >= stay_exp {
                if keep.live_nodes.len() < old_limit {
                    keep.live_nodes.push(n);
                } else {
                    self.ips.erase(&n.addr());
                    dropped += usize::from(!push_replacement(&mut keep.replacements, n, bucket_size));
                }
            } else if moved.live_nodes.len() < new_limit {
                moved.live_nodes.push(n);
            } else {
                self.ips.erase(&n.addr());
                dropped += usize::from(!push_replacement(&mut moved.replacements, n, bucket_size));
            }
        }

        for n in old.replacements {
            if distance_exp(&own, &n.id) >= stay_exp {
                if n.pinged()
                    && keep.live_nodes.len() < old_limit
                    && can_go_live(&self.ips, &keep.live_nodes, &n.addr(), restrict)
                {
                    self.ips.insert(n.addr());
                    keep.live_nodes.push(n);
                } else {
                    dropped += usize::from(!push_replacement(&mut keep.replacements, n, bucket_size));
                }
            } else if n.pinged()
                && moved.live_nodes.len() < new_limit
                && can_go_live(&self.ips, &moved.live_nodes, &n.addr(), restrict)
            {
                self.ips.insert(n.addr());
                moved.live_nodes.push(n);
            } else {
                dropped += usize::from(!push_replacement(&mut moved.replacements, n, bucket_size));
            }
        }

        debug!(
            bucket = bi,
            kept = keep.live_nodes.len(),
            moved = moved.live_nodes.len(),
            dropped,
            "split routing table bucket"
        );
        self.buckets[bi] = keep;
        self.buckets.push(moved);
    }

    /// Promote pinged replacements (best first) into free live slots,
    /// skipping any whose IP is already live.
    fn fill_from_replacements(&mut self, bi: usize) {
        let limit = self.bucket_limit(bi);
        let restrict = self.restrict_routing_ips;
        let b = &mut self.buckets[bi];
        if b.live_nodes.len() >= limit {
            return;
        }
        b.replacements.sort_by(|x, y| x.quality_cmp(y));
        while b.live_nodes.len() < limit {
            let Some(j) = b
                .replacements
                .iter()
                .position(|n| n.pinged() && can_go_live(&self.ips, &b.live_nodes, &n.addr(), restrict))
            else {
                break;
            };
            let n = b.replacements.remove(j);
            self.ips.insert(n.addr());
            b.live_nodes.push(n);
        }
    }

    /// Drop the last bucket if it holds nothing at all.
    fn prune_empty_bucket(&mut self) {
        if let Some(last) = self.buckets.last() {
            if last.live_nodes.is_empty() && last.replacements.is_empty() {
                self.buckets.pop();
            }
        }
    }

    /// Record a timeout for `id` at `endpoint`. Entries that were never
    /// pinged, or that reach `max_fail_count`, are evicted.
    pub fn node_failed(&mut self, id: &NodeId, endpoint: &SocketAddr) {
        self.node_failed_impl(id, endpoint);
        self.check_invariant();
    }

    fn node_failed_impl(&mut self, id: &NodeId, endpoint: &SocketAddr) {
        if *id == self.id || self.buckets.is_empty() {
            return;
        }
        let bi = self.bucket_index_for(id);
        let max_fail = self.max_fail_count;
        let b = &mut self.buckets[bi];

        if let Some(j) = b.live_nodes.iter().position(|n| n.id == *id) {
            // another endpoint claiming this ID says nothing about our entry
            if b.live_nodes[j].endpoint != *endpoint {
                return;
            }
            let n = &mut b.live_nodes[j];
            n.timed_out();
            if n.fail_count() >= max_fail || !n.pinged() {
                let removed = b.live_nodes.remove(j);
                self.ips.erase(&removed.addr());
                trace!(
                    id = hex::encode(&removed.id.as_bytes()[..8]),
                    endpoint = %removed.endpoint,
                    "evicted failing node"
                );
                self.fill_from_replacements(bi);
                self.prune_empty_bucket();
            }
            return;
        }

        if let Some(j) = b.replacements.iter().position(|n| n.id == *id) {
            if b.replacements[j].endpoint != *endpoint {
                return;
            }
            let n = &mut b.replacements[j];
            n.timed_out();
            if n.fail_count() >= max_fail || !n.pinged() {
                b.replacements.remove(j);
                self.prune_empty_bucket();
            }
        }
    }

    /// Adopt a new own ID and re-insert every known node under it: live
    /// nodes first, then replacements.
    pub fn update_node_id(&mut self, id: NodeId) {
        self.id = id;
        self.ips.clear();
        let old = std::mem::take(&mut self.buckets);
        for b in &old {
            for n in &b.live_nodes {
                self.add_node(n.clone());
            }
        }
        for b in &old {
            for n in &b.replacements {
                self.add_node(n.clone());
            }
        }
    }

    fn check_invariant(&self) {
        if cfg!(debug_assertions) {
            let mut mirror = IpSet::new();
            for (bi, b) in self.buckets.iter().enumerate() {
                debug_assert!(b.live_nodes.len() <= self.bucket_limit(bi));
                debug_assert!(b.replacements.len() <= self.bucket_size);
                for n in &b.live_nodes {
                    mirror.insert(n.addr());
                }
            }
            debug_assert_eq!(mirror.len(), self.ips.len());
            debug_assert!(mirror.iter().all(|(ip, n)| self.ips.count(ip) == n));
            debug_assert!(self.ips.iter().all(|(_, n)| n == 1));
        }
    }
}

// ============================================================================
// Replacement policy
// ============================================================================

/// Choose which entry of a full `bucket` the candidate `e` should replace.
///
/// 1. The entry with the most failures, if any has failed at all.
/// 2. Otherwise entries are grouped by [`classify_prefix`] slot. If `e`'s
///    slot is occupied, its worst occupant is replaced only when `e` ranks
///    strictly better. If the slot is empty, the worst entry among slots
///    holding duplicates is replaced.
///
/// Returns `None` when the bucket is better off unchanged.
pub fn replace_node_impl(
    e: &NodeEntry,
    bucket: &[NodeEntry],
    bucket_index: usize,
    bucket_size_limit: usize,
    last_bucket: bool,
) -> Option<usize> {
    let (worst_fail, fails) = bucket
        .iter()
        .enumerate()
        .map(|(j, n)| (j, n.fail_count()))
        .max_by_key(|&(_, f)| f)?;
    if fails > 0 {
        return Some(worst_fail);
    }

    let slots = bucket_size_limit.clamp(1, 256);
    let to_add = classify_prefix(bucket_index, last_bucket, slots, &e.id) as usize;
    let mut by_prefix: Vec<Vec<usize>> = vec![Vec::new(); slots];
    for (j, n) in bucket.iter().enumerate() {
        let p = classify_prefix(bucket_index, last_bucket, slots, &n.id) as usize;
        by_prefix[p].push(j);
    }

    let worst = |indices: &mut dyn Iterator<Item = usize>| {
        indices.max_by(|&a, &b| bucket[a].quality_cmp(&bucket[b]))
    };

    if !by_prefix[to_add].is_empty() {
        let j = worst(&mut by_prefix[to_add].iter().copied())?;
        return (e.quality_cmp(&bucket[j]) == std::cmp::Ordering::Less).then_some(j);
    }

    worst(
        &mut by_prefix
            .iter()
            .filter(|slot| slot.len() > 1)
            .flat_map(|slot| slot.iter().copied()),
    )
}

/// A replacement at `addr` may join `live` only if no live entry anywhere
/// has its IP and, when restricted, none in `live` shares its subnet.
fn can_go_live(ips: &IpSet, live: &[NodeEntry], addr: &IpAddr, restrict: bool) -> bool {
    !ips.exists(addr) && !(restrict && live.iter().any(|n| compare_ip_cidr(&n.addr(), addr)))
}

/// Push into a bounded replacement cache, displacing an unpinged entry for a
/// pinged one. Returns false if `n` was dropped.
fn push_replacement(rb: &mut Vec<NodeEntry>, n: NodeEntry, cap: usize) -> bool {
    if rb.len() < cap {
        rb.push(n);
        return true;
    }
    if n.pinged() {
        if let Some(j) = rb.iter().position(|r| !r.pinged()) {
            rb[j] = n;
            return true;
        }
    }
    false
}

/// At least two thirds of `bucket` carry BEP 42-verified IDs.
fn mostly_verified_nodes(bucket: &[NodeEntry]) -> bool {
    let verified = bucket.iter().filter(|n| n.verified).count();
    if verified == 0 && !bucket.is_empty() {
        return false;
    }
    verified >= bucket.len() * 2 / 3
}

/// True if `bucket` plus `id` all fall on the same side of bit
/// `bucket_index`, so splitting would leave one half empty.
fn all_in_same_bucket(bucket: &[NodeEntry], id: &NodeId, bucket_index: usize) -> bool {
    let side = id.bit(bucket_index);
    bucket.iter().all(|n| n.id.bit(bucket_index) == side)
}
