//! # DHT Storage
//!
//! [`DhtStorage`] is the contract between the query dispatcher and whatever
//! keeps announced peers and BEP 44 items. [`DefaultStorage`] is the in-memory
//! implementation used unless the embedder supplies its own.
//!
//! ## Limits
//!
//! | Table | Cap | Eviction |
//! |-------|-----|----------|
//! | torrents | `max_torrents` | torrent with the fewest peers |
//! | peers per torrent | `max_peers` | coin flip between newcomer and a neighbour |
//! | immutable items | `max_dht_items` | least important item |
//! | mutable items | `max_dht_items` | least important item |
//!
//! Item importance is `announcers / 5 - min_distance_exp(target, our_ids)`:
//! every five distinct announcers buy one bit of distance from our IDs.
//!
//! Peers expire [`PEER_TIMEOUT`] after their last announce. Items expire
//! after `item_lifetime` when it is non-zero, never sooner than two hours.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};

use rand::Rng;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::item::{hash, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::msg::Value;
use crate::node_id::{min_distance_exp, NodeId};
use crate::settings::DhtSettings;

/// Announce interval peers are expected to keep, in minutes.
const ANNOUNCE_INTERVAL_MINS: u64 = 30;

/// Peers not re-announced within one and a half intervals are dropped.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(ANNOUNCE_INTERVAL_MINS * 60 * 3 / 2);

/// Floor for a non-zero `item_lifetime`.
const MIN_ITEM_LIFETIME: Duration = Duration::from_secs(120 * 60);

/// Longest torrent name we keep.
const MAX_NAME_LEN: usize = 100;

/// Ceilings for BEP 51 sampling parameters.
const SAMPLE_INTERVAL_MAX: Duration = Duration::from_secs(21600);
const SAMPLE_COUNT_MAX: usize = 20;

// ============================================================================
// Bloom filter
// ============================================================================

/// Fixed-size bloom filter keyed by SHA-1 digests (BEP 33 layout).
///
/// Each key sets two bits, taken from the first two little-endian 16-bit
/// words of the digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter<const N: usize> {
    bits: [u8; N],
}

impl<const N: usize> Default for BloomFilter<N> {
    fn default() -> Self {
        Self { bits: [0u8; N] }
    }
}

impl<const N: usize> BloomFilter<N> {
    fn indices(key: &NodeId) -> [usize; 2] {
        let k = key.as_bytes();
        let m = N * 8;
        [
            usize::from(u16::from_le_bytes([k[0], k[1]])) % m,
            usize::from(u16::from_le_bytes([k[2], k[3]])) % m,
        ]
    }

    pub fn set(&mut self, key: &NodeId) {
        for idx in Self::indices(key) {
            self.bits[idx / 8] |= 1 << (idx & 7);
        }
    }

    pub fn find(&self, key: &NodeId) -> bool {
        Self::indices(key)
            .iter()
            .all(|&idx| self.bits[idx / 8] & (1 << (idx & 7)) != 0)
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.bits
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Some(Self { bits: bytes.try_into().ok()? })
    }

    /// Fold another filter's bits into this one.
    pub fn merge(&mut self, other: &Self) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= *b;
        }
    }

    /// Estimated number of distinct keys inserted.
    pub fn size(&self) -> f64 {
        let m = (N * 8) as f64;
        let zeros: u32 = self.bits.iter().map(|b| b.count_zeros()).sum();
        let c = f64::from(zeros).min(m - 1.0);
        (c / m).ln() / (2.0 * (-1.0 / m).ln_1p())
    }
}

/// SHA-1 of the raw address bytes, the key used for announcer and scrape filters.
pub fn hash_address(addr: &IpAddr) -> NodeId {
    match addr {
        IpAddr::V4(v4) => hash(&v4.octets()),
        IpAddr::V6(v6) => hash(&v6.octets()),
    }
}

// ============================================================================
// Contract
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageCounters {
    pub torrents: usize,
    pub peers: usize,
    pub immutable_data: usize,
    pub mutable_data: usize,
}

/// Answer to a `get_peers` lookup for a known info-hash.
#[derive(Debug, Clone, Default)]
pub struct PeersReply {
    pub name: Option<Vec<u8>>,
    pub peers: Vec<SocketAddr>,
    /// BEP 33 `BFsd`, present for scrapes.
    pub seeds_filter: Option<Vec<u8>>,
    /// BEP 33 `BFpe`, present for scrapes.
    pub downloaders_filter: Option<Vec<u8>>,
}

/// Stored mutable item as returned to a `get`. Only `seq` is always present.
#[derive(Debug, Clone)]
pub struct MutableItemReply {
    pub seq: i64,
    pub value: Option<Value>,
    pub signature: Option<[u8; SIGNATURE_LEN]>,
    pub public_key: Option<[u8; PUBLIC_KEY_LEN]>,
}

/// BEP 51 sample.
#[derive(Debug, Clone, Default)]
pub struct InfohashesSample {
    pub interval: Duration,
    pub num: usize,
    pub samples: Vec<NodeId>,
}

pub trait DhtStorage: Send {
    /// Our node IDs, used to rank items by how well they fit this node.
    fn update_node_ids(&mut self, ids: Vec<NodeId>);

    /// Peers for `info_hash`, or `None` if we know nothing about it.
    fn get_peers(&self, info_hash: &NodeId, noseed: bool, scrape: bool) -> Option<PeersReply>;

    fn announce_peer(&mut self, info_hash: &NodeId, endpoint: SocketAddr, name: &[u8], seed: bool);

    fn get_immutable_item(&self, target: &NodeId) -> Option<Value>;

    fn put_immutable_item(&mut self, target: &NodeId, value: Value, addr: IpAddr);

    fn get_mutable_item_seq(&self, target: &NodeId) -> Option<i64>;

    /// Stored item for `target`. Value, signature and key are included when
    /// `force_fill` is set or `0 <= seq < stored seq`.
    fn get_mutable_item(&self, target: &NodeId, seq: i64, force_fill: bool) -> Option<MutableItemReply>;

    #[allow(clippy::too_many_arguments)]
    fn put_mutable_item(
        &mut self,
        target: &NodeId,
        value: Value,
        signature: [u8; SIGNATURE_LEN],
        seq: i64,
        public_key: [u8; PUBLIC_KEY_LEN],
        salt: &[u8],
        addr: IpAddr,
    );

    fn get_infohashes_sample(&mut self) -> InfohashesSample;

    /// Expire peers and items.
    fn tick(&mut self);

    fn counters(&self) -> StorageCounters;
}

// ============================================================================
// Default storage
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct PeerEntry {
    added: Instant,
    seed: bool,
}

#[derive(Debug, Default)]
struct TorrentEntry {
    name: Vec<u8>,
    peers: BTreeMap<SocketAddr, PeerEntry>,
}

#[derive(Debug)]
struct StoredItem {
    value: Value,
    ips: BloomFilter<128>,
    last_seen: Instant,
    num_announcers: i32,
}

impl StoredItem {
    fn new(value: Value) -> Self {
        Self {
            value,
            ips: BloomFilter::default(),
            last_seen: Instant::now(),
            num_announcers: 0,
        }
    }

    fn touch(&mut self, addr: &IpAddr) {
        self.last_seen = Instant::now();
        let key = hash_address(addr);
        if !self.ips.find(&key) {
            self.ips.set(&key);
            self.num_announcers += 1;
        }
    }
}

#[derive(Debug)]
struct StoredMutable {
    item: StoredItem,
    signature: [u8; SIGNATURE_LEN],
    seq: i64,
    public_key: [u8; PUBLIC_KEY_LEN],
}

#[derive(Debug, Default)]
struct SampleCache {
    created: Option<Instant>,
    samples: Vec<NodeId>,
}

pub struct DefaultStorage {
    max_torrents: usize,
    max_peers: usize,
    max_peers_reply: usize,
    max_dht_items: usize,
    item_lifetime: Duration,
    sample_interval: Duration,
    sample_count: usize,
    node_ids: Vec<NodeId>,
    torrents: HashMap<NodeId, TorrentEntry>,
    immutable: HashMap<NodeId, StoredItem>,
    mutable: HashMap<NodeId, StoredMutable>,
    sample: SampleCache,
    counters: StorageCounters,
}

impl DefaultStorage {
    pub fn new(settings: &DhtSettings) -> Self {
        Self {
            max_torrents: settings.max_torrents,
            max_peers: settings.max_peers,
            max_peers_reply: settings.max_peers_reply,
            max_dht_items: settings.max_dht_items,
            item_lifetime: settings.item_lifetime,
            sample_interval: settings.sample_infohashes_interval.min(SAMPLE_INTERVAL_MAX),
            sample_count: settings.max_infohashes_sample_count.min(SAMPLE_COUNT_MAX),
            node_ids: Vec::new(),
            torrents: HashMap::new(),
            immutable: HashMap::new(),
            mutable: HashMap::new(),
            sample: SampleCache::default(),
            counters: StorageCounters::default(),
        }
    }

    fn least_important<'a>(
        node_ids: &[NodeId],
        items: impl Iterator<Item = (&'a NodeId, i32)>,
    ) -> Option<NodeId> {
        items
            .min_by_key(|(target, announcers)| announcers / 5 - min_distance_exp(target, node_ids))
            .map(|(target, _)| *target)
    }

    fn refresh_infohashes_sample(&mut self) {
        let now = Instant::now();
        let max_count = self.sample_count;
        let fresh = self
            .sample
            .created
            .map_or(false, |t| now.saturating_duration_since(t) < self.sample_interval);
        if !self.sample_interval.is_zero() && fresh && self.sample.samples.len() >= max_count {
            return;
        }

        let count = max_count.min(self.torrents.len());
        let mut rng = rand::thread_rng();
        let mut to_pick = count;
        let mut candidates = self.torrents.len();
        let mut samples = Vec::with_capacity(count);
        for key in self.torrents.keys() {
            if to_pick == 0 {
                break;
            }
            // selection sampling: keep with probability to_pick / candidates
            if rng.gen_range(0..candidates) < to_pick {
                samples.push(*key);
                to_pick -= 1;
            }
            candidates -= 1;
        }
        self.sample = SampleCache { created: Some(now), samples };
    }

    fn purge_peers(peers: &mut BTreeMap<SocketAddr, PeerEntry>, now: Instant) -> usize {
        let before = peers.len();
        peers.retain(|_, p| now.saturating_duration_since(p.added) < PEER_TIMEOUT);
        before - peers.len()
    }
}

impl DhtStorage for DefaultStorage {
    fn update_node_ids(&mut self, ids: Vec<NodeId>) {
        self.node_ids = ids;
    }

    fn get_peers(&self, info_hash: &NodeId, noseed: bool, scrape: bool) -> Option<PeersReply> {
        let t = self.torrents.get(info_hash)?;
        let mut reply = PeersReply {
            name: (!t.name.is_empty()).then(|| t.name.clone()),
            ..PeersReply::default()
        };

        if scrape {
            let mut downloaders = BloomFilter::<256>::default();
            let mut seeds = BloomFilter::<256>::default();
            for (addr, p) in &t.peers {
                let key = hash_address(&addr.ip());
                if p.seed {
                    seeds.set(&key);
                } else {
                    downloaders.set(&key);
                }
            }
            reply.seeds_filter = Some(seeds.as_bytes().to_vec());
            reply.downloaders_filter = Some(downloaders.as_bytes().to_vec());
            return Some(reply);
        }

        let mut max = self.max_peers_reply;
        // IPv6 endpoints are three times the size; keep replies similar in bytes
        if t.peers.keys().next().map_or(false, SocketAddr::is_ipv6) {
            max /= 4;
        }
        let to_pick = t.peers.len().min(max);
        let mut rng = rand::thread_rng();
        let mut seen = 0usize;
        for (addr, p) in &t.peers {
            if noseed && p.seed {
                continue;
            }
            seen += 1;
            if reply.peers.len() < to_pick {
                reply.peers.push(*addr);
            } else if to_pick > 0 && rng.gen_range(0..seen) < to_pick {
                let slot = rng.gen_range(0..to_pick);
                reply.peers[slot] = *addr;
            }
        }
        Some(reply)
    }

    fn announce_peer(&mut self, info_hash: &NodeId, endpoint: SocketAddr, name: &[u8], seed: bool) {
        if !self.torrents.contains_key(info_hash) {
            if !self.torrents.is_empty() && self.torrents.len() >= self.max_torrents {
                let victim = self
                    .torrents
                    .iter()
                    .min_by_key(|(_, t)| t.peers.len())
                    .map(|(k, _)| *k);
                if let Some(victim) = victim {
                    if let Some(removed) = self.torrents.remove(&victim) {
                        debug!(
                            info_hash = hex::encode(&victim.as_bytes()[..8]),
                            peers = removed.peers.len(),
                            "evicted torrent from storage"
                        );
                        self.counters.peers -= removed.peers.len();
                        self.counters.torrents -= 1;
                    }
                }
            }
            self.torrents.insert(*info_hash, TorrentEntry::default());
            self.counters.torrents += 1;
        }
        let Some(t) = self.torrents.get_mut(info_hash) else {
            return;
        };

        if !name.is_empty() && t.name.is_empty() {
            t.name = name[..name.len().min(MAX_NAME_LEN)].to_vec();
        }

        let entry = PeerEntry { added: Instant::now(), seed };
        if t.peers.contains_key(&endpoint) {
            t.peers.insert(endpoint, entry);
            return;
        }
        if t.peers.len() >= self.max_peers {
            // at capacity the newcomer and a neighbour get even odds
            if rand::thread_rng().gen_bool(0.5) {
                return;
            }
            let neighbour = t
                .peers
                .range(endpoint..)
                .next()
                .map(|(k, _)| *k)
                .or_else(|| t.peers.keys().next_back().copied());
            if let Some(n) = neighbour {
                t.peers.remove(&n);
                self.counters.peers -= 1;
            }
        }
        t.peers.insert(endpoint, entry);
        self.counters.peers += 1;
    }

    fn get_immutable_item(&self, target: &NodeId) -> Option<Value> {
        self.immutable.get(target).map(|i| i.value.clone())
    }

    fn put_immutable_item(&mut self, target: &NodeId, value: Value, addr: IpAddr) {
        if !self.immutable.contains_key(target) {
            if self.immutable.len() >= self.max_dht_items {
                let victim = Self::least_important(
                    &self.node_ids,
                    self.immutable.iter().map(|(k, v)| (k, v.num_announcers)),
                );
                if let Some(victim) = victim {
                    self.immutable.remove(&victim);
                    self.counters.immutable_data -= 1;
                    debug!(target = hex::encode(&victim.as_bytes()[..8]), "evicted immutable item");
                }
            }
            self.immutable.insert(*target, StoredItem::new(value));
            self.counters.immutable_data += 1;
        }
        if let Some(item) = self.immutable.get_mut(target) {
            item.touch(&addr);
        }
    }

    fn get_mutable_item_seq(&self, target: &NodeId) -> Option<i64> {
        self.mutable.get(target).map(|m| m.seq)
    }

    fn get_mutable_item(&self, target: &NodeId, seq: i64, force_fill: bool) -> Option<MutableItemReply> {
        let m = self.mutable.get(target)?;
        let fill = force_fill || (0 <= seq && seq < m.seq);
        Some(MutableItemReply {
            seq: m.seq,
            value: fill.then(|| m.item.value.clone()),
            signature: fill.then_some(m.signature),
            public_key: fill.then_some(m.public_key),
        })
    }

    fn put_mutable_item(
        &mut self,
        target: &NodeId,
        value: Value,
        signature: [u8; SIGNATURE_LEN],
        seq: i64,
        public_key: [u8; PUBLIC_KEY_LEN],
        _salt: &[u8],
        addr: IpAddr,
    ) {
        match self.mutable.get_mut(target) {
            Some(m) => {
                if m.seq < seq {
                    m.item.value = value;
                    m.seq = seq;
                    m.signature = signature;
                }
            }
            None => {
                if self.mutable.len() >= self.max_dht_items {
                    let victim = Self::least_important(
                        &self.node_ids,
                        self.mutable.iter().map(|(k, v)| (k, v.item.num_announcers)),
                    );
                    if let Some(victim) = victim {
                        self.mutable.remove(&victim);
                        self.counters.mutable_data -= 1;
                        debug!(target = hex::encode(&victim.as_bytes()[..8]), "evicted mutable item");
                    }
                }
                self.mutable.insert(
                    *target,
                    StoredMutable {
                        item: StoredItem::new(value),
                        signature,
                        seq,
                        public_key,
                    },
                );
                self.counters.mutable_data += 1;
            }
        }
        if let Some(m) = self.mutable.get_mut(target) {
            m.item.touch(&addr);
        }
    }

    fn get_infohashes_sample(&mut self) -> InfohashesSample {
        self.refresh_infohashes_sample();
        InfohashesSample {
            interval: self.sample_interval,
            num: self.torrents.len(),
            samples: self.sample.samples.clone(),
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        let mut purged = 0usize;
        let mut emptied = 0usize;
        self.torrents.retain(|_, t| {
            purged += Self::purge_peers(&mut t.peers, now);
            let keep = !t.peers.is_empty();
            emptied += usize::from(!keep);
            keep
        });
        self.counters.peers -= purged;
        self.counters.torrents -= emptied;

        if self.item_lifetime.is_zero() {
            return;
        }
        let lifetime = self.item_lifetime.max(MIN_ITEM_LIFETIME);
        let alive = |last_seen: Instant| now.saturating_duration_since(last_seen) < lifetime;

        let before = self.immutable.len();
        self.immutable.retain(|_, i| alive(i.last_seen));
        self.counters.immutable_data -= before - self.immutable.len();

        let before = self.mutable.len();
        self.mutable.retain(|_, m| alive(m.item.last_seen));
        self.counters.mutable_data -= before - self.mutable.len();
    }

    fn counters(&self) -> StorageCounters {
        self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_id::generate_random_id;

    fn ep(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn storage() -> DefaultStorage {
        let mut s = DefaultStorage::new(&DhtSettings::default());
        s.update_node_ids(vec![generate_random_id()]);
        s
    }

    #[test]
    fn bloom_filter_matches_bep33_layout() {
        let mut bf = BloomFilter::<256>::default();
        let key = NodeId::from_bytes([
            0x01, 0x02, 0x03, 0x04, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ]);
        bf.set(&key);
        // idx1 = 0x0201 = 513, idx2 = 0x0403 = 1027
        assert_eq!(bf.as_bytes()[513 / 8], 1 << (513 % 8));
        assert_eq!(bf.as_bytes()[1027 / 8], 1 << (1027 % 8));
        assert!(bf.find(&key));
    }

    #[test]
    fn bloom_filter_estimates_cardinality() {
        let mut bf = BloomFilter::<256>::default();
        for i in 0..100u16 {
            bf.set(&hash(&i.to_be_bytes()));
        }
        let est = bf.size();
        assert!((80.0..120.0).contains(&est), "estimate {est}");
    }

    #[test]
    fn announce_then_get_peers() {
        let mut s = storage();
        let ih = generate_random_id();
        assert!(s.get_peers(&ih, false, false).is_none());

        s.announce_peer(&ih, ep("1.2.3.4:6881"), b"ubuntu.iso", false);
        s.announce_peer(&ih, ep("5.6.7.8:6881"), b"other", true);
        s.announce_peer(&ih, ep("1.2.3.4:6881"), b"", false);

        let reply = s.get_peers(&ih, false, false).unwrap();
        assert_eq!(reply.name.as_deref(), Some(&b"ubuntu.iso"[..]));
        assert_eq!(reply.peers.len(), 2);

        let noseed = s.get_peers(&ih, true, false).unwrap();
        assert_eq!(noseed.peers, vec![ep("1.2.3.4:6881")]);

        assert_eq!(s.counters().torrents, 1);
        assert_eq!(s.counters().peers, 2);
    }

    #[test]
    fn torrent_name_is_truncated() {
        let mut s = storage();
        let ih = generate_random_id();
        s.announce_peer(&ih, ep("1.2.3.4:1"), &[b'x'; 300], false);
        assert_eq!(s.get_peers(&ih, false, false).unwrap().name.map(|n| n.len()), Some(100));
    }

    #[test]
    fn scrape_returns_filters() {
        let mut s = storage();
        let ih = generate_random_id();
        s.announce_peer(&ih, ep("1.2.3.4:1"), b"", true);
        s.announce_peer(&ih, ep("1.2.3.5:1"), b"", false);
        let reply = s.get_peers(&ih, false, true).unwrap();
        assert!(reply.peers.is_empty());
        let seeds = BloomFilter::<256>::from_bytes(&reply.seeds_filter.unwrap()).unwrap();
        let peers = BloomFilter::<256>::from_bytes(&reply.downloaders_filter.unwrap()).unwrap();
        assert!(seeds.find(&hash_address(&"1.2.3.4".parse().unwrap())));
        assert!(peers.find(&hash_address(&"1.2.3.5".parse().unwrap())));
    }

    #[test]
    fn reply_size_is_capped() {
        let settings = DhtSettings { max_peers_reply: 10, ..DhtSettings::default() };
        let mut s = DefaultStorage::new(&settings);
        let ih = generate_random_id();
        for i in 0..50u16 {
            s.announce_peer(&ih, SocketAddr::new("1.2.3.4".parse().unwrap(), 1000 + i), b"", false);
        }
        assert_eq!(s.get_peers(&ih, false, false).unwrap().peers.len(), 10);

        let ih6 = generate_random_id();
        for i in 0..50u16 {
            s.announce_peer(&ih6, SocketAddr::new("2001:db8::1".parse().unwrap(), 1000 + i), b"", false);
        }
        assert_eq!(s.get_peers(&ih6, false, false).unwrap().peers.len(), 2);
    }

    #[test]
    fn torrent_cap_evicts_smallest() {
        let settings = DhtSettings { max_torrents: 2, ..DhtSettings::default() };
        let mut s = DefaultStorage::new(&settings);
        let big = generate_random_id();
        let small = generate_random_id();
        s.announce_peer(&big, ep("1.1.1.1:1"), b"", false);
        s.announce_peer(&big, ep("1.1.1.2:1"), b"", false);
        s.announce_peer(&small, ep("1.1.1.3:1"), b"", false);

        let newcomer = generate_random_id();
        s.announce_peer(&newcomer, ep("1.1.1.4:1"), b"", false);
        assert!(s.get_peers(&small, false, false).is_none());
        assert!(s.get_peers(&big, false, false).is_some());
        assert_eq!(s.counters(), StorageCounters { torrents: 2, peers: 3, ..Default::default() });
    }

    #[test]
    fn peer_cap_holds() {
        let settings = DhtSettings { max_peers: 5, ..DhtSettings::default() };
        let mut s = DefaultStorage::new(&settings);
        let ih = generate_random_id();
        for i in 0..100u16 {
            s.announce_peer(&ih, SocketAddr::new("9.9.9.9".parse().unwrap(), i + 1), b"", false);
        }
        assert_eq!(s.get_peers(&ih, false, false).unwrap().peers.len(), 5);
        assert_eq!(s.counters().peers, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn peers_expire() {
        let mut s = storage();
        let ih = generate_random_id();
        s.announce_peer(&ih, ep("1.2.3.4:1"), b"", false);
        tokio::time::advance(PEER_TIMEOUT - Duration::from_secs(1)).await;
        s.tick();
        assert!(s.get_peers(&ih, false, false).is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        s.tick();
        assert!(s.get_peers(&ih, false, false).is_none());
        assert_eq!(s.counters(), StorageCounters::default());
    }

    #[test]
    fn mutable_items_only_move_forward() {
        let mut s = storage();
        let target = generate_random_id();
        let addr: IpAddr = "1.2.3.4".parse().unwrap();
        s.put_mutable_item(&target, Value::Int(1), [1; 64], 5, [9; 32], b"", addr);
        s.put_mutable_item(&target, Value::Int(2), [2; 64], 4, [9; 32], b"", addr);
        assert_eq!(s.get_mutable_item_seq(&target), Some(5));

        s.put_mutable_item(&target, Value::Int(3), [3; 64], 6, [9; 32], b"", addr);
        let full = s.get_mutable_item(&target, -1, true).unwrap();
        assert_eq!(full.seq, 6);
        assert_eq!(full.value, Some(Value::Int(3)));
        assert_eq!(full.signature, Some([3; 64]));
    }

    #[test]
    fn mutable_get_fills_only_for_older_requests() {
        let mut s = storage();
        let target = generate_random_id();
        s.put_mutable_item(&target, Value::Int(1), [1; 64], 5, [9; 32], b"", "1.2.3.4".parse().unwrap());

        let current = s.get_mutable_item(&target, 5, false).unwrap();
        assert_eq!(current.seq, 5);
        assert!(current.value.is_none());

        let older = s.get_mutable_item(&target, 4, false).unwrap();
        assert!(older.value.is_some());
        assert_eq!(older.public_key, Some([9; 32]));

        let unspecified = s.get_mutable_item(&target, -1, false).unwrap();
        assert!(unspecified.value.is_none());
    }

    #[test]
    fn item_cap_evicts_least_important() {
        let settings = DhtSettings { max_dht_items: 2, ..DhtSettings::default() };
        let mut s = DefaultStorage::new(&settings);
        let own = NodeId::from_bytes([0u8; 20]);
        s.update_node_ids(vec![own]);

        let mut near = [0u8; 20];
        near[19] = 1;
        let near = NodeId::from_bytes(near);
        let far = NodeId::from_bytes([0xff; 20]);
        let mut mid = [0u8; 20];
        mid[10] = 1;
        let mid = NodeId::from_bytes(mid);

        let addr: IpAddr = "1.2.3.4".parse().unwrap();
        s.put_immutable_item(&near, Value::Int(1), addr);
        s.put_immutable_item(&far, Value::Int(2), addr);
        s.put_immutable_item(&mid, Value::Int(3), addr);

        assert!(s.get_immutable_item(&far).is_none());
        assert!(s.get_immutable_item(&near).is_some());
        assert!(s.get_immutable_item(&mid).is_some());
        assert_eq!(s.counters().immutable_data, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn item_lifetime_has_a_floor() {
        let settings = DhtSettings { item_lifetime: Duration::from_secs(60), ..DhtSettings::default() };
        let mut s = DefaultStorage::new(&settings);
        let target = generate_random_id();
        s.put_immutable_item(&target, Value::Int(1), "1.2.3.4".parse().unwrap());

        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        s.tick();
        assert!(s.get_immutable_item(&target).is_some());

        tokio::time::advance(Duration::from_secs(61 * 60)).await;
        s.tick();
        assert!(s.get_immutable_item(&target).is_none());
    }

    #[test]
    fn infohash_sample_is_bounded_and_cached() {
        let mut s = storage();
        for i in 0..50u8 {
            s.announce_peer(&generate_random_id(), SocketAddr::new("1.2.3.4".parse().unwrap(), u16::from(i) + 1), b"", false);
        }
        let first = s.get_infohashes_sample();
        assert_eq!(first.num, 50);
        assert_eq!(first.samples.len(), 20);
        assert_eq!(first.interval, Duration::from_secs(6 * 60 * 60));
        let second = s.get_infohashes_sample();
        assert_eq!(first.samples, second.samples);
    }
}
