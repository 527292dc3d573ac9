//! Runtime configuration for a DHT node.

use std::time::Duration;

/// Tunables shared by the routing table, dispatcher, traversals and storage.
///
/// The defaults match what mainline clients deploy with.
#[derive(Debug, Clone)]
pub struct DhtSettings {
    /// Base bucket size (k). Must be a power of two.
    pub bucket_size: usize,
    /// Concurrent outstanding queries per traversal (alpha).
    pub search_branching: usize,
    /// Timeouts after which a live node is evicted.
    pub max_fail_count: u8,
    /// Peers returned in a single `get_peers` reply.
    pub max_peers_reply: usize,
    /// Distinct info-hashes we track announces for.
    pub max_torrents: usize,
    /// Stored immutable items, and separately mutable items.
    pub max_dht_items: usize,
    /// Peers stored per info-hash.
    pub max_peers: usize,
    /// Refuse routing entries whose IP shares a /24 (/64) with an existing one.
    pub restrict_routing_ips: bool,
    /// Same restriction applied to traversal candidates.
    pub restrict_search_ips: bool,
    /// Widen the first buckets to 16/8/4/2 times `bucket_size`.
    pub extended_routing_table: bool,
    /// Keep `search_branching` requests in flight at the top of the result
    /// list rather than anywhere in it.
    pub aggressive_lookups: bool,
    /// Only split buckets for verified IDs when most entries are verified.
    pub prefer_verified_node_ids: bool,
    /// Reject queries from nodes whose ID does not match their IP (BEP 42).
    pub enforce_node_id: bool,
    /// Never answer queries, and tag our own queries with `ro`.
    pub read_only: bool,
    /// How long an abusive IP stays banned.
    pub block_timeout: Duration,
    /// Messages per second tolerated from one IP before banning.
    pub block_ratelimit: u32,
    /// IPs tracked by the DoS blocker.
    pub dos_blocker_size: usize,
    /// Lifetime of stored items; zero keeps them until evicted.
    pub item_lifetime: Duration,
    /// Outgoing byte budget per second.
    pub upload_rate_limit: usize,
    /// How long a BEP 51 sample is reused.
    pub sample_infohashes_interval: Duration,
    /// Maximum info-hashes in a BEP 51 sample.
    pub max_infohashes_sample_count: usize,
    /// After this long a query frees its traversal slot.
    pub query_short_timeout: Duration,
    /// After this long a query counts as failed.
    pub query_timeout: Duration,
}

impl Default for DhtSettings {
    fn default() -> Self {
        Self {
            bucket_size: 8,
            search_branching: 5,
            max_fail_count: 20,
            max_peers_reply: 100,
            max_torrents: 2000,
            max_dht_items: 700,
            max_peers: 500,
            restrict_routing_ips: true,
            restrict_search_ips: true,
            extended_routing_table: true,
            aggressive_lookups: true,
            prefer_verified_node_ids: true,
            enforce_node_id: false,
            read_only: false,
            block_timeout: Duration::from_secs(5 * 60),
            block_ratelimit: 5,
            dos_blocker_size: 2048,
            item_lifetime: Duration::ZERO,
            upload_rate_limit: 8000,
            sample_infohashes_interval: Duration::from_secs(6 * 60 * 60),
            max_infohashes_sample_count: 20,
            query_short_timeout: Duration::from_secs(2),
            query_timeout: Duration::from_secs(10),
        }
    }
}
