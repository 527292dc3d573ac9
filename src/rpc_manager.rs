//! # Outstanding Query Tracking
//!
//! Every query we send gets a 2-byte transaction ID and an entry in the
//! outstanding table. Replies are matched back to it by transaction ID and
//! source IP; the entry remembers which traversal (if any) issued the query.
//!
//! ## Timeouts
//!
//! | Stage | Default | Effect |
//! |-------|---------|--------|
//! | Short | 2 s | Traversal may open one more slot |
//! | Full | 10 s | Query counts as failed and is dropped |

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::msg::{bytes, Dict, DictExt, Message, Value};
use crate::node_id::NodeId;
use crate::protocols::SocketManager;
use crate::settings::DhtSettings;
use crate::traversal::TraversalId;

/// Maximum queries in flight at once.
/// SECURITY: bounds the outstanding table no matter how many lookups run.
pub const MAX_OUTSTANDING: usize = 4096;

/// A query waiting for its reply.
#[derive(Debug, Clone)]
pub struct OutstandingQuery {
    /// Traversal that issued the query. `None` for fire-and-forget pings.
    pub traversal: Option<TraversalId>,
    pub endpoint: SocketAddr,
    /// ID we expect to answer, if we knew it when sending.
    pub node_id: Option<NodeId>,
    pub method: &'static str,
    pub sent: Instant,
    short_timeout: bool,
}

impl OutstandingQuery {
    pub fn new(traversal: Option<TraversalId>, endpoint: SocketAddr, node_id: Option<NodeId>, method: &'static str) -> Self {
        Self {
            traversal,
            endpoint,
            node_id,
            method,
            sent: Instant::now(),
            short_timeout: false,
        }
    }
}

/// Result of one timeout scan.
#[derive(Debug, Default)]
pub struct Timeouts {
    /// Queries past the short timeout, reported once each. Still outstanding.
    pub short: Vec<OutstandingQuery>,
    /// Queries past the full timeout. Removed.
    pub full: Vec<OutstandingQuery>,
}

pub struct RpcManager {
    our_id: NodeId,
    read_only: bool,
    short_timeout: Duration,
    timeout: Duration,
    outstanding: HashMap<u16, OutstandingQuery>,
    next_tid: u16,
}

impl RpcManager {
    pub fn new(our_id: NodeId, settings: &DhtSettings) -> Self {
        Self {
            our_id,
            read_only: settings.read_only,
            short_timeout: settings.query_short_timeout,
            timeout: settings.query_timeout,
            outstanding: HashMap::new(),
            next_tid: rand::random(),
        }
    }

    pub fn set_our_id(&mut self, id: NodeId) {
        self.our_id = id;
    }

    pub fn num_outstanding(&self) -> usize {
        self.outstanding.len()
    }

    fn allocate_tid(&mut self) -> Option<u16> {
        if self.outstanding.len() >= MAX_OUTSTANDING {
            return None;
        }
        loop {
            let tid = self.next_tid;
            self.next_tid = self.next_tid.wrapping_add(1);
            if !self.outstanding.contains_key(&tid) {
                return Some(tid);
            }
        }
    }

    /// Send `query` (which must carry `q` and `a`) to `dest`.
    ///
    /// Fills in `t`, `y`, `a.id` and, for read-only nodes, `a.ro`. Returns
    /// false when the query was not sent; nothing is tracked in that case.
    pub fn invoke(
        &mut self,
        mut query: Dict,
        dest: SocketAddr,
        mut observer: OutstandingQuery,
        socket: &mut dyn SocketManager,
    ) -> bool {
        if !socket.has_quota() {
            trace!(endpoint = %dest, method = observer.method, "no upload quota for query");
            return false;
        }
        let Some(tid) = self.allocate_tid() else {
            trace!(endpoint = %dest, "outstanding query table full");
            return false;
        };

        query.set("y", bytes("q"));
        query.set("t", bytes(tid.to_be_bytes().to_vec()));
        let mut args = match query.remove(b"a".as_slice()) {
            Some(Value::Dict(a)) => a,
            _ => Dict::new(),
        };
        args.set("id", bytes(self.our_id.as_bytes().to_vec()));
        query.set("a", Value::Dict(args));
        if self.read_only {
            query.set("ro", Value::Int(1));
        }

        if !socket.send_packet(dest, &query) {
            return false;
        }
        observer.endpoint = dest;
        observer.sent = Instant::now();
        self.outstanding.insert(tid, observer);
        true
    }

    /// Match a reply or error to its query.
    ///
    /// Returns the query and its round-trip time. Replies with an unknown
    /// transaction ID, or from an IP other than the one we queried, are
    /// ignored and leave the query outstanding.
    pub fn incoming(&mut self, msg: &Message, now: Instant) -> Option<(OutstandingQuery, Duration)> {
        let tid = match msg.transaction_id() {
            Some(&[a, b]) => u16::from_be_bytes([a, b]),
            _ => {
                trace!(endpoint = %msg.addr, "reply with malformed transaction id");
                return None;
            }
        };
        match self.outstanding.get(&tid) {
            Some(q) if q.endpoint.ip() == msg.addr.ip() => {}
            Some(q) => {
                trace!(expected = %q.endpoint, got = %msg.addr, "reply from unexpected address");
                return None;
            }
            None => {
                trace!(endpoint = %msg.addr, tid, "reply to unknown transaction");
                return None;
            }
        }
        let q = self.outstanding.remove(&tid)?;
        let rtt = now.saturating_duration_since(q.sent);
        Some((q, rtt))
    }

    /// Scan for expired queries.
    pub fn tick(&mut self, now: Instant) -> Timeouts {
        let mut out = Timeouts::default();
        let mut expired = Vec::new();
        for (tid, q) in self.outstanding.iter_mut() {
            let age = now.saturating_duration_since(q.sent);
            if age >= self.timeout {
                expired.push(*tid);
            } else if age >= self.short_timeout && !q.short_timeout {
                q.short_timeout = true;
                out.short.push(q.clone());
            }
        }
        for tid in expired {
            if let Some(q) = self.outstanding.remove(&tid) {
                trace!(endpoint = %q.endpoint, method = q.method, "query timed out");
                out.full.push(q);
            }
        }
        out
    }

    /// Drop every query issued by `traversal` without reporting anything.
    pub fn cancel_traversal(&mut self, traversal: TraversalId) {
        self.outstanding.retain(|_, q| q.traversal != Some(traversal));
    }

    /// `endpoint` is known to be down; fail all queries to it now.
    pub fn unreachable(&mut self, endpoint: &SocketAddr) -> Vec<OutstandingQuery> {
        let tids: Vec<u16> = self
            .outstanding
            .iter()
            .filter(|(_, q)| q.endpoint == *endpoint)
            .map(|(tid, _)| *tid)
            .collect();
        tids.into_iter().filter_map(|tid| self.outstanding.remove(&tid)).collect()
    }

    /// Forget everything in flight.
    pub fn clear(&mut self) {
        self.outstanding.clear();
    }
}
