//! A single routing-table entry.

use std::cmp::Ordering;
use std::net::{IpAddr, SocketAddr};

use tokio::time::Instant;

use crate::node_id::{verify_id, NodeId};

/// Round-trip time placeholder for nodes we have never measured.
pub const RTT_UNKNOWN: u16 = 0xffff;

/// `timeout_count` sentinel meaning the node has never answered us.
const NEVER_PINGED: u8 = 0xff;

/// Highest fail count we record; keeps clear of the sentinel.
const MAX_TIMEOUT_COUNT: u8 = 0xfe;

#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub id: NodeId,
    pub endpoint: SocketAddr,
    /// Smoothed round-trip time in milliseconds.
    pub rtt: u16,
    /// Whether `id` satisfies BEP 42 for `endpoint`.
    pub verified: bool,
    pub first_seen: Instant,
    /// `None` until we have queried the node.
    pub last_queried: Option<Instant>,
    timeout_count: u8,
}

impl NodeEntry {
    pub fn new(id: NodeId, endpoint: SocketAddr, rtt: u16, pinged: bool) -> Self {
        let now = Instant::now();
        Self {
            id,
            endpoint,
            rtt,
            verified: verify_id(&id, &endpoint.ip()),
            first_seen: now,
            last_queried: if pinged { Some(now) } else { None },
            timeout_count: if pinged { 0 } else { NEVER_PINGED },
        }
    }

    #[inline]
    pub fn addr(&self) -> IpAddr {
        self.endpoint.ip()
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.endpoint.port()
    }

    /// The node has answered at least one of our queries.
    #[inline]
    pub fn pinged(&self) -> bool {
        self.timeout_count != NEVER_PINGED
    }

    pub fn set_pinged(&mut self) {
        if self.timeout_count == NEVER_PINGED {
            self.timeout_count = 0;
        }
    }

    /// Pinged and no timeouts since the last answer.
    #[inline]
    pub fn confirmed(&self) -> bool {
        self.timeout_count == 0
    }

    pub fn fail_count(&self) -> u8 {
        if self.pinged() {
            self.timeout_count
        } else {
            0
        }
    }

    pub fn timed_out(&mut self) {
        if self.pinged() && self.timeout_count < MAX_TIMEOUT_COUNT {
            self.timeout_count += 1;
        }
    }

    pub fn reset_fail_count(&mut self) {
        if self.pinged() {
            self.timeout_count = 0;
        }
    }

    /// Fold a new sample into the smoothed RTT (2/3 old, 1/3 new).
    pub fn update_rtt(&mut self, new_rtt: u16) {
        if new_rtt == RTT_UNKNOWN {
            return;
        }
        if self.rtt == RTT_UNKNOWN {
            self.rtt = new_rtt;
        } else {
            self.rtt = ((self.rtt as u32 * 2 / 3) + (new_rtt as u32 / 3)) as u16;
        }
    }

    /// Quality ordering used to pick eviction victims. `Less` is better:
    /// verified beats unverified, then lower RTT wins.
    pub fn quality_cmp(&self, other: &NodeEntry) -> Ordering {
        other
            .verified
            .cmp(&self.verified)
            .then(self.rtt.cmp(&other.rtt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_id::generate_random_id;

    fn ep(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn timeout_counter_tracks_ping_state() {
        let mut e = NodeEntry::new(generate_random_id(), ep("1.2.3.4:6881"), RTT_UNKNOWN, false);
        assert!(!e.pinged());
        assert!(!e.confirmed());
        assert_eq!(e.fail_count(), 0);
        e.timed_out();
        assert_eq!(e.fail_count(), 0);

        e.set_pinged();
        assert!(e.confirmed());
        e.timed_out();
        e.timed_out();
        assert_eq!(e.fail_count(), 2);
        assert!(!e.confirmed());
        e.reset_fail_count();
        assert!(e.confirmed());
    }

    #[test]
    fn timeout_counter_saturates_below_sentinel() {
        let mut e = NodeEntry::new(generate_random_id(), ep("1.2.3.4:6881"), 10, true);
        for _ in 0..300 {
            e.timed_out();
        }
        assert!(e.pinged());
        assert_eq!(e.fail_count(), MAX_TIMEOUT_COUNT);
    }

    #[test]
    fn rtt_is_smoothed() {
        let mut e = NodeEntry::new(generate_random_id(), ep("1.2.3.4:6881"), RTT_UNKNOWN, true);
        e.update_rtt(RTT_UNKNOWN);
        assert_eq!(e.rtt, RTT_UNKNOWN);
        e.update_rtt(300);
        assert_eq!(e.rtt, 300);
        e.update_rtt(0);
        assert_eq!(e.rtt, 200);
    }

    #[test]
    fn verified_nodes_rank_ahead_of_fast_ones() {
        let mut a = NodeEntry::new(generate_random_id(), ep("1.2.3.4:1"), 500, true);
        let mut b = NodeEntry::new(generate_random_id(), ep("1.2.3.5:1"), 10, true);
        a.verified = true;
        b.verified = false;
        assert_eq!(a.quality_cmp(&b), Ordering::Less);
        b.verified = true;
        assert_eq!(a.quality_cmp(&b), Ordering::Greater);
    }
}
