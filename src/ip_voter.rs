//! External address voting.
//!
//! Replies carry an `ip` key telling us how the responder sees us (BEP 42).
//! Each distinct source IP gets one vote; the address with the most votes is
//! our external address.

use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::node_id::is_local;

/// Voters remembered at once.
/// SECURITY: one host cannot stuff the ballot, and the tally stays bounded.
const MAX_VOTERS: usize = 50;

pub struct ExternalIpVoter {
    votes: LruCache<IpAddr, IpAddr>,
    winner: Option<IpAddr>,
}

impl Default for ExternalIpVoter {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalIpVoter {
    pub fn new() -> Self {
        Self {
            votes: LruCache::new(NonZeroUsize::new(MAX_VOTERS).expect("MAX_VOTERS must be non-zero")),
            winner: None,
        }
    }

    pub fn external_address(&self) -> Option<IpAddr> {
        self.winner
    }

    /// Record that `source` sees us as `addr`. Returns true if the winning
    /// address changed.
    pub fn cast_vote(&mut self, addr: IpAddr, source: IpAddr) -> bool {
        if addr.is_unspecified() || is_local(&addr) {
            return false;
        }
        self.votes.put(source, addr);

        let mut tally: HashMap<IpAddr, usize> = HashMap::new();
        for (_, voted) in self.votes.iter() {
            *tally.entry(*voted).or_default() += 1;
        }
        let current = self.winner.and_then(|w| tally.get(&w).copied()).unwrap_or(0);
        let best = tally.into_iter().max_by_key(|(_, n)| *n);

        match best {
            // the incumbent keeps ties
            Some((ip, n)) if n > current && Some(ip) != self.winner => {
                self.winner = Some(ip);
                true
            }
            _ => false,
        }
    }
}
