//! Address bookkeeping for the routing table's Sybil guard.
//!
//! [`IpSet`] is a multiset mirroring the addresses of every live routing-table
//! entry. [`compare_ip_cidr`] decides whether two addresses are close enough
//! to be considered the same operator (/24 for IPv4, /64 for IPv6).

use std::collections::HashMap;
use std::net::IpAddr;

/// Bits that may differ before two addresses count as separate networks.
const CIDR_CUTOFF_V4: u32 = 8;
const CIDR_CUTOFF_V6: u32 = 64;

/// Number of low-order bits in which `a` and `b` differ, counted from the
/// first differing bit. Mixed families are maximally distant.
pub fn cidr_distance(a: &IpAddr, b: &IpAddr) -> u32 {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => {
            32 - (u32::from(*a) ^ u32::from(*b)).leading_zeros()
        }
        (IpAddr::V6(a), IpAddr::V6(b)) => {
            128 - (u128::from(*a) ^ u128::from(*b)).leading_zeros()
        }
        _ => 128,
    }
}

/// True when `a` and `b` share a /24 (IPv4) or /64 (IPv6) prefix.
pub fn compare_ip_cidr(a: &IpAddr, b: &IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(_), IpAddr::V4(_)) => cidr_distance(a, b) <= CIDR_CUTOFF_V4,
        (IpAddr::V6(_), IpAddr::V6(_)) => cidr_distance(a, b) <= CIDR_CUTOFF_V6,
        _ => false,
    }
}

/// Multiset of addresses.
#[derive(Debug, Clone, Default)]
pub struct IpSet {
    counts: HashMap<IpAddr, usize>,
    total: usize,
}

impl IpSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ip: IpAddr) {
        *self.counts.entry(ip).or_insert(0) += 1;
        self.total += 1;
    }

    /// Remove one occurrence of `ip`. Removing an absent address is a no-op.
    pub fn erase(&mut self, ip: &IpAddr) {
        if let Some(count) = self.counts.get_mut(ip) {
            *count -= 1;
            self.total -= 1;
            if *count == 0 {
                self.counts.remove(ip);
            }
        }
    }

    pub fn exists(&self, ip: &IpAddr) -> bool {
        self.counts.contains_key(ip)
    }

    pub fn count(&self, ip: &IpAddr) -> usize {
        self.counts.get(ip).copied().unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.total = 0;
    }

    /// Total number of occurrences.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Occurrence counts per distinct address.
    pub fn iter(&self) -> impl Iterator<Item = (&IpAddr, usize)> {
        self.counts.iter().map(|(ip, n)| (ip, *n))
    }
}
