//! Per-IP flood protection for incoming packets.
//!
//! Tracks a fixed number of source addresses. Each gets a message counter and
//! a deadline; the message that brings the counter to `rate_limit * 10`
//! before the deadline is dropped and bans the address for `block_timeout`.
//!
//! An untracked address takes an unused slot while any remain. Once the table
//! is full it takes over the slot with the lowest counter (earliest deadline
//! on ties), found by a scan over `dos_blocker_size` slots. Only new addresses
//! pay for the scan; keep the table small.

use std::collections::HashMap;
use std::net::IpAddr;

use tokio::time::{Duration, Instant};
use tracing::warn;

/// Counting window for message rates.
const RATE_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
struct BanEntry {
    src: Option<IpAddr>,
    count: u32,
    limit: Instant,
}

pub struct DosBlocker {
    slots: Vec<BanEntry>,
    index: HashMap<IpAddr, usize>,
    used: usize,
    rate_limit: u32,
    block_timeout: Duration,
}

impl DosBlocker {
    pub fn new(size: usize, rate_limit: u32, block_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            slots: vec![BanEntry { src: None, count: 0, limit: now }; size.max(1)],
            index: HashMap::with_capacity(size),
            used: 0,
            rate_limit,
            block_timeout,
        }
    }

    pub fn set_rate_limit(&mut self, rate_limit: u32) {
        self.rate_limit = rate_limit;
    }

    pub fn set_block_timeout(&mut self, block_timeout: Duration) {
        self.block_timeout = block_timeout;
    }

    /// Account one message from `addr`. Returns false if it must be dropped.
    pub fn allow(&mut self, addr: IpAddr, now: Instant) -> bool {
        let threshold = self.rate_limit.saturating_mul(10);

        if let Some(&i) = self.index.get(&addr) {
            let entry = &mut self.slots[i];
            entry.count = entry.count.saturating_add(1);
            if entry.count >= threshold {
                if now < entry.limit {
                    if entry.count == threshold {
                        warn!(
                            ip = %addr,
                            count = entry.count,
                            ban_secs = self.block_timeout.as_secs(),
                            "banning abusive DHT peer"
                        );
                    }
                    // too many messages inside the window; silent until it
                    // stays quiet for block_timeout
                    entry.limit = now + self.block_timeout;
                    return false;
                }
                entry.count = 0;
                entry.limit = now + RATE_WINDOW;
            }
            return true;
        }

        let victim = if self.used < self.slots.len() {
            let i = self.used;
            self.used += 1;
            i
        } else {
            self.slots
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.count.cmp(&b.count).then(a.limit.cmp(&b.limit)))
                .map(|(i, _)| i)
                .unwrap_or(0)
        };

        let slot = &mut self.slots[victim];
        if let Some(old) = slot.src.take() {
            self.index.remove(&old);
        }
        *slot = BanEntry {
            src: Some(addr),
            count: 1,
            limit: now + RATE_WINDOW,
        };
        self.index.insert(addr, victim);
        true
    }

    /// Number of addresses currently tracked.
    pub fn tracked(&self) -> usize {
        self.index.len()
    }
}
