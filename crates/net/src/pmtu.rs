//! Path-MTU cache fed by ICMP "fragmentation needed" and "packet too big"
//! messages.
//!
//! Entries are kept in recency order. When the cache outgrows its limit it
//! keeps at most half of the limit, newest first, and stops at the first
//! entry older than the lifetime.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Path MTU assumed for destinations without feedback.
pub const DEFAULT_PATH_MTU: u16 = 1500;

/// Smallest MTU an IPv4 path may report (RFC 791).
pub const MIN_IPV4_MTU: u16 = 68;

/// Smallest MTU an IPv6 path may report (RFC 8200).
pub const MIN_IPV6_MTU: u16 = 1280;

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(3600);

/// Sizing of a [`PathMtuCache`].
#[derive(Clone, Debug)]
pub struct PmtuConfig {
    pub max_entries: usize,
    pub lifetime: Duration,
}

impl Default for PmtuConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            lifetime: DEFAULT_LIFETIME,
        }
    }
}

pub struct PathMtuCache {
    entries: HashMap<IpAddr, PmtuRecord>,
    max_entries: usize,
    lifetime: Duration,
    next_seq: u64,
}

struct PmtuRecord {
    mtu: u16,
    last_updated: Instant,
    /// Larger is more recent.
    seq: u64,
}

impl Default for PathMtuCache {
    fn default() -> Self {
        Self::new(PmtuConfig::default())
    }
}

impl PathMtuCache {
    pub fn new(config: PmtuConfig) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: config.max_entries.max(2),
            lifetime: config.lifetime,
            next_seq: 0,
        }
    }

    /// Path MTU towards `addr`, or [`DEFAULT_PATH_MTU`] when unknown.
    pub fn lookup(&self, addr: IpAddr) -> u16 {
        self.entries
            .get(&addr)
            .map_or(DEFAULT_PATH_MTU, |record| record.mtu)
    }

    /// Record a reported MTU towards `addr`.
    ///
    /// The value is raised to the family minimum.
    pub fn record_feedback(&mut self, addr: IpAddr, mtu: u16) {
        self.record_feedback_at(addr, mtu, Instant::now());
    }

    pub fn record_feedback_at(&mut self, addr: IpAddr, mtu: u16, now: Instant) {
        let floor = match addr {
            IpAddr::V4(_) => MIN_IPV4_MTU,
            IpAddr::V6(_) => MIN_IPV6_MTU,
        };
        let seq = self.next_seq;
        self.next_seq += 1;

        self.entries.insert(
            addr,
            PmtuRecord {
                mtu: mtu.max(floor),
                last_updated: now,
                seq,
            },
        );

        if self.entries.len() > self.max_entries {
            self.evict(now);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&mut self, now: Instant) {
        let mut newest_first: Vec<(u64, Instant, IpAddr)> = self
            .entries
            .iter()
            .map(|(addr, record)| (record.seq, record.last_updated, *addr))
            .collect();
        newest_first.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let keep = self.max_entries / 2;
        let cut = newest_first
            .iter()
            .position(|(_, updated, _)| now.saturating_duration_since(*updated) > self.lifetime)
            .map_or(keep, |expired| expired.min(keep));

        for (_, _, addr) in &newest_first[cut..] {
            self.entries.remove(addr);
        }
        tracing::debug!(
            "path MTU cache evicted {} entries",
            newest_first.len() - cut
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    fn v6(last: u16) -> IpAddr {
        IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, last))
    }

    #[test]
    fn unknown_destination_uses_default() {
        let cache = PathMtuCache::default();
        assert_eq!(cache.lookup(v4(1)), DEFAULT_PATH_MTU);
        assert_eq!(cache.lookup(v6(1)), DEFAULT_PATH_MTU);
    }

    #[test]
    fn feedback_is_returned() {
        let mut cache = PathMtuCache::default();
        cache.record_feedback(v4(1), 1400);
        cache.record_feedback(v6(1), 1300);
        assert_eq!(cache.lookup(v4(1)), 1400);
        assert_eq!(cache.lookup(v6(1)), 1300);
    }

    #[test]
    fn feedback_is_clamped_to_family_minimum() {
        let mut cache = PathMtuCache::default();
        cache.record_feedback(v4(1), 20);
        cache.record_feedback(v6(1), 576);
        assert_eq!(cache.lookup(v4(1)), MIN_IPV4_MTU);
        assert_eq!(cache.lookup(v6(1)), MIN_IPV6_MTU);
    }

    #[test]
    fn update_replaces_existing_entry() {
        let mut cache = PathMtuCache::default();
        cache.record_feedback(v4(1), 1400);
        cache.record_feedback(v4(1), 1200);
        assert_eq!(cache.lookup(v4(1)), 1200);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn overflow_keeps_newest_half() {
        let mut cache = PathMtuCache::new(PmtuConfig {
            max_entries: 4,
            lifetime: DEFAULT_LIFETIME,
        });
        let now = Instant::now();
        for last in 1..=5 {
            cache.record_feedback_at(v4(last), 1000 + last as u16, now);
        }

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup(v4(5)), 1005);
        assert_eq!(cache.lookup(v4(4)), 1004);
        assert_eq!(cache.lookup(v4(1)), DEFAULT_PATH_MTU);
    }

    #[test]
    fn overflow_drops_expired_entries_first() {
        let mut cache = PathMtuCache::new(PmtuConfig {
            max_entries: 4,
            lifetime: Duration::from_secs(60),
        });
        let start = Instant::now();
        for last in 1..=4 {
            cache.record_feedback_at(v4(last), 1200, start);
        }
        cache.record_feedback_at(v4(5), 1300, start + Duration::from_secs(120));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(v4(5)), 1300);
    }

    #[test]
    fn refreshed_entry_survives_eviction() {
        let mut cache = PathMtuCache::new(PmtuConfig {
            max_entries: 4,
            lifetime: DEFAULT_LIFETIME,
        });
        let now = Instant::now();
        for last in 1..=4 {
            cache.record_feedback_at(v4(last), 1200, now);
        }
        cache.record_feedback_at(v4(1), 1100, now);
        cache.record_feedback_at(v4(5), 1200, now);

        assert_eq!(cache.lookup(v4(1)), 1100);
        assert_eq!(cache.lookup(v4(2)), DEFAULT_PATH_MTU);
    }
}
