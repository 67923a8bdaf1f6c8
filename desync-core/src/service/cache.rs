//! # Destination Strategy Cache
//!
//! Remembers, per destination, which desync strategy last worked (or which
//! one the failure classifier decided the *next* connection should start
//! with). Entries are keyed by a canonical serialization of the destination
//! address and expire after a configurable TTL; capacity is bounded by an
//! LRU so a scan of many destinations cannot grow the map without limit.
//!
//! The cache is shared by every flow of the engine and guarded by a single
//! mutex; lookups and updates are O(1).

use lru::LruCache;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Canonical cache key for a destination: port, family tag, raw address.
pub type AddrKey = Vec<u8>;

/// Collapse IPv4-mapped IPv6 destinations to plain IPv4 so both spellings
/// of one destination share a cache line.
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Serialize a destination into a deterministic byte key:
/// `port(2) ‖ family(2) ‖ addr(4 or 16)`.
///
/// Equal destinations always produce byte-identical keys; distinct
/// destinations always differ (the family tag keeps a 4-byte IPv4 from
/// colliding with a prefix of an IPv6 address).
pub fn serialize_addr(dst: &SocketAddr) -> AddrKey {
    let mut key = Vec::with_capacity(20);
    key.extend_from_slice(&dst.port().to_be_bytes());
    match canonical_ip(dst.ip()) {
        IpAddr::V4(ip) => {
            key.extend_from_slice(&(libc::AF_INET as u16).to_be_bytes());
            key.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            key.extend_from_slice(&(libc::AF_INET6 as u16).to_be_bytes());
            key.extend_from_slice(&ip.octets());
        }
    }
    key
}

/// Result of a cache probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Fresh entry: start with this strategy index.
    Hit(usize),
    /// Entry exists but aged past the TTL; callers treat it as a miss.
    Stale,
    /// No entry for this destination.
    Miss,
}

struct CacheEntry {
    attempt: usize,
    last_used: i64,
}

/// Bounded destination → strategy mapping with TTL-gated reads.
pub struct StrategyCache {
    entries: Mutex<LruCache<AddrKey, CacheEntry>>,
    ttl: i64,
}

impl StrategyCache {
    pub fn new(capacity: usize, ttl: i64) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or_else(|| {
            log::warn!("Invalid cache capacity (0), using 1");
            NonZeroUsize::new(1).expect("1 is non-zero")
        });
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Probe the cache for a destination.
    ///
    /// A stale entry is reported (and logged) rather than silently dropped;
    /// it stays in place until overwritten, removed, or evicted.
    pub fn lookup(&self, dst: &SocketAddr) -> CacheOutcome {
        let key = serialize_addr(dst);
        let now = chrono::Utc::now().timestamp();

        let mut entries = self.entries.lock().unwrap();
        match entries.get(&key) {
            Some(entry) if now > entry.last_used + self.ttl => {
                log::info!(
                    "Cache entry for {} is stale (saved {}s ago), ignoring",
                    dst,
                    now - entry.last_used
                );
                CacheOutcome::Stale
            }
            Some(entry) => CacheOutcome::Hit(entry.attempt),
            None => CacheOutcome::Miss,
        }
    }

    /// Upsert the strategy for a destination and stamp it with the current
    /// wall clock.
    pub fn insert(&self, dst: &SocketAddr, attempt: usize) {
        log::info!("Saving strategy {} for {}", attempt, dst);
        let entry = CacheEntry {
            attempt,
            last_used: chrono::Utc::now().timestamp(),
        };
        self.entries
            .lock()
            .unwrap()
            .put(serialize_addr(dst), entry);
    }

    /// Drop a destination whose cached strategy turned out to fail too.
    pub fn remove(&self, dst: &SocketAddr) {
        log::info!("Deleting cached strategy for {}", dst);
        self.entries.lock().unwrap().pop(&serialize_addr(dst));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
