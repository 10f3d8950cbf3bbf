use std::net::{IpAddr, Ipv4Addr};

use dashmap::DashMap;
use tokio::time::{Duration, Instant};

/// Cached DNS entry with expiration.
struct CacheEntry {
    hostname: Option<String>,
    expires_at: Instant,
}

/// Async reverse-DNS resolver with a TTL-based cache.
///
/// Lookups that fail (no PTR record, timeout, etc.) are cached as `None` to
/// prevent repeated queries for non-resolvable addresses. A `None` result is
/// what the storage writer reports as "unresolved"; failures never reach the
/// capture path.
pub struct DnsCache {
    cache: DashMap<Ipv4Addr, CacheEntry>,
    ttl: Duration,
    timeout: Duration,
}

impl DnsCache {
    /// Create a new cache.
    ///
    /// * `ttl` -- how long a successful (or failed) lookup is kept.
    /// * `timeout` -- max wall-clock time for a single DNS query.
    pub fn new(ttl: Duration, timeout: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            ttl,
            timeout,
        }
    }

    /// Resolve an address to a hostname.
    ///
    /// Returns `None` when the address cannot be resolved or the lookup
    /// times out. Results (including failures) are cached.
    pub async fn resolve(&self, addr: Ipv4Addr) -> Option<String> {
        // Fast path: cache hit & still fresh.
        if let Some(entry) = self.cache.get(&addr) {
            if Instant::now() < entry.expires_at {
                return entry.hostname.clone();
            }
        }

        // Slow path: perform the reverse lookup (blocking, via
        // spawn_blocking) with a timeout to prevent stalls.
        let ip = IpAddr::V4(addr);
        let result = tokio::time::timeout(self.timeout, async move {
            tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip).ok())
                .await
                .unwrap_or(None)
        })
        .await
        .unwrap_or(None);

        // A resolver that just echoes the address back has not resolved
        // anything.
        let hostname = result.filter(|host| host.parse::<Ipv4Addr>().is_err());

        self.cache.insert(
            addr,
            CacheEntry {
                hostname: hostname.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );

        hostname
    }
}
