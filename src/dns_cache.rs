//! Host resolution memoization shared by transport connect paths.

use log::debug;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_TTL: Duration = Duration::from_secs(60);

struct DnsEntry {
    addrs: Vec<SocketAddr>,
    resolved_at: Instant,
}

/// Hostname to address memoization with a per-entry TTL. Expired entries are
/// evicted lazily on lookup. Created once per client and shared with its
/// transports; safe to use from any thread.
pub struct DnsCache {
    entries: Mutex<HashMap<String, DnsEntry>>,
    ttl: Duration,
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Resolves `host:port`, serving from the cache when a live entry
    /// exists.
    pub fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let key = format!("{}:{}", host, port);

        {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(&key) {
                Some(entry) if entry.resolved_at.elapsed() < self.ttl => {
                    debug!("DNS cache hit for {}", key);
                    return Ok(entry.addrs.clone());
                }
                Some(_) => {
                    debug!("DNS cache entry for {} expired", key);
                    entries.remove(&key);
                }
                None => {}
            }
        }

        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses resolved for {}", key),
            ));
        }
        debug!("Resolved {} to {} address(es)", key, addrs.len());

        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key,
            DnsEntry {
                addrs: addrs.clone(),
                resolved_at: Instant::now(),
            },
        );

        Ok(addrs)
    }

    /// Number of live (possibly expired but not yet evicted) entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_caches_result() {
        let cache = DnsCache::new();
        let first = cache.resolve("localhost", 8080).unwrap();
        assert!(!first.is_empty());
        assert_eq!(cache.len(), 1);

        let second = cache.resolve("localhost", 8080).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_entry_is_re_resolved() {
        let cache = DnsCache::with_ttl(Duration::from_millis(0));
        cache.resolve("localhost", 8080).unwrap();
        // TTL zero: the entry is already expired and gets evicted, then
        // re-resolved in place.
        cache.resolve("localhost", 8080).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_unresolvable_host_fails() {
        let cache = DnsCache::new();
        assert!(cache.resolve("host.invalid.", 1).is_err());
        assert!(cache.is_empty());
    }
}
