//! Reply cache backing at-most-once semantics.
//!
//! Keyed by `(client endpoint, request id)`, the cache stores the exact
//! encoded reply bytes so a retransmitted request is answered with a
//! bit-identical replay instead of re-executing the operation. Storing the
//! bytes rather than the logical result matters: re-running the handler
//! could observe state another client changed in the meantime, and the
//! replay must carry the original `request_id` and body for the client to
//! accept it.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// How long a cached reply is replayed before the entry lapses and a
/// retransmit re-executes.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct CacheEntry {
    reply: Vec<u8>,
    expires_at: Instant,
}

/// Cache of encoded replies, swept lazily once per server loop iteration.
/// There is no size cap; the TTL bounds growth at expected loads.
#[derive(Debug)]
pub struct DedupCache {
    ttl: Duration,
    entries: HashMap<String, CacheEntry>,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Cache key for a request: the observed source endpoint plus the
    /// client-chosen request id.
    pub fn key(endpoint: SocketAddr, request_id: u64) -> String {
        format!("{endpoint}#{request_id}")
    }

    /// Look up a live cached reply. Entries past their expiry are ignored
    /// even if a sweep has not removed them yet.
    pub fn lookup(&self, key: &str, now: Instant) -> Option<&[u8]> {
        self.entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.reply.as_slice())
    }

    /// Record the reply bytes for a finished at-most-once request.
    pub fn insert(&mut self, key: String, reply: Vec<u8>, now: Instant) {
        self.entries.insert(
            key,
            CacheEntry {
                reply,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Drop expired entries.
    pub fn sweep(&mut self, now: Instant) {
        self.entries.retain(|_, e| e.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn key_combines_endpoint_and_request_id() {
        assert_eq!(DedupCache::key(endpoint(), 42), "127.0.0.1:4000#42");
    }

    #[test]
    fn lookup_replays_within_ttl() {
        let mut cache = DedupCache::new(Duration::from_secs(60));
        let now = Instant::now();
        let key = DedupCache::key(endpoint(), 1);
        cache.insert(key.clone(), vec![1, 2, 3], now);
        assert_eq!(
            cache.lookup(&key, now + Duration::from_secs(59)),
            Some(&[1u8, 2, 3][..])
        );
    }

    #[test]
    fn lookup_ignores_expired_entries_before_sweep() {
        let mut cache = DedupCache::new(Duration::from_secs(60));
        let now = Instant::now();
        let key = DedupCache::key(endpoint(), 1);
        cache.insert(key.clone(), vec![1], now);
        assert_eq!(cache.lookup(&key, now + Duration::from_secs(61)), None);
        // the entry is still present until a sweep runs
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let mut cache = DedupCache::new(Duration::from_secs(60));
        let now = Instant::now();
        cache.insert(DedupCache::key(endpoint(), 1), vec![1], now);
        cache.insert(
            DedupCache::key(endpoint(), 2),
            vec![2],
            now + Duration::from_secs(30),
        );
        cache.sweep(now + Duration::from_secs(61));
        assert_eq!(cache.len(), 1);
        assert!(cache
            .lookup(
                &DedupCache::key(endpoint(), 2),
                now + Duration::from_secs(61)
            )
            .is_some());
    }

    #[test]
    fn reinsert_after_expiry_starts_a_fresh_window() {
        let mut cache = DedupCache::new(Duration::from_secs(60));
        let now = Instant::now();
        let key = DedupCache::key(endpoint(), 1);
        cache.insert(key.clone(), vec![1], now);
        let later = now + Duration::from_secs(90);
        cache.sweep(later);
        assert!(cache.is_empty());
        cache.insert(key.clone(), vec![2], later);
        assert_eq!(
            cache.lookup(&key, later + Duration::from_secs(1)),
            Some(&[2u8][..])
        );
    }
}
