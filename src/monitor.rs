//! Timed monitor subscriptions.
//!
//! A MONITOR_REGISTER call appends one entry; the server fans a callback
//! datagram out to every live entry after each successful mutating
//! operation. Entries from the same endpoint are independent, so a client
//! registered twice receives two callbacks per update. Iteration order is
//! registration order.
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct MonitorEntry {
    pub endpoint: SocketAddr,
    pub expires_at: Instant,
}

/// Registered monitors, swept lazily once per server loop iteration.
#[derive(Debug, Default)]
pub struct MonitorRegistry {
    entries: Vec<MonitorEntry>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `endpoint` to updates for the next `seconds` seconds.
    pub fn register(&mut self, endpoint: SocketAddr, seconds: u16, now: Instant) {
        self.entries.push(MonitorEntry {
            endpoint,
            expires_at: now + Duration::from_secs(u64::from(seconds)),
        });
    }

    /// Drop expired entries, preserving registration order of the rest.
    pub fn sweep(&mut self, now: Instant) {
        self.entries.retain(|e| e.expires_at > now);
    }

    /// Endpoints of all live entries, in registration order.
    pub fn endpoints(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.entries.iter().map(|e| e.endpoint)
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

    fn endpoint(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn endpoints_iterate_in_registration_order() {
        let mut registry = MonitorRegistry::new();
        let now = Instant::now();
        registry.register(endpoint(5001), 10, now);
        registry.register(endpoint(5002), 10, now);
        registry.register(endpoint(5001), 10, now);
        let order: Vec<_> = registry.endpoints().collect();
        assert_eq!(order, vec![endpoint(5001), endpoint(5002), endpoint(5001)]);
    }

    #[test]
    fn same_endpoint_registers_independently() {
        let mut registry = MonitorRegistry::new();
        let now = Instant::now();
        registry.register(endpoint(5001), 10, now);
        registry.register(endpoint(5001), 20, now);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let mut registry = MonitorRegistry::new();
        let now = Instant::now();
        registry.register(endpoint(5001), 5, now);
        registry.register(endpoint(5002), 30, now);
        registry.sweep(now + Duration::from_secs(6));
        let order: Vec<_> = registry.endpoints().collect();
        assert_eq!(order, vec![endpoint(5002)]);
        registry.sweep(now + Duration::from_secs(31));
        assert!(registry.is_empty());
    }
}
