//! TTL-bounded cache of function -> warm worker address.
//!
//! A hit skips the Ensure round-trip entirely on the warm path. Reads take a
//! shared lock and never mutate; expired entries are skipped on read and
//! purged on the next write.

use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, Instant},
};

use data_model::{ContainerId, WorkerAddr};

#[derive(Debug, Clone)]
struct CacheEntry {
    container_id: ContainerId,
    address: WorkerAddr,
    expires_at: Instant,
    inserted_at: Instant,
}

pub struct ContainerHostCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_size: usize,
}

impl ContainerHostCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_size,
        }
    }

    pub fn get(&self, function_name: &str) -> Option<(ContainerId, WorkerAddr)> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(function_name)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some((entry.container_id.clone(), entry.address.clone()))
    }

    pub fn put(&self, function_name: &str, container_id: ContainerId, address: WorkerAddr) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();
        entries.retain(|_, e| e.expires_at > now);
        if entries.len() >= self.max_size && !entries.contains_key(function_name) {
            // Full of live entries: drop the oldest one.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            function_name.to_string(),
            CacheEntry {
                container_id,
                address,
                expires_at: now + self.ttl,
                inserted_at: now,
            },
        );
    }

    pub fn invalidate(&self, function_name: &str) {
        self.entries.write().unwrap().remove(function_name);
    }

    /// Container ids of live entries, for the heartbeat report.
    pub fn cached_ids(&self) -> Vec<ContainerId> {
        let now = Instant::now();
        self.entries
            .read()
            .unwrap()
            .values()
            .filter(|e| e.expires_at > now)
            .map(|e| e.container_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> WorkerAddr {
        WorkerAddr::new("10.88.0.1".to_string(), port)
    }

    #[test]
    fn test_hit_within_ttl() {
        let cache = ContainerHostCache::new(Duration::from_secs(30), 100);
        cache.put("hello", ContainerId::from("c-1"), addr(8080));

        let (id, address) = cache.get("hello").unwrap();
        assert_eq!(id.get(), "c-1");
        assert_eq!(address, addr(8080));
    }

    #[test]
    fn test_expired_entry_misses() {
        let cache = ContainerHostCache::new(Duration::ZERO, 100);
        cache.put("hello", ContainerId::from("c-1"), addr(8080));
        assert!(cache.get("hello").is_none());
        assert!(cache.cached_ids().is_empty());
    }

    #[test]
    fn test_invalidate() {
        let cache = ContainerHostCache::new(Duration::from_secs(30), 100);
        cache.put("hello", ContainerId::from("c-1"), addr(8080));
        cache.invalidate("hello");
        assert!(cache.get("hello").is_none());
    }

    #[test]
    fn test_bounded_size_evicts_oldest() {
        let cache = ContainerHostCache::new(Duration::from_secs(30), 2);
        cache.put("a", ContainerId::from("c-a"), addr(1));
        cache.put("b", ContainerId::from("c-b"), addr(2));
        cache.put("c", ContainerId::from("c-c"), addr(3));

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_put_refreshes_existing_entry() {
        let cache = ContainerHostCache::new(Duration::from_secs(30), 2);
        cache.put("a", ContainerId::from("c-a"), addr(1));
        cache.put("a", ContainerId::from("c-a2"), addr(2));

        let (id, address) = cache.get("a").unwrap();
        assert_eq!(id.get(), "c-a2");
        assert_eq!(address.port, 2);
    }
}
