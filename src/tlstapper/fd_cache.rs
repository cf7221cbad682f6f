use hashlink::LruCache;
use log::info;
use std::sync::Arc;

use super::chunk::AddressPair;
use crate::tap::stats::TapStats;

const EVICTION_LOG_INTERVAL: u64 = 1_000_000;

/// Last resolved addresses keyed by `pid:fd`, least recently used evicted first.
pub struct FdCache {
    entries: LruCache<String, AddressPair>,
    evicted: u64,
    stats: Arc<TapStats>,
}

impl FdCache {
    pub fn new(capacity: usize, stats: Arc<TapStats>) -> Self {
        Self {
            entries: LruCache::new(capacity.max(1)),
            evicted: 0,
            stats,
        }
    }

    pub fn key(pid: u32, fd: u32) -> String {
        format!("{}:{}", pid, fd)
    }

    pub fn insert(&mut self, key: String, pair: AddressPair) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.entries.capacity() {
            self.entries.remove_lru();
            self.evicted += 1;
            TapStats::incr(&self.stats.fd_cache_evictions);
            if self.evicted % EVICTION_LOG_INTERVAL == 0 {
                info!("TLS fd cache evicted {} entries", self.evicted);
            }
        }
        self.entries.insert(key, pair);
    }

    pub fn get(&mut self, key: &str) -> Option<AddressPair> {
        self.entries.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn pair(port: u16) -> AddressPair {
        AddressPair {
            src_ip: "10.0.0.1".parse().unwrap(),
            src_port: port,
            dst_ip: "10.0.0.2".parse().unwrap(),
            dst_port: 443,
        }
    }

    #[test]
    fn test_overflow_counts_evictions() {
        let stats = Arc::new(TapStats::default());
        let mut cache = FdCache::new(3, stats.clone());
        for fd in 0..5u32 {
            cache.insert(FdCache::key(1, fd), pair(fd as u16));
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.evicted(), 2);
        assert_eq!(stats.fd_cache_evictions.load(Ordering::Relaxed), 2);
        assert!(cache.get("1:0").is_none());
        assert_eq!(cache.get("1:4"), Some(pair(4)));
    }

    #[test]
    fn test_reinsert_and_recency() {
        let mut cache = FdCache::new(2, Arc::new(TapStats::default()));
        cache.insert(FdCache::key(1, 1), pair(1));
        cache.insert(FdCache::key(1, 2), pair(2));
        // Touch 1:1 so 1:2 becomes the oldest
        assert!(cache.get("1:1").is_some());
        cache.insert(FdCache::key(1, 1), pair(11));
        assert_eq!(cache.evicted(), 0);

        cache.insert(FdCache::key(1, 3), pair(3));
        assert_eq!(cache.evicted(), 1);
        assert!(cache.get("1:2").is_none());
        assert_eq!(cache.get("1:1"), Some(pair(11)));
    }
}
