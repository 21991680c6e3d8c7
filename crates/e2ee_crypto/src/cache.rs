//! Bounded key cache.
//!
//! Entries carry a monotonically increasing access tick. On overflow,
//! expired keys go first, then the least recently used one. Values are
//! `Arc<CryptoKey>`; the bytes are erased when the last holder drops.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::key::CryptoKey;

struct CacheEntry {
    key: Arc<CryptoKey>,
    last_used: u64,
}

pub struct KeyCache {
    entries: HashMap<String, CacheEntry>,
    capacity: usize,
    tick: u64,
}

impl KeyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Insert or replace. Returns how many entries were evicted to make room.
    pub fn insert(&mut self, key: Arc<CryptoKey>, now: DateTime<Utc>) -> usize {
        let tick = self.next_tick();
        let id = key.id.clone();
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.key = key;
            entry.last_used = tick;
            return 0;
        }

        let mut evicted = 0;
        if self.entries.len() >= self.capacity {
            evicted += self.purge_expired(now);
        }
        while self.entries.len() >= self.capacity {
            let Some(lru) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            self.entries.remove(&lru);
            evicted += 1;
        }

        self.entries.insert(id, CacheEntry { key, last_used: tick });
        evicted
    }

    /// Expired entries are dropped on lookup and reported as absent.
    pub fn get(&mut self, id: &str, now: DateTime<Utc>) -> Option<Arc<CryptoKey>> {
        let tick = self.next_tick();
        let expired = match self.entries.get_mut(id) {
            None => return None,
            Some(entry) if entry.key.is_expired_at(now) => true,
            Some(entry) => {
                entry.last_used = tick;
                return Some(Arc::clone(&entry.key));
            }
        };
        if expired {
            self.entries.remove(id);
        }
        None
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.key.is_expired_at(now));
        before - self.entries.len()
    }

    /// Remove at most `max` expired entries.
    pub fn purge_expired_chunk(&mut self, now: DateTime<Utc>, max: usize) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.key.is_expired_at(now))
            .take(max)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.entries.remove(id);
        }
        ids.len()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::KeyAlgorithm;
    use chrono::Duration;

    fn key(id: &str, ttl_secs: i64) -> Arc<CryptoKey> {
        Arc::new(CryptoKey::new(
            id,
            KeyAlgorithm::Secret,
            vec![0u8; 32],
            Duration::seconds(ttl_secs),
        ))
    }

    #[test]
    fn evicts_least_recently_used() {
        let now = Utc::now();
        let mut cache = KeyCache::new(2);
        cache.insert(key("a", 60), now);
        cache.insert(key("b", 60), now);
        assert!(cache.get("a", now).is_some());
        cache.insert(key("c", 60), now);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn expired_entries_go_before_live_ones() {
        let now = Utc::now();
        let mut cache = KeyCache::new(2);
        cache.insert(key("live", 60), now);
        cache.insert(key("old", -1), now);
        assert!(cache.get("live", now).is_some());
        let evicted = cache.insert(key("new", 60), now);
        assert_eq!(evicted, 1);
        assert!(cache.contains("live"));
        assert!(!cache.contains("old"));
    }

    #[test]
    fn expired_lookup_returns_none_and_drops_entry() {
        let now = Utc::now();
        let mut cache = KeyCache::new(4);
        cache.insert(key("x", -5), now);
        assert!(cache.get("x", now).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn chunked_purge_respects_limit() {
        let now = Utc::now();
        let mut cache = KeyCache::new(16);
        for i in 0..10 {
            cache.insert(key(&format!("k{i}"), -1), now);
        }
        assert_eq!(cache.purge_expired_chunk(now, 4), 4);
        assert_eq!(cache.len(), 6);
        assert_eq!(cache.purge_expired(now), 6);
    }

    #[test]
    fn replacing_an_id_never_evicts() {
        let now = Utc::now();
        let mut cache = KeyCache::new(1);
        cache.insert(key("a", 60), now);
        assert_eq!(cache.insert(key("a", 120), now), 0);
        assert_eq!(cache.len(), 1);
    }
}
