//! Query result cache
//!
//! LRU cache with per-entry TTL and tag-based invalidation. Entries
//! remember the tag set they were computed from, so a write touching any
//! of those tags evicts exactly the results it could have changed.
//!
//! Not internally synchronized; the index manager guards the cache and
//! the tag index behind a single lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use super::QueryResult;

/// Cache statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub max_size: usize,
    pub evictions: u64,
}

struct CachedEntry {
    result: QueryResult,
    tags: HashSet<String>,
    inserted: Instant,
}

/// LRU query cache with TTL expiration
pub struct QueryCache {
    capacity: usize,
    ttl: Duration,
    map: HashMap<String, CachedEntry>,
    /// Access order, least recently used at the front
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            map: HashMap::new(),
            order: VecDeque::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Look up a cached result, refreshing its LRU position
    pub fn get(&mut self, key: &str) -> Option<QueryResult> {
        let fresh = match self.map.get(key) {
            Some(entry) => entry.inserted.elapsed() <= self.ttl,
            None => {
                self.misses += 1;
                return None;
            }
        };
        if !fresh {
            // Expired in place
            self.remove(key);
            self.evictions += 1;
            self.misses += 1;
            return None;
        }

        self.touch(key);
        self.hits += 1;
        Some(self.map[key].result.clone())
    }

    /// Insert a result with the tag set it depends on
    pub fn insert(&mut self, key: String, tags: HashSet<String>, result: QueryResult) {
        if self.map.contains_key(&key) {
            self.remove(&key);
        } else if self.map.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
                self.evictions += 1;
            }
        }

        self.order.push_back(key.clone());
        self.map.insert(
            key,
            CachedEntry {
                result,
                tags,
                inserted: Instant::now(),
            },
        );
    }

    /// Evict every entry whose dependency tags intersect `touched`
    pub fn invalidate_tags(&mut self, touched: &HashSet<String>) {
        if touched.is_empty() {
            return;
        }
        let stale: Vec<String> = self
            .map
            .iter()
            .filter(|(_, entry)| !entry.tags.is_disjoint(touched))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.remove(&key);
            self.evictions += 1;
        }
    }

    /// Drop the least recently used quarter of the cache
    pub fn prune_quarter(&mut self) {
        let to_remove = self.map.len() / 4;
        for _ in 0..to_remove {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
                self.evictions += 1;
            }
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            size: self.map.len(),
            max_size: self.capacity,
            evictions: self.evictions,
        }
    }

    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }

    fn remove(&mut self, key: &str) {
        self.map.remove(key);
        self.order.retain(|k| k != key);
    }
}
