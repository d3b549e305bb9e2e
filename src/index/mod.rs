//! Tag Index & Query Engine
//!
//! In-memory inverted index over tags with a cached, paged query engine.
//!
//! ## Responsibilities
//! - Maintain tag -> keys and key -> tags maps for one (db, namespace)
//! - Answer AND / OR / NOT tag queries with deterministic paging
//! - Fold complex multi-condition queries left to right
//! - Cache results (LRU + TTL) and invalidate them precisely on writes
//! - Track per-tag popularity and per-query-type timing statistics
//!
//! The index is a pure function of the metadata table: it can always be
//! rebuilt from the catalog or a native-metadata backend with one scan.

mod cache;

pub use cache::{CacheStats, QueryCache};

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Sentinel dependency marking results that must be invalidated by any
/// write (NOT queries depend on the whole key universe)
const UNIVERSE_DEP: &str = "*";

// =============================================================================
// Query Types
// =============================================================================

/// Set combinator for tag queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOperator {
    /// Keys carrying ALL of the tags
    And,
    /// Keys carrying ANY of the tags
    Or,
    /// Keys carrying NONE of the tags
    Not,
}

impl QueryOperator {
    /// Lowercase name used in normalized cache keys
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryOperator::And => "and",
            QueryOperator::Or => "or",
            QueryOperator::Not => "not",
        }
    }
}

/// One condition of a complex query (tag conditions only in the core)
#[derive(Debug, Clone)]
pub struct QueryCondition {
    pub operator: QueryOperator,
    pub tags: Vec<String>,
}

/// Result of a paged query
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryResult {
    /// Keys on this page, lexicographically ordered
    pub keys: Vec<String>,
    /// Total matches across all pages
    pub total_count: usize,
    pub page: usize,
    pub page_size: usize,
    pub has_more: bool,
    pub execution_ms: f64,
    pub cache_hit: bool,
}

/// Aggregated timing per query type
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueryTypeStats {
    pub count: u64,
    pub total_ms: f64,
    pub avg_ms: f64,
    pub cache_hits: u64,
}

// =============================================================================
// Inverted Index
// =============================================================================

#[derive(Default)]
struct TagIndex {
    tag_to_keys: HashMap<String, HashSet<String>>,
    key_to_tags: HashMap<String, HashSet<String>>,
    query_counts: HashMap<String, u64>,
}

impl TagIndex {
    /// Register a key with its tag set, replacing any previous tags.
    /// Returns the union of old and new tags for cache invalidation.
    fn add_key(&mut self, key: &str, tags: &[String]) -> HashSet<String> {
        let mut touched = self.detach_key(key);

        let new_tags: HashSet<String> = tags.iter().cloned().collect();
        for tag in &new_tags {
            self.tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
            touched.insert(tag.clone());
        }
        // Tagless keys still join the universe so NOT queries see them
        self.key_to_tags.insert(key.to_string(), new_tags);
        touched
    }

    /// Remove a key entirely. Returns its former tags.
    fn remove_key(&mut self, key: &str) -> HashSet<String> {
        let touched = self.detach_key(key);
        self.key_to_tags.remove(key);
        touched
    }

    /// Unlink a key from every tag set it is currently in
    fn detach_key(&mut self, key: &str) -> HashSet<String> {
        let old_tags = self.key_to_tags.get(key).cloned().unwrap_or_default();
        for tag in &old_tags {
            if let Some(members) = self.tag_to_keys.get_mut(tag) {
                members.remove(key);
                if members.is_empty() {
                    self.tag_to_keys.remove(tag);
                    self.query_counts.remove(tag);
                }
            }
        }
        old_tags
    }

    fn note_queried(&mut self, tags: &[String]) {
        for tag in tags {
            if self.tag_to_keys.contains_key(tag) {
                *self.query_counts.entry(tag.clone()).or_insert(0) += 1;
            }
        }
    }

    /// Intersection, smallest member set first for early exit
    fn query_and(&self, tags: &[String]) -> HashSet<String> {
        if tags.is_empty() {
            return HashSet::new();
        }

        let mut sets: Vec<&HashSet<String>> = Vec::with_capacity(tags.len());
        for tag in tags {
            match self.tag_to_keys.get(tag) {
                Some(set) => sets.push(set),
                None => return HashSet::new(),
            }
        }
        sets.sort_by_key(|set| set.len());

        let mut result = sets[0].clone();
        for set in &sets[1..] {
            result.retain(|key| set.contains(key));
            if result.is_empty() {
                break;
            }
        }
        result
    }

    fn query_or(&self, tags: &[String]) -> HashSet<String> {
        let mut result = HashSet::new();
        for tag in tags {
            if let Some(set) = self.tag_to_keys.get(tag) {
                result.extend(set.iter().cloned());
            }
        }
        result
    }

    /// Universe minus the union of the given tags
    fn query_not(&self, tags: &[String]) -> HashSet<String> {
        let excluded = self.query_or(tags);
        self.key_to_tags
            .keys()
            .filter(|key| !excluded.contains(*key))
            .cloned()
            .collect()
    }

    fn evaluate(&self, operator: QueryOperator, tags: &[String]) -> HashSet<String> {
        match operator {
            QueryOperator::And => self.query_and(tags),
            QueryOperator::Or => self.query_or(tags),
            QueryOperator::Not => self.query_not(tags),
        }
    }

    fn tag_counts(&self) -> HashMap<String, usize> {
        self.tag_to_keys
            .iter()
            .map(|(tag, keys)| (tag.clone(), keys.len()))
            .collect()
    }

    fn popular_tags(&self, limit: usize) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> = self
            .query_counts
            .iter()
            .map(|(tag, count)| (tag.clone(), *count))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(limit);
        entries
    }
}

// =============================================================================
// Index Manager
// =============================================================================

struct IndexInner {
    index: TagIndex,
    cache: QueryCache,
    query_stats: HashMap<String, QueryTypeStats>,
}

/// Owns the tag index, the query cache and their statistics behind a
/// single lock (readers copy result sets out to keep the critical
/// sections short).
pub struct IndexManager {
    db: String,
    namespace: String,
    inner: Mutex<IndexInner>,
}

impl IndexManager {
    pub fn new(db: &str, namespace: &str, cache_size: usize, cache_ttl: Duration) -> Self {
        Self {
            db: db.to_string(),
            namespace: namespace.to_string(),
            inner: Mutex::new(IndexInner {
                index: TagIndex::default(),
                cache: QueryCache::new(cache_size, cache_ttl),
                query_stats: HashMap::new(),
            }),
        }
    }

    /// Index a key's tags and invalidate affected cached results
    pub fn add_key(&self, key: &str, tags: &[String]) {
        let mut inner = self.inner.lock();
        let mut touched = inner.index.add_key(key, tags);
        touched.insert(UNIVERSE_DEP.to_string());
        inner.cache.invalidate_tags(&touched);
    }

    /// Drop a key from the index and invalidate affected cached results
    pub fn remove_key(&self, key: &str) {
        let mut inner = self.inner.lock();
        let mut touched = inner.index.remove_key(key);
        touched.insert(UNIVERSE_DEP.to_string());
        inner.cache.invalidate_tags(&touched);
    }

    /// Unpaged tag query (used by the facade's AND lookup and tests)
    pub fn query_tags(&self, tags: &[String], operator: QueryOperator) -> HashSet<String> {
        let mut inner = self.inner.lock();
        inner.index.note_queried(tags);
        inner.index.evaluate(operator, tags)
    }

    /// Paged tag query with caching and deterministic key order
    pub fn query_paged(
        &self,
        tags: &[String],
        operator: QueryOperator,
        page: usize,
        page_size: usize,
    ) -> QueryResult {
        let started = Instant::now();
        let cache_key = self.tag_cache_key(tags, operator, page, page_size);
        let stat_key = format!("tags_{}", operator.as_str());

        let mut inner = self.inner.lock();
        if let Some(mut cached) = inner.cache.get(&cache_key) {
            cached.cache_hit = true;
            inner
                .query_stats
                .entry(stat_key)
                .or_default()
                .cache_hits += 1;
            return cached;
        }

        inner.index.note_queried(tags);
        let matches = inner.index.evaluate(operator, tags);
        let result = Self::paginate(matches, page, page_size, started);

        let mut deps: HashSet<String> = tags.iter().cloned().collect();
        if operator == QueryOperator::Not {
            deps.insert(UNIVERSE_DEP.to_string());
        }
        inner.cache.insert(cache_key, deps, result.clone());
        Self::record_stats(&mut inner.query_stats, &stat_key, result.execution_ms);
        result
    }

    /// Complex query: conditions folded left to right, each condition's
    /// operator combining its tag set into the running result
    pub fn complex_query(
        &self,
        conditions: &[QueryCondition],
        page: usize,
        page_size: usize,
    ) -> QueryResult {
        let started = Instant::now();
        let cache_key = self.complex_cache_key(conditions, page, page_size);

        let mut inner = self.inner.lock();
        if let Some(mut cached) = inner.cache.get(&cache_key) {
            cached.cache_hit = true;
            inner
                .query_stats
                .entry("complex".to_string())
                .or_default()
                .cache_hits += 1;
            return cached;
        }

        let mut deps: HashSet<String> = HashSet::new();
        let mut result_set: Option<HashSet<String>> = None;
        for condition in conditions {
            inner.index.note_queried(&condition.tags);
            deps.extend(condition.tags.iter().cloned());
            if condition.operator == QueryOperator::Not {
                deps.insert(UNIVERSE_DEP.to_string());
            }

            result_set = Some(match result_set {
                None => inner.index.evaluate(condition.operator, &condition.tags),
                Some(current) => match condition.operator {
                    QueryOperator::And => {
                        let all = inner.index.query_and(&condition.tags);
                        current.intersection(&all).cloned().collect()
                    }
                    QueryOperator::Or => {
                        let any = inner.index.query_or(&condition.tags);
                        current.union(&any).cloned().collect()
                    }
                    QueryOperator::Not => {
                        let any = inner.index.query_or(&condition.tags);
                        current.difference(&any).cloned().collect()
                    }
                },
            });
        }

        let result = Self::paginate(result_set.unwrap_or_default(), page, page_size, started);
        inner.cache.insert(cache_key, deps, result.clone());
        Self::record_stats(&mut inner.query_stats, "complex", result.execution_ms);
        result
    }

    /// Tag -> member count across the index
    pub fn tag_counts(&self) -> HashMap<String, usize> {
        self.inner.lock().index.tag_counts()
    }

    /// Tags ordered by how often they were queried
    pub fn popular_tags(&self, limit: usize) -> Vec<(String, u64)> {
        self.inner.lock().index.popular_tags(limit)
    }

    /// Tags currently attached to a key, if indexed
    pub fn key_tags(&self, key: &str) -> Option<HashSet<String>> {
        self.inner.lock().index.key_to_tags.get(key).cloned()
    }

    /// Number of keys in the universe
    pub fn key_count(&self) -> usize {
        self.inner.lock().index.key_to_tags.len()
    }

    /// Rebuild the whole index from a metadata scan
    pub fn rebuild<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let mut inner = self.inner.lock();
        inner.index = TagIndex::default();
        inner.cache.clear();
        for (key, tags) in entries {
            inner.index.add_key(&key, &tags);
        }
    }

    /// Reorder hot structures and shed cold cache entries.
    ///
    /// Intersections already evaluate smallest-set-first; this logs the
    /// busiest tags and prunes a quarter of the cache once it is more
    /// than 80% full.
    pub fn optimize(&self) {
        let mut inner = self.inner.lock();
        let popular = inner.index.popular_tags(5);
        if !popular.is_empty() {
            tracing::info!(
                component = "index",
                db = %self.db,
                namespace = %self.namespace,
                busiest_tags = ?popular,
                "index optimization pass"
            );
        }
        if inner.cache.len() > inner.cache.capacity() * 8 / 10 {
            inner.cache.prune_quarter();
        }
    }

    pub fn clear_caches(&self) {
        self.inner.lock().cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.lock().cache.stats()
    }

    pub fn query_stats(&self) -> HashMap<String, QueryTypeStats> {
        self.inner.lock().query_stats.clone()
    }

    // -------------------------------------------------------------------------
    // Private Helpers
    // -------------------------------------------------------------------------

    fn tag_cache_key(
        &self,
        tags: &[String],
        operator: QueryOperator,
        page: usize,
        page_size: usize,
    ) -> String {
        let mut sorted = tags.to_vec();
        sorted.sort();
        format!(
            "tags:{}:{}:{}:{}:{}:{}",
            operator.as_str(),
            sorted.join(","),
            self.db,
            self.namespace,
            page,
            page_size
        )
    }

    fn complex_cache_key(
        &self,
        conditions: &[QueryCondition],
        page: usize,
        page_size: usize,
    ) -> String {
        let encoded: Vec<String> = conditions
            .iter()
            .map(|c| {
                let mut sorted = c.tags.clone();
                sorted.sort();
                format!("{}({})", c.operator.as_str(), sorted.join(","))
            })
            .collect();
        format!(
            "complex:{}:{}:{}:{}:{}",
            encoded.join("|"),
            self.db,
            self.namespace,
            page,
            page_size
        )
    }

    fn paginate(
        matches: HashSet<String>,
        page: usize,
        page_size: usize,
        started: Instant,
    ) -> QueryResult {
        let mut all: Vec<String> = matches.into_iter().collect();
        all.sort();

        let page = page.max(1);
        let page_size = page_size.max(1);
        let total_count = all.len();
        let start = (page - 1) * page_size;
        let end = (start + page_size).min(total_count);
        let keys = if start < total_count {
            all[start..end].to_vec()
        } else {
            Vec::new()
        };

        QueryResult {
            keys,
            total_count,
            page,
            page_size,
            has_more: end < total_count,
            execution_ms: started.elapsed().as_secs_f64() * 1000.0,
            cache_hit: false,
        }
    }

    fn record_stats(stats: &mut HashMap<String, QueryTypeStats>, key: &str, elapsed_ms: f64) {
        let entry = stats.entry(key.to_string()).or_default();
        entry.count += 1;
        entry.total_ms += elapsed_ms;
        entry.avg_ms = entry.total_ms / entry.count as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> IndexManager {
        IndexManager::new("db", "ns", 100, Duration::from_secs(60))
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    fn seed(index: &IndexManager) {
        index.add_key("p1", &tags(&["a", "b"]));
        index.add_key("p2", &tags(&["a"]));
        index.add_key("p3", &tags(&["b", "c"]));
    }

    #[test]
    fn test_and_or_not_semantics() {
        let index = manager();
        seed(&index);

        let and = index.query_tags(&tags(&["a", "b"]), QueryOperator::And);
        assert_eq!(and, ["p1".to_string()].into_iter().collect());

        let or = index.query_tags(&tags(&["a", "c"]), QueryOperator::Or);
        assert_eq!(or.len(), 3);

        let not = index.query_tags(&tags(&["a"]), QueryOperator::Not);
        assert_eq!(not, ["p3".to_string()].into_iter().collect());
    }

    #[test]
    fn test_and_is_commutative() {
        let index = manager();
        seed(&index);

        let ab = index.query_tags(&tags(&["a", "b"]), QueryOperator::And);
        let ba = index.query_tags(&tags(&["b", "a"]), QueryOperator::And);
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_paged_query_is_ordered_and_cached() {
        let index = manager();
        seed(&index);

        let first = index.query_paged(&tags(&["a", "c"]), QueryOperator::Or, 1, 2);
        assert_eq!(first.keys, vec!["p1".to_string(), "p2".to_string()]);
        assert_eq!(first.total_count, 3);
        assert!(first.has_more);
        assert!(!first.cache_hit);

        let again = index.query_paged(&tags(&["a", "c"]), QueryOperator::Or, 1, 2);
        assert!(again.cache_hit);
        assert_eq!(again.keys, first.keys);

        // Tag order must not change the cache identity
        let reordered = index.query_paged(&tags(&["c", "a"]), QueryOperator::Or, 1, 2);
        assert!(reordered.cache_hit);
    }

    #[test]
    fn test_write_invalidates_matching_cache_entries() {
        let index = manager();
        seed(&index);

        index.query_paged(&tags(&["a"]), QueryOperator::And, 1, 10);
        index.query_paged(&tags(&["c"]), QueryOperator::And, 1, 10);

        index.add_key("p4", &tags(&["a"]));

        let a = index.query_paged(&tags(&["a"]), QueryOperator::And, 1, 10);
        assert!(!a.cache_hit);
        assert_eq!(a.total_count, 3);

        let c = index.query_paged(&tags(&["c"]), QueryOperator::And, 1, 10);
        assert!(c.cache_hit);
    }

    #[test]
    fn test_not_queries_see_new_untagged_keys() {
        let index = manager();
        seed(&index);

        let before = index.query_paged(&tags(&["a"]), QueryOperator::Not, 1, 10);
        assert_eq!(before.total_count, 1);

        index.add_key("plain", &[]);

        let after = index.query_paged(&tags(&["a"]), QueryOperator::Not, 1, 10);
        assert!(!after.cache_hit);
        assert_eq!(after.total_count, 2);
    }

    #[test]
    fn test_complex_query_folds_left_to_right() {
        let index = manager();
        seed(&index);

        // (a OR c) then AND b -> {p1, p3}
        let result = index.complex_query(
            &[
                QueryCondition {
                    operator: QueryOperator::Or,
                    tags: tags(&["a", "c"]),
                },
                QueryCondition {
                    operator: QueryOperator::And,
                    tags: tags(&["b"]),
                },
            ],
            1,
            10,
        );
        assert_eq!(result.keys, vec!["p1".to_string(), "p3".to_string()]);

        // (a OR b) then NOT c -> {p1, p2}
        let result = index.complex_query(
            &[
                QueryCondition {
                    operator: QueryOperator::Or,
                    tags: tags(&["a", "b"]),
                },
                QueryCondition {
                    operator: QueryOperator::Not,
                    tags: tags(&["c"]),
                },
            ],
            1,
            10,
        );
        assert_eq!(result.keys, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[test]
    fn test_rebuild_replaces_index() {
        let index = manager();
        seed(&index);

        index.rebuild(vec![("solo".to_string(), vec!["x".to_string()])]);

        assert_eq!(index.key_count(), 1);
        let x = index.query_tags(&tags(&["x"]), QueryOperator::And);
        assert_eq!(x.len(), 1);
        assert!(index.query_tags(&tags(&["a"]), QueryOperator::And).is_empty());
    }

    #[test]
    fn test_popularity_counts_queries() {
        let index = manager();
        seed(&index);

        index.query_tags(&tags(&["a"]), QueryOperator::And);
        index.query_tags(&tags(&["a"]), QueryOperator::And);
        index.query_tags(&tags(&["b"]), QueryOperator::And);

        let popular = index.popular_tags(2);
        assert_eq!(popular[0].0, "a");
        assert_eq!(popular[0].1, 2);
    }
}
