//! Tests for tag queries through the Store facade
//!
//! These tests verify:
//! - AND / OR / NOT semantics and their algebraic properties
//! - Pagination and deterministic ordering
//! - Complex queries folded left to right
//! - Query cache behavior and invalidation on writes
//! - Tag enumeration

use std::sync::Arc;

use quartzkv::{Config, QueryCondition, QueryOperator, Store};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_store() -> (TempDir, Arc<Store>) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .db("querydb")
        .namespace("ns")
        .build();
    let store = Store::open(config).unwrap();
    (temp_dir, store)
}

/// The three-key fixture from the query scenarios
fn seed(store: &Store) {
    store.set("p1", b"x", &["a", "b"]).unwrap();
    store.set("p2", b"y", &["a"]).unwrap();
    store.set("p3", b"z", &["b", "c"]).unwrap();
}

fn condition(operator: QueryOperator, tags: &[&str]) -> QueryCondition {
    QueryCondition {
        operator,
        tags: tags.iter().map(|t| t.to_string()).collect(),
    }
}

// =============================================================================
// AND Semantics
// =============================================================================

#[test]
fn test_query_by_tags_intersects() {
    let (_temp, store) = setup_store();
    seed(&store);

    let results = store.query_by_tags(&["a", "b"]).unwrap();
    assert_eq!(results.len(), 1);
    assert!(results.contains_key("p1"));
    assert_eq!(results["p1"].tags, vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn test_subset_of_tags_still_matches() {
    let (_temp, store) = setup_store();
    store.set("k", b"v", &["a", "b", "c"]).unwrap();

    // Any subset of the key's tags matches it
    assert!(store.query_by_tags(&["a"]).unwrap().contains_key("k"));
    assert!(store.query_by_tags(&["a", "c"]).unwrap().contains_key("k"));

    // A superset does not
    assert!(!store.query_by_tags(&["a", "b", "c", "d"]).unwrap().contains_key("k"));
}

// =============================================================================
// OR / NOT Semantics
// =============================================================================

#[test]
fn test_advanced_or_unions() {
    let (_temp, store) = setup_store();
    seed(&store);

    let result = store
        .query_by_tags_advanced(&["a", "c"], QueryOperator::Or, 1, 10)
        .unwrap();
    assert_eq!(
        result.keys,
        vec!["p1".to_string(), "p2".to_string(), "p3".to_string()]
    );
    assert_eq!(result.total_count, 3);
    assert!(!result.has_more);
}

#[test]
fn test_not_is_universe_minus_union() {
    let (_temp, store) = setup_store();
    seed(&store);
    store.set("plain", b"v", &[]).unwrap();

    let result = store
        .query_by_tags_advanced(&["a"], QueryOperator::Not, 1, 10)
        .unwrap();
    assert_eq!(result.keys, vec!["p3".to_string(), "plain".to_string()]);
}

#[test]
fn test_or_is_commutative_and_associative() {
    let (_temp, store) = setup_store();
    seed(&store);

    let ab = store
        .query_by_tags_advanced(&["a", "b"], QueryOperator::Or, 1, 10)
        .unwrap();
    let ba = store
        .query_by_tags_advanced(&["b", "a"], QueryOperator::Or, 1, 10)
        .unwrap();
    assert_eq!(ab.keys, ba.keys);

    let abc = store
        .query_by_tags_advanced(&["a", "b", "c"], QueryOperator::Or, 1, 10)
        .unwrap();
    let cab = store
        .query_by_tags_advanced(&["c", "a", "b"], QueryOperator::Or, 1, 10)
        .unwrap();
    assert_eq!(abc.keys, cab.keys);
}

// =============================================================================
// Pagination
// =============================================================================

#[test]
fn test_pagination_is_deterministic() {
    let (_temp, store) = setup_store();
    for i in 0..25 {
        store.set(&format!("key{:02}", i), b"v", &["page"]).unwrap();
    }

    let first = store
        .query_by_tags_advanced(&["page"], QueryOperator::And, 1, 10)
        .unwrap();
    assert_eq!(first.keys.len(), 10);
    assert_eq!(first.keys[0], "key00");
    assert_eq!(first.total_count, 25);
    assert!(first.has_more);

    let third = store
        .query_by_tags_advanced(&["page"], QueryOperator::And, 3, 10)
        .unwrap();
    assert_eq!(third.keys.len(), 5);
    assert_eq!(third.keys[0], "key20");
    assert!(!third.has_more);

    let past_end = store
        .query_by_tags_advanced(&["page"], QueryOperator::And, 5, 10)
        .unwrap();
    assert!(past_end.keys.is_empty());
    assert_eq!(past_end.total_count, 25);
}

// =============================================================================
// Complex Queries
// =============================================================================

#[test]
fn test_complex_query_or_then_and() {
    let (_temp, store) = setup_store();
    seed(&store);

    let result = store
        .complex_query(
            &[
                condition(QueryOperator::Or, &["a", "c"]),
                condition(QueryOperator::And, &["b"]),
            ],
            1,
            10,
        )
        .unwrap();
    assert_eq!(result.keys, vec!["p1".to_string(), "p3".to_string()]);
}

#[test]
fn test_complex_query_with_not_condition() {
    let (_temp, store) = setup_store();
    seed(&store);

    let result = store
        .complex_query(
            &[
                condition(QueryOperator::Or, &["a", "b"]),
                condition(QueryOperator::Not, &["c"]),
            ],
            1,
            10,
        )
        .unwrap();
    assert_eq!(result.keys, vec!["p1".to_string(), "p2".to_string()]);
}

// =============================================================================
// Query Cache
// =============================================================================

#[test]
fn test_repeat_query_hits_cache() {
    let (_temp, store) = setup_store();
    seed(&store);

    let miss = store
        .query_by_tags_advanced(&["a"], QueryOperator::And, 1, 10)
        .unwrap();
    assert!(!miss.cache_hit);

    let hit = store
        .query_by_tags_advanced(&["a"], QueryOperator::And, 1, 10)
        .unwrap();
    assert!(hit.cache_hit);
    assert_eq!(hit.keys, miss.keys);

    let stats = store.stats().unwrap();
    assert!(stats.cache.hits >= 1);
    assert!(stats.cache.misses >= 1);
}

#[test]
fn test_write_invalidates_affected_cache() {
    let (_temp, store) = setup_store();
    seed(&store);

    store
        .query_by_tags_advanced(&["a"], QueryOperator::And, 1, 10)
        .unwrap();
    store.set("p4", b"w", &["a"]).unwrap();

    let refreshed = store
        .query_by_tags_advanced(&["a"], QueryOperator::And, 1, 10)
        .unwrap();
    assert!(!refreshed.cache_hit);
    assert_eq!(refreshed.total_count, 3);
}

// =============================================================================
// Tag Enumeration
// =============================================================================

#[test]
fn test_list_all_tags_counts_members() {
    let (_temp, store) = setup_store();
    seed(&store);

    let tags = store.list_all_tags().unwrap();
    assert_eq!(tags["a"], 2);
    assert_eq!(tags["b"], 2);
    assert_eq!(tags["c"], 1);
    assert_eq!(tags.len(), 3);

    store.delete("p3").unwrap();
    let tags = store.list_all_tags().unwrap();
    assert!(!tags.contains_key("c"));
    assert_eq!(tags["b"], 1);
}

// =============================================================================
// Index Rebuild
// =============================================================================

#[test]
fn test_index_rebuilds_from_metadata_on_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .db("querydb")
        .namespace("ns")
        .build();

    {
        let store = Store::open(config.clone()).unwrap();
        seed(&store);
        store.flush().unwrap();
    }

    // A fresh instance rebuilds the in-memory index from the catalog
    let store = Store::open(config).unwrap();
    let results = store.query_by_tags(&["a", "b"]).unwrap();
    assert_eq!(results.len(), 1);
    assert!(results.contains_key("p1"));
    assert_eq!(store.list_all_tags().unwrap().len(), 3);
}
