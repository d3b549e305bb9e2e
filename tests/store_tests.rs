//! Tests for the Store facade
//!
//! These tests verify:
//! - Basic set/get/delete round trips
//! - Key validation and error taxonomy
//! - TTL behavior on the read path
//! - Transparent compression
//! - Metadata bookkeeping (timestamps, tags, size)
//! - Concurrent access from many threads

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use quartzkv::{Config, QuartzError, Store};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_store() -> (TempDir, Arc<Store>) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .db("testdb")
        .namespace("testns")
        .buffer_size_bytes(1024 * 1024)
        .build();
    let store = Store::open(config).unwrap();
    (temp_dir, store)
}

// =============================================================================
// Basic Operations
// =============================================================================

#[test]
fn test_set_then_get_returns_value() {
    let (_temp, store) = setup_store();

    store.set("hello", b"world", &[]).unwrap();
    assert_eq!(store.get("hello").unwrap(), b"world");
}

#[test]
fn test_get_missing_key_is_not_found() {
    let (_temp, store) = setup_store();

    let err = store.get("nonexistent").unwrap_err();
    assert!(matches!(err, QuartzError::NotFound));
}

#[test]
fn test_set_overwrites_previous_value() {
    let (_temp, store) = setup_store();

    store.set("key", b"value1", &[]).unwrap();
    store.set("key", b"value2", &[]).unwrap();

    assert_eq!(store.get("key").unwrap(), b"value2");
}

#[test]
fn test_delete_removes_key() {
    let (_temp, store) = setup_store();

    store.set("key", b"value", &["t"]).unwrap();
    store.delete("key").unwrap();

    assert!(matches!(store.get("key").unwrap_err(), QuartzError::NotFound));
    assert!(!store.contains("key").unwrap());
    assert!(store.query_by_tags(&["t"]).unwrap().is_empty());
}

#[test]
fn test_delete_missing_key_is_not_found() {
    let (_temp, store) = setup_store();

    let err = store.delete("nonexistent").unwrap_err();
    assert!(matches!(err, QuartzError::NotFound));
}

#[test]
fn test_empty_and_oversized_keys_are_rejected() {
    let (_temp, store) = setup_store();

    let err = store.set("", b"v", &[]).unwrap_err();
    assert!(matches!(err, QuartzError::InvalidArgument(_)));

    let long_key = "k".repeat(1025);
    let err = store.set(&long_key, b"v", &[]).unwrap_err();
    assert!(matches!(err, QuartzError::InvalidArgument(_)));

    // The boundary itself is accepted
    let max_key = "k".repeat(1024);
    store.set(&max_key, b"v", &[]).unwrap();
}

#[test]
fn test_negative_ttl_is_rejected() {
    let (_temp, store) = setup_store();

    let err = store.set_with_ttl("k", b"v", -5, &[]).unwrap_err();
    assert!(matches!(err, QuartzError::InvalidArgument(_)));
    let err = store.set_with_ttl("k", b"v", 0, &[]).unwrap_err();
    assert!(matches!(err, QuartzError::InvalidArgument(_)));
}

#[test]
fn test_binary_values_round_trip() {
    let (_temp, store) = setup_store();

    let value: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    store.set("binary", &value, &[]).unwrap();
    assert_eq!(store.get("binary").unwrap(), value);
}

// =============================================================================
// Compression
// =============================================================================

#[test]
fn test_large_values_are_transparent_through_compression() {
    let (_temp, store) = setup_store();

    // Compressible payload well above the 1 KiB threshold
    let value = vec![7u8; 64 * 1024];
    store.set("big", &value, &[]).unwrap();
    store.flush().unwrap();

    let (read, meta) = store.get_with_metadata("big").unwrap();
    assert_eq!(read, value);
    // Metadata records the original size, not the stored size
    assert_eq!(meta.size, value.len() as u64);
}

#[test]
fn test_compression_disabled_still_round_trips() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .compression_enabled(false)
        .build();
    let store = Store::open(config).unwrap();

    let value = vec![9u8; 8192];
    store.set("raw", &value, &[]).unwrap();
    store.flush().unwrap();
    assert_eq!(store.get("raw").unwrap(), value);
}

// =============================================================================
// Metadata
// =============================================================================

#[test]
fn test_get_with_metadata_reports_tags_and_ttl() {
    let (_temp, store) = setup_store();

    store
        .set_with_ttl("k", b"v", 3600, &["alpha", "beta", "alpha"])
        .unwrap();

    let (value, meta) = store.get_with_metadata("k").unwrap();
    assert_eq!(value, b"v");
    assert_eq!(meta.key, "k");
    assert_eq!(meta.db, "testdb");
    assert_eq!(meta.namespace, "testns");
    assert_eq!(meta.ttl, Some(3600));
    // Duplicate tags collapse
    assert_eq!(meta.tags, vec!["alpha".to_string(), "beta".to_string()]);
    assert!(meta.created_at > 0);
    assert!(meta.last_updated >= meta.created_at);
}

#[test]
fn test_update_preserves_created_at() {
    let (_temp, store) = setup_store();

    store.set("k", b"v1", &[]).unwrap();
    let (_, first) = store.get_with_metadata("k").unwrap();

    thread::sleep(Duration::from_millis(20));
    store.set("k", b"v2", &[]).unwrap();
    let (_, second) = store.get_with_metadata("k").unwrap();

    assert_eq!(second.created_at, first.created_at);
    assert!(second.last_updated >= first.last_updated);
}

#[test]
fn test_count_tracks_live_keys() {
    let (_temp, store) = setup_store();

    assert_eq!(store.count().unwrap(), 0);
    store.set("a", b"1", &[]).unwrap();
    store.set("b", b"2", &[]).unwrap();
    assert_eq!(store.count().unwrap(), 2);

    store.delete("a").unwrap();
    assert_eq!(store.count().unwrap(), 1);
}

// =============================================================================
// TTL Read Path
// =============================================================================

#[test]
fn test_expired_key_reads_as_not_found() {
    let (_temp, store) = setup_store();

    store.set_with_ttl("fleeting", b"v", 1, &[]).unwrap();
    assert_eq!(store.get("fleeting").unwrap(), b"v");

    thread::sleep(Duration::from_millis(1100));
    assert!(matches!(
        store.get("fleeting").unwrap_err(),
        QuartzError::NotFound
    ));
    assert!(!store.contains("fleeting").unwrap());
}

#[test]
fn test_rewrite_clears_pending_expiry() {
    let (_temp, store) = setup_store();

    store.set_with_ttl("k", b"v1", 1, &[]).unwrap();
    // Overwriting without a TTL removes the expiration
    store.set("k", b"v2", &[]).unwrap();

    thread::sleep(Duration::from_millis(1100));
    assert_eq!(store.get("k").unwrap(), b"v2");
}

// =============================================================================
// Stats
// =============================================================================

#[test]
fn test_stats_snapshot() {
    let (_temp, store) = setup_store();

    store.set("a", b"1", &["x"]).unwrap();
    store.set("b", b"2", &["y"]).unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats.count, 2);
    assert_eq!(stats.active_transactions, 0);
    assert!(stats.buffered_entries > 0);
    assert!(stats.buffer_bytes > 0);

    store.flush().unwrap();
    let stats = store.stats().unwrap();
    assert_eq!(stats.buffered_entries, 0);
    assert_eq!(stats.buffer_bytes, 0);
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_writers_on_distinct_keys() {
    let (_temp, store) = setup_store();

    let mut handles = Vec::new();
    for worker in 0..8 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            for i in 0..25 {
                let key = format!("w{}-k{}", worker, i);
                store.set(&key, format!("value-{}", i).as_bytes(), &[]).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.count().unwrap(), 8 * 25);
    assert_eq!(store.get("w3-k7").unwrap(), b"value-7");
}

#[test]
fn test_concurrent_writers_on_same_key_serialize() {
    let (_temp, store) = setup_store();
    store.set("contended", b"initial", &[]).unwrap();

    let mut handles = Vec::new();
    for worker in 0..4 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            for i in 0..50 {
                store
                    .set("contended", format!("{}-{}", worker, i).as_bytes(), &[])
                    .unwrap();
                let _ = store.get("contended").unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // The final value is one of the writers' last writes
    let value = String::from_utf8(store.get("contended").unwrap()).unwrap();
    assert!(value.ends_with("-49"));
}
