//! Tests for the networked KV backend
//!
//! These tests exercise the Redis-wire backend end to end: native
//! metadata hashes, tag sets, native TTL and SCAN-based iteration.
//!
//! They require a reachable server and are ignored by default; run with
//! `cargo test -- --ignored` against a disposable instance, e.g.
//! `QUARTZKV_TEST_REDIS_URL=redis://127.0.0.1:6379/15`. Database 15 is
//! flushed between assertions by using per-test namespaces instead.

use std::time::Duration;

use quartzkv::{
    BackendKind, Config, ConnectionParams, MetadataQuery, NetworkKvBackend, QuartzError, Store,
    StorageBackend,
};
use uuid::Uuid;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_url() -> String {
    std::env::var("QUARTZKV_TEST_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string())
}

fn connection_params() -> ConnectionParams {
    ConnectionParams {
        url: test_url(),
        pool_size: 4,
        checkout_timeout: Duration::from_secs(2),
        operation_timeout: Duration::from_secs(2),
    }
}

/// Unique namespace per test run keeps assertions isolated
fn unique_ns() -> String {
    format!("t{}", &Uuid::new_v4().simple().to_string()[..10])
}

fn setup_store(namespace: &str) -> std::sync::Arc<Store> {
    let config = Config::builder()
        .data_dir(std::env::temp_dir().join("quartzkv-net-test"))
        .db("nettest")
        .namespace(namespace)
        .backend(BackendKind::NetworkKv)
        .connection(connection_params())
        .build();
    Store::open(config).unwrap()
}

// =============================================================================
// Backend Capabilities
// =============================================================================

#[test]
#[ignore = "requires a running redis-compatible server"]
fn test_network_backend_capabilities() {
    let backend = NetworkKvBackend::connect(&connection_params()).unwrap();
    let caps = backend.capabilities();

    assert!(!caps.supports_buffering);
    assert!(caps.supports_native_ttl);
    assert!(caps.supports_metadata);
    assert!(caps.is_distributed);
    assert_eq!(caps.max_value_size_bytes, Some(512 * 1024 * 1024));
}

// =============================================================================
// Store on the Networked Backend
// =============================================================================

#[test]
#[ignore = "requires a running redis-compatible server"]
fn test_immediate_write_round_trip() {
    let ns = unique_ns();
    let store = setup_store(&ns);

    store.set("k", b"network-value", &["remote"]).unwrap();

    // Immediate strategy: nothing is buffered
    let stats = store.stats().unwrap();
    assert_eq!(stats.buffered_entries, 0);

    assert_eq!(store.get("k").unwrap(), b"network-value");
    let results = store.query_by_tags(&["remote"]).unwrap();
    assert!(results.contains_key("k"));

    store.delete("k").unwrap();
    assert!(matches!(store.get("k").unwrap_err(), QuartzError::NotFound));
}

#[test]
#[ignore = "requires a running redis-compatible server"]
fn test_native_ttl_expires_server_side() {
    let ns = unique_ns();
    let store = setup_store(&ns);

    store.set_with_ttl("lease", b"v", 1, &["short"]).unwrap();
    assert_eq!(store.get("lease").unwrap(), b"v");

    std::thread::sleep(Duration::from_millis(1500));

    // The server evicted both blob and metadata on its own
    assert!(matches!(store.get("lease").unwrap_err(), QuartzError::NotFound));

    // The sweep prunes the leftover tag-set membership
    store.purge_expired().unwrap();
    assert!(store.query_by_tags(&["short"]).unwrap().is_empty());
}

#[test]
#[ignore = "requires a running redis-compatible server"]
fn test_native_metadata_query() {
    let ns = unique_ns();
    let store = setup_store(&ns);

    store.set("a", b"1", &["x", "y"]).unwrap();
    store.set("b", b"2", &["x"]).unwrap();

    let backend = NetworkKvBackend::connect(&connection_params()).unwrap();
    let mut query = MetadataQuery::scope("nettest", &ns);
    query.tags = vec!["x".into(), "y".into()];
    let records = backend.query_metadata(&query).unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, "a");
}
