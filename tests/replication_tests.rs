//! Tests for primary/secondary replication
//!
//! These tests verify:
//! - A secondary catches up from sequence 0 via SYNC_REQUEST
//! - Live writes stream to connected secondaries in order
//! - A restarted secondary catches up without operator action
//! - Secondaries reject local writes with ReadOnly but serve reads
//! - Sequence accounting after quiescence
//!
//! All tests run both nodes in-process over loopback TCP on ephemeral
//! ports.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use quartzkv::{Config, QuartzError, ReplicationConfig, ReplicationMode, Store};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn primary_store(temp_dir: &TempDir) -> Arc<Store> {
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .db("repldb")
        .namespace("ns")
        .replication(ReplicationConfig {
            mode: ReplicationMode::Primary,
            listen_addr: "127.0.0.1:0".to_string(),
            heartbeat_interval: Duration::from_millis(500),
            ..Default::default()
        })
        .build();
    Store::open(config).unwrap()
}

fn secondary_store(temp_dir: &TempDir, primary_addr: &str) -> Arc<Store> {
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .db("repldb")
        .namespace("ns")
        .replication(ReplicationConfig {
            mode: ReplicationMode::Secondary,
            primary_addr: primary_addr.to_string(),
            heartbeat_interval: Duration::from_millis(500),
            ..Default::default()
        })
        .build();
    Store::open(config).unwrap()
}

fn primary_addr(store: &Store) -> String {
    store
        .primary_replicator()
        .expect("store is a primary")
        .local_addr()
        .expect("listener is bound")
        .to_string()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

// =============================================================================
// Catch-up
// =============================================================================

#[test]
fn test_secondary_catches_up_from_zero() {
    let temp_p = TempDir::new().unwrap();
    let temp_s = TempDir::new().unwrap();

    let primary = primary_store(&temp_p);
    for i in 0..10 {
        primary
            .set(&format!("key{}", i), format!("v{}", i).as_bytes(), &["seeded"])
            .unwrap();
    }

    let secondary = secondary_store(&temp_s, &primary_addr(&primary));
    let replicator = secondary.start_secondary().unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        secondary.count().map(|c| c == 10).unwrap_or(false)
    }));

    for i in 0..10 {
        assert_eq!(
            secondary.get(&format!("key{}", i)).unwrap(),
            format!("v{}", i).as_bytes()
        );
    }
    assert_eq!(replicator.last_applied(), 10);

    replicator.stop();
}

#[test]
fn test_live_writes_stream_to_secondary() {
    let temp_p = TempDir::new().unwrap();
    let temp_s = TempDir::new().unwrap();

    let primary = primary_store(&temp_p);
    let secondary = secondary_store(&temp_s, &primary_addr(&primary));
    let replicator = secondary.start_secondary().unwrap();

    assert!(wait_until(Duration::from_secs(10), || replicator.is_connected()));

    primary.set("live", b"streamed", &["tag"]).unwrap();
    primary.set_with_ttl("leased", b"x", 3600, &[]).unwrap();
    primary.delete("live").unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        replicator.last_applied() == 3
    }));

    assert!(matches!(
        secondary.get("live").unwrap_err(),
        QuartzError::NotFound
    ));
    let (value, meta) = secondary.get_with_metadata("leased").unwrap();
    assert_eq!(value, b"x");
    assert_eq!(meta.ttl, Some(3600));

    replicator.stop();
}

#[test]
fn test_restarted_secondary_catches_up_unaided() {
    let temp_p = TempDir::new().unwrap();
    let temp_s = TempDir::new().unwrap();

    let primary = primary_store(&temp_p);
    let addr = primary_addr(&primary);
    for i in 0..10 {
        primary.set(&format!("key{}", i), b"v", &[]).unwrap();
    }

    // First secondary session applies the first ten operations
    {
        let secondary = secondary_store(&temp_s, &addr);
        let replicator = secondary.start_secondary().unwrap();
        assert!(wait_until(Duration::from_secs(10), || {
            secondary.count().map(|c| c == 10).unwrap_or(false)
        }));
        replicator.stop();
    }

    // More writes land while the secondary is down
    for i in 10..15 {
        primary.set(&format!("key{}", i), b"v", &[]).unwrap();
    }

    // A fresh session requests from its last applied position and
    // converges without operator action
    let secondary = secondary_store(&temp_s, &addr);
    let replicator = secondary.start_secondary().unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        secondary.count().map(|c| c == 15).unwrap_or(false)
    }));

    let p_last = primary.primary_replicator().unwrap().last_sequence();
    assert!(wait_until(Duration::from_secs(5), || {
        replicator.last_applied() == p_last
    }));

    replicator.stop();
}

// =============================================================================
// Read-Only Enforcement
// =============================================================================

#[test]
fn test_secondary_rejects_writes_but_serves_reads() {
    let temp_p = TempDir::new().unwrap();
    let temp_s = TempDir::new().unwrap();

    let primary = primary_store(&temp_p);
    primary.set("shared", b"from-primary", &[]).unwrap();

    let secondary = secondary_store(&temp_s, &primary_addr(&primary));
    let replicator = secondary.start_secondary().unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        secondary.contains("shared").unwrap_or(false)
    }));

    assert!(matches!(
        secondary.set("nope", b"v", &[]).unwrap_err(),
        QuartzError::ReadOnly
    ));
    assert!(matches!(
        secondary.delete("shared").unwrap_err(),
        QuartzError::ReadOnly
    ));
    assert!(matches!(
        secondary.transaction().unwrap_err(),
        QuartzError::ReadOnly
    ));

    // Reads keep working, including after the primary goes away
    assert_eq!(secondary.get("shared").unwrap(), b"from-primary");
    replicator.stop();
    assert_eq!(secondary.get("shared").unwrap(), b"from-primary");
}

// =============================================================================
// Primary Bookkeeping
// =============================================================================

#[test]
fn test_primary_tracks_replicas_and_sequences() {
    let temp_p = TempDir::new().unwrap();
    let temp_s = TempDir::new().unwrap();

    let primary = primary_store(&temp_p);
    let replicator_handle = primary.primary_replicator().unwrap();
    assert_eq!(replicator_handle.last_sequence(), 0);
    assert_eq!(replicator_handle.replica_count(), 0);

    primary.set("a", b"1", &[]).unwrap();
    primary.set("b", b"2", &[]).unwrap();
    assert_eq!(replicator_handle.last_sequence(), 2);

    let secondary = secondary_store(&temp_s, &primary_addr(&primary));
    let replicator = secondary.start_secondary().unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        replicator_handle.replica_count() == 1
    }));
    assert!(wait_until(Duration::from_secs(10), || {
        replicator.last_applied() == 2
    }));

    let stats = replicator_handle.replica_stats();
    assert_eq!(stats.len(), 1);
    assert!(stats[0].sent >= 2);
    assert!(stats[0].connected);

    replicator.stop();
}

#[test]
fn test_local_writes_on_primary_survive_without_replicas() {
    let temp_p = TempDir::new().unwrap();
    let primary = primary_store(&temp_p);

    // No replicas connected; writes succeed locally regardless
    for i in 0..5 {
        primary.set(&format!("solo{}", i), b"v", &[]).unwrap();
    }
    assert_eq!(primary.count().unwrap(), 5);
    assert_eq!(primary.primary_replicator().unwrap().last_sequence(), 5);
}
