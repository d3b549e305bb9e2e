//! Background Synchronizer
//!
//! A single worker thread that periodically flushes registered stores
//! and sweeps expired keys.
//!
//! ## Responsibilities
//! - Time-based buffer flush every `flush_interval`, whether or not the
//!   size threshold was crossed
//! - TTL sweep every `ttl_sweep_interval`: expired metadata is removed,
//!   blobs deleted, buffered entries dropped; orphaned blobs are
//!   reclaimed in the same pass
//! - Per-store error isolation: one failing store never aborts the tick
//!
//! Stores are held as weak references; a dropped store silently leaves
//! the registry, so registration cannot extend store lifetimes or
//! create shutdown-order hazards.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::store::Store;

/// How long `stop` waits for the worker to finish its final cycle
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Periodic flush-and-sweep worker shared by one or more stores
pub struct Synchronizer {
    flush_interval: Duration,
    ttl_sweep_interval: Duration,
    stores: Arc<Mutex<Vec<Weak<Store>>>>,
    worker: Mutex<Option<WorkerHandle>>,
}

struct WorkerHandle {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl Synchronizer {
    pub fn new(flush_interval: Duration, ttl_sweep_interval: Duration) -> Self {
        Self {
            flush_interval,
            ttl_sweep_interval,
            stores: Arc::new(Mutex::new(Vec::new())),
            worker: Mutex::new(None),
        }
    }

    /// Register a store for periodic flushes and sweeps
    pub fn register(&self, store: &Arc<Store>) {
        let mut stores = self.stores.lock();
        stores.retain(|weak| weak.strong_count() > 0);
        stores.push(Arc::downgrade(store));
    }

    /// Number of live registered stores
    pub fn registered_count(&self) -> usize {
        self.stores
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Start the worker thread. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let stores = Arc::clone(&self.stores);
        let flush_interval = self.flush_interval;
        let ttl_sweep_interval = self.ttl_sweep_interval;

        let spawned = thread::Builder::new()
            .name("quartzkv-sync".to_string())
            .spawn(move || {
                tracing::debug!(component = "sync", "synchronizer worker started");
                let mut last_sweep = Instant::now();

                loop {
                    match stop_rx.recv_timeout(flush_interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            Self::flush_all(&stores);
                            if last_sweep.elapsed() >= ttl_sweep_interval {
                                Self::sweep_all(&stores);
                                last_sweep = Instant::now();
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            // Final flush + sweep before exiting
                            Self::flush_all(&stores);
                            Self::sweep_all(&stores);
                            break;
                        }
                    }
                }
                tracing::debug!(component = "sync", "synchronizer worker stopped");
            });

        match spawned {
            Ok(thread) => *worker = Some(WorkerHandle { stop_tx, thread }),
            Err(e) => tracing::error!(
                component = "sync",
                error = %e,
                "failed to spawn synchronizer worker"
            ),
        }
    }

    /// Signal the worker, let it run one final flush + sweep, and join
    /// with a bounded timeout
    pub fn stop(&self) {
        let handle = match self.worker.lock().take() {
            Some(handle) => handle,
            None => return,
        };

        let _ = handle.stop_tx.send(());

        let deadline = Instant::now() + STOP_JOIN_TIMEOUT;
        while !handle.thread.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if handle.thread.is_finished() {
            let _ = handle.thread.join();
        } else {
            tracing::warn!(
                component = "sync",
                "synchronizer worker did not stop within timeout, detaching"
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    // -------------------------------------------------------------------------
    // Worker Body
    // -------------------------------------------------------------------------

    fn live_stores(stores: &Mutex<Vec<Weak<Store>>>) -> Vec<Arc<Store>> {
        let mut registry = stores.lock();
        registry.retain(|weak| weak.strong_count() > 0);
        registry.iter().filter_map(Weak::upgrade).collect()
    }

    fn flush_all(stores: &Mutex<Vec<Weak<Store>>>) {
        for store in Self::live_stores(stores) {
            if let Err(e) = store.flush() {
                tracing::warn!(
                    component = "sync",
                    operation = "flush",
                    db = store.db(),
                    namespace = store.namespace(),
                    error = %e,
                    "periodic flush failed, will retry next tick"
                );
            }
        }
    }

    fn sweep_all(stores: &Mutex<Vec<Weak<Store>>>) {
        let started = Instant::now();
        let mut total_removed = 0usize;

        for store in Self::live_stores(stores) {
            match store.purge_expired() {
                Ok(removed) => total_removed += removed,
                Err(e) => tracing::warn!(
                    component = "sync",
                    operation = "ttl_sweep",
                    db = store.db(),
                    namespace = store.namespace(),
                    error = %e,
                    "TTL sweep failed for store"
                ),
            }
            match store.sweep_orphans() {
                Ok(0) => {}
                Ok(orphans) => tracing::info!(
                    component = "sync",
                    operation = "orphan_sweep",
                    db = store.db(),
                    namespace = store.namespace(),
                    removed = orphans,
                    "deleted orphaned blobs"
                ),
                Err(e) => tracing::warn!(
                    component = "sync",
                    operation = "orphan_sweep",
                    db = store.db(),
                    namespace = store.namespace(),
                    error = %e,
                    "orphan sweep failed for store"
                ),
            }
        }

        tracing::info!(
            component = "sync",
            operation = "ttl_sweep",
            removed = total_removed,
            duration_ms = started.elapsed().as_millis() as u64,
            "TTL sweep complete"
        );
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}
