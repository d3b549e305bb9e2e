//! Write Buffer
//!
//! In-memory staging area for recent writes under buffered backends.
//!
//! ## Responsibilities
//! - Hold pending payloads keyed by key, with a running byte total
//! - Signal when the high-water mark is crossed (the caller schedules the
//!   flush; nothing flushes inline under a per-key lock)
//! - Flush by atomically snapshotting the live map, then writing entries
//!   one by one; individual failures go back into the live map and the
//!   remaining entries continue
//!
//! Reads consult the buffer before the backend; an entry stays visible in
//! the flushing snapshot until its backend write has succeeded, so a get
//! racing a flush never misses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::backend::StorageBackend;
use crate::error::Result;

/// A single pending write
#[derive(Debug, Clone)]
pub struct BufferEntry {
    /// Backend-relative storage path for the payload
    pub path: String,

    /// Payload exactly as it will reach the backend (possibly compressed)
    pub payload: Vec<u8>,

    /// Original (uncompressed) value size
    pub original_size: u64,
}

/// In-memory buffer of pending writes
pub struct WriteBuffer {
    /// Writes accepted but not yet snapshotted for flush
    live: RwLock<HashMap<String, BufferEntry>>,

    /// Snapshot currently being written to the backend
    flushing: RwLock<HashMap<String, BufferEntry>>,

    /// Approximate bytes staged in the live map
    size: AtomicUsize,

    /// Flush trigger threshold in bytes
    high_water: usize,

    /// Serializes flush cycles
    flush_lock: Mutex<()>,
}

impl WriteBuffer {
    pub fn new(high_water: usize) -> Self {
        Self {
            live: RwLock::new(HashMap::new()),
            flushing: RwLock::new(HashMap::new()),
            size: AtomicUsize::new(0),
            high_water,
            flush_lock: Mutex::new(()),
        }
    }

    /// Stage a write. Returns true when the high-water mark is crossed
    /// and the caller should schedule a flush.
    pub fn insert(&self, key: String, entry: BufferEntry) -> bool {
        let entry_size = key.len() + entry.payload.len();
        let mut live = self.live.write();

        let old_size = live
            .get(&key)
            .map(|old| key.len() + old.payload.len())
            .unwrap_or(0);
        live.insert(key, entry);
        drop(live);

        if entry_size >= old_size {
            self.size.fetch_add(entry_size - old_size, Ordering::Relaxed);
        } else {
            self.size.fetch_sub(old_size - entry_size, Ordering::Relaxed);
        }

        self.size.load(Ordering::Relaxed) >= self.high_water
    }

    /// Look up a pending entry, preferring the freshest staging area
    pub fn get(&self, key: &str) -> Option<BufferEntry> {
        if let Some(entry) = self.live.read().get(key) {
            return Some(entry.clone());
        }
        self.flushing.read().get(key).cloned()
    }

    /// Drop a key from both staging areas (delete or TTL sweep)
    pub fn remove(&self, key: &str) -> bool {
        let mut removed = false;
        {
            let mut live = self.live.write();
            if let Some(old) = live.remove(key) {
                self.size
                    .fetch_sub(key.len() + old.payload.len(), Ordering::Relaxed);
                removed = true;
            }
        }
        if self.flushing.write().remove(key).is_some() {
            removed = true;
        }
        removed
    }

    /// Bytes currently staged in the live map
    pub fn byte_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Number of pending entries (live + flushing)
    pub fn len(&self) -> usize {
        self.live.read().len() + self.flushing.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether staged bytes have reached the high-water mark
    pub fn should_flush(&self) -> bool {
        self.byte_size() >= self.high_water
    }

    /// Drain the buffer into the backend. Blocks until the snapshot is
    /// fully attempted; returns the number of entries written.
    ///
    /// Entries whose write failed are re-inserted into the live map and
    /// the first error is surfaced after the remaining entries were
    /// still attempted.
    pub fn flush(&self, backend: &dyn StorageBackend) -> Result<usize> {
        let _guard = self.flush_lock.lock();

        // Move live -> flushing atomically
        {
            let mut live = self.live.write();
            if live.is_empty() {
                return Ok(0);
            }
            let mut flushing = self.flushing.write();
            debug_assert!(flushing.is_empty());
            *flushing = std::mem::take(&mut *live);
            self.size.store(0, Ordering::Relaxed);
        }

        let snapshot: Vec<(String, BufferEntry)> = self
            .flushing
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut written = 0;
        let mut first_error = None;
        for (key, entry) in snapshot {
            match backend.write_data(&entry.path, &entry.payload) {
                Ok(()) => {
                    self.flushing.write().remove(&key);
                    written += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        component = "buffer",
                        key = %key,
                        error = %e,
                        "flush entry failed, re-staging"
                    );
                    // A concurrent write may have re-staged a newer payload;
                    // it wins over the failed one
                    if let Some(entry) = self.flushing.write().remove(&key) {
                        let mut live = self.live.write();
                        if !live.contains_key(&key) {
                            self.size
                                .fetch_add(key.len() + entry.payload.len(), Ordering::Relaxed);
                            live.insert(key, entry);
                        }
                    }
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FilesystemBackend;
    use tempfile::TempDir;

    fn entry(path: &str, payload: &[u8]) -> BufferEntry {
        BufferEntry {
            path: path.to_string(),
            payload: payload.to_vec(),
            original_size: payload.len() as u64,
        }
    }

    #[test]
    fn test_insert_tracks_size_and_high_water() {
        let buffer = WriteBuffer::new(16);

        assert!(!buffer.insert("a".into(), entry("db/aa/bb/a", b"12345")));
        assert_eq!(buffer.byte_size(), 6);

        // Overwrite replaces the accounted size, it does not add
        assert!(!buffer.insert("a".into(), entry("db/aa/bb/a", b"123")));
        assert_eq!(buffer.byte_size(), 4);

        assert!(buffer.insert("b".into(), entry("db/aa/bb/b", b"0123456789abcdef")));
    }

    #[test]
    fn test_flush_drains_to_backend() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::open(dir.path()).unwrap();
        let buffer = WriteBuffer::new(1024);

        buffer.insert("a".into(), entry("db/aa/bb/a", b"va"));
        buffer.insert("b".into(), entry("db/aa/bb/b", b"vb"));

        let written = buffer.flush(&backend).unwrap();
        assert_eq!(written, 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.byte_size(), 0);
        assert_eq!(backend.read_data("db/aa/bb/a").unwrap(), b"va");
        assert_eq!(backend.read_data("db/aa/bb/b").unwrap(), b"vb");
    }

    #[test]
    fn test_failed_entries_are_restaged() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::open(dir.path()).unwrap();
        let buffer = WriteBuffer::new(1024);

        buffer.insert("good".into(), entry("db/aa/bb/good", b"ok"));
        // Traversal path makes this entry fail without touching disk
        buffer.insert("bad".into(), entry("../escape", b"nope"));

        let err = buffer.flush(&backend).unwrap_err();
        assert!(matches!(err, crate::error::QuartzError::PathTraversal(_)));

        // The good entry landed, the bad one is staged again
        assert_eq!(backend.read_data("db/aa/bb/good").unwrap(), b"ok");
        assert_eq!(buffer.len(), 1);
        assert!(buffer.get("bad").is_some());
    }

    #[test]
    fn test_remove_clears_pending_write() {
        let buffer = WriteBuffer::new(1024);
        buffer.insert("a".into(), entry("db/aa/bb/a", b"v"));

        assert!(buffer.remove("a"));
        assert!(!buffer.remove("a"));
        assert!(buffer.is_empty());
        assert_eq!(buffer.byte_size(), 0);
    }
}
