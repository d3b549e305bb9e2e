//! Store Facade
//!
//! The public contract of a QuartzKV store instance. Routes every
//! operation through the backend, the metadata layer (catalog or
//! native), the write buffer, the tag index, the transaction manager
//! and the replication layer, based on backend capabilities read once
//! at construction.
//!
//! ## Write Path
//! facade -> (transaction queue if inside one) -> buffer or direct
//! backend write -> metadata update -> tag index update -> cache
//! invalidation -> replication broadcast (primary only)
//!
//! ## Read Path
//! buffer -> metadata lookup -> expiration check -> backend read ->
//! transparent decompression -> best-effort access-time refresh
//!
//! Within one instance, operations on the same key serialize through a
//! per-key lock. Replication broadcast is enqueue-only: sequence numbers
//! are assigned in apply order under the per-key lock, but no socket is
//! ever awaited there.

mod locks;

pub use locks::KeyLocks;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::backend::{
    compress_payload, decompress_payload, now_ms, storage_path, BackendCapabilities,
    FilesystemBackend, MetadataQuery, MetadataRecord, NetworkKvBackend, StorageBackend,
    WriteStrategy,
};
use crate::buffer::{BufferEntry, WriteBuffer};
use crate::catalog::MetadataCatalog;
use crate::config::{BackendKind, Config, ReplicationMode, MAX_KEY_BYTES};
use crate::error::{QuartzError, Result};
use crate::index::{CacheStats, IndexManager, QueryCondition, QueryOperator, QueryResult, QueryTypeStats};
use crate::replication::protocol::{DeletePayload, SetPayload};
use crate::replication::{OpType, PrimaryReplicator, ReplicationOp, SecondaryReplicator};
use crate::transaction::{SnapshotData, Transaction, TransactionManager};

/// Snapshot of store-level statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    /// Number of live keys in this (db, namespace)
    pub count: u64,
    pub buffer_bytes: usize,
    pub buffered_entries: usize,
    pub active_transactions: usize,
    pub uptime_s: u64,
    pub cache: CacheStats,
    pub queries: HashMap<String, QueryTypeStats>,
}

/// Embedded, thread-safe key-value store
pub struct Store {
    config: Config,
    backend: Arc<dyn StorageBackend>,
    caps: BackendCapabilities,
    use_buffering: bool,
    catalog: Option<MetadataCatalog>,
    buffer: Option<WriteBuffer>,
    index: IndexManager,
    locks: KeyLocks,
    transactions: TransactionManager,
    primary: Option<Arc<PrimaryReplicator>>,
    read_only: bool,
    started_at: Instant,
}

impl Store {
    /// Open a store with the given configuration.
    ///
    /// Construction reads the backend's capabilities once, decides the
    /// write strategy and the metadata home, rebuilds the tag index from
    /// a metadata scan, and (in primary mode) starts the replication
    /// listener.
    pub fn open(config: Config) -> Result<Arc<Self>> {
        let backend: Arc<dyn StorageBackend> = match config.backend {
            BackendKind::Filesystem => Arc::new(FilesystemBackend::open(&config.data_dir)?),
            BackendKind::NetworkKv => Arc::new(NetworkKvBackend::connect(&config.connection)?),
        };
        let caps = backend.capabilities();
        let use_buffering =
            caps.supports_buffering && caps.write_strategy == WriteStrategy::Buffered;

        let catalog = if caps.supports_metadata {
            None
        } else {
            std::fs::create_dir_all(&config.data_dir)?;
            Some(MetadataCatalog::open(&Self::catalog_path(&config))?)
        };

        let buffer = use_buffering.then(|| WriteBuffer::new(config.buffer_size_bytes));
        let index = IndexManager::new(
            &config.db,
            &config.namespace,
            config.cache_size,
            config.query_cache_ttl,
        );

        let primary = match config.replication.mode {
            ReplicationMode::Primary => {
                let replicator = PrimaryReplicator::new(&config.replication);
                replicator.start()?;
                Some(replicator)
            }
            _ => None,
        };
        let read_only = config.replication.mode == ReplicationMode::Secondary;

        let store = Arc::new(Self {
            read_only,
            use_buffering,
            caps,
            backend,
            catalog,
            buffer,
            index,
            locks: KeyLocks::new(),
            transactions: TransactionManager::new(),
            primary,
            started_at: Instant::now(),
            config,
        });

        store.rebuild_index()?;

        tracing::info!(
            component = "store",
            db = store.db(),
            namespace = store.namespace(),
            buffered = store.use_buffering,
            native_metadata = store.caps.supports_metadata,
            read_only = store.read_only,
            "store opened"
        );
        Ok(store)
    }

    fn catalog_path(config: &Config) -> PathBuf {
        config.data_dir.join(format!("{}_meta.sqlite3", config.db))
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn db(&self) -> &str {
        &self.config.db
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.caps
    }

    /// Primary replicator handle, when this store is a primary
    pub fn primary_replicator(&self) -> Option<&Arc<PrimaryReplicator>> {
        self.primary.as_ref()
    }

    pub(crate) fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Start the secondary replication client for this store.
    ///
    /// Only valid when the store was opened in secondary mode.
    pub fn start_secondary(self: &Arc<Self>) -> Result<Arc<SecondaryReplicator>> {
        if self.config.replication.mode != ReplicationMode::Secondary {
            return Err(QuartzError::InvalidState(
                "store is not configured as a replication secondary".to_string(),
            ));
        }
        let replicator =
            SecondaryReplicator::new(Arc::clone(self), &self.config.replication.primary_addr);
        replicator.start()?;
        Ok(replicator)
    }

    // -------------------------------------------------------------------------
    // Public Contract: Writes
    // -------------------------------------------------------------------------

    /// Store a value with optional tags
    pub fn set(&self, key: &str, value: &[u8], tags: &[&str]) -> Result<()> {
        self.ensure_writable()?;
        self.validate_key(key)?;
        self.write_record(key, value, Self::collect_tags(tags), None, None, true)
    }

    /// Store a value that expires `ttl_seconds` after its last update
    pub fn set_with_ttl(&self, key: &str, value: &[u8], ttl_seconds: i64, tags: &[&str]) -> Result<()> {
        self.ensure_writable()?;
        self.validate_key(key)?;
        if ttl_seconds <= 0 {
            return Err(QuartzError::InvalidArgument(format!(
                "ttl must be positive, got {}",
                ttl_seconds
            )));
        }
        self.write_record(key, value, Self::collect_tags(tags), Some(ttl_seconds), None, true)
    }

    /// Delete a key, its metadata and its blob
    pub fn delete(&self, key: &str) -> Result<()> {
        self.ensure_writable()?;
        self.validate_key(key)?;
        let existed = self.delete_record(key, true)?;
        if existed {
            Ok(())
        } else {
            Err(QuartzError::NotFound)
        }
    }

    /// Force a full buffer drain to the backend
    pub fn flush(&self) -> Result<()> {
        if let Some(buffer) = &self.buffer {
            buffer.flush(self.backend.as_ref())?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Public Contract: Reads
    // -------------------------------------------------------------------------

    /// Fetch a value
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.get_with_metadata(key).map(|(value, _)| value)
    }

    /// Fetch a value together with its metadata record
    pub fn get_with_metadata(&self, key: &str) -> Result<(Vec<u8>, MetadataRecord)> {
        self.validate_key(key)?;
        let lock = self.locks.acquire(key);
        let _guard = lock.lock();

        let meta = match self.meta_get(key)? {
            Some(meta) => meta,
            None => return Err(QuartzError::NotFound),
        };
        if meta.is_expired(now_ms()) {
            // Surfaced as NotFound; the sweeper reclaims the blob
            return Err(QuartzError::NotFound);
        }

        // Pending writes short-circuit backend IO
        if let Some(entry) = self.buffer.as_ref().and_then(|b| b.get(key)) {
            let value = decompress_payload(entry.payload)?;
            self.touch_accessed(key);
            return Ok((value, meta));
        }

        let raw = match self.backend.read_data(&meta.path) {
            Ok(raw) => raw,
            Err(QuartzError::NotFound) => {
                tracing::warn!(
                    component = "store",
                    db = self.db(),
                    key = key,
                    path = %meta.path,
                    "metadata present but blob missing; will reconcile on next write"
                );
                return Err(QuartzError::NotFound);
            }
            Err(e) => return Err(e),
        };
        let value = decompress_payload(raw)?;
        self.touch_accessed(key);
        Ok((value, meta))
    }

    /// Whether a key exists and has not expired
    pub fn contains(&self, key: &str) -> Result<bool> {
        self.validate_key(key)?;
        Ok(self
            .meta_get(key)?
            .map(|meta| !meta.is_expired(now_ms()))
            .unwrap_or(false))
    }

    /// Number of live keys in this (db, namespace)
    pub fn count(&self) -> Result<u64> {
        match &self.catalog {
            Some(catalog) => Ok(catalog.count(self.db(), self.namespace())?),
            None => Ok(self
                .backend
                .query_metadata(&MetadataQuery::scope(self.db(), self.namespace()))?
                .len() as u64),
        }
    }

    // -------------------------------------------------------------------------
    // Public Contract: Queries
    // -------------------------------------------------------------------------

    /// Keys carrying ALL of the given tags, enriched with metadata
    pub fn query_by_tags(&self, tags: &[&str]) -> Result<HashMap<String, MetadataRecord>> {
        let tag_list: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        let keys = self.index.query_tags(&tag_list, QueryOperator::And);

        let mut results = HashMap::with_capacity(keys.len());
        let now = now_ms();
        for key in keys {
            if let Some(meta) = self.meta_get(&key)? {
                if !meta.is_expired(now) {
                    results.insert(key, meta);
                }
            }
        }
        Ok(results)
    }

    /// Paged tag query with AND / OR / NOT semantics and cached results
    pub fn query_by_tags_advanced(
        &self,
        tags: &[&str],
        operator: QueryOperator,
        page: usize,
        page_size: usize,
    ) -> Result<QueryResult> {
        let tag_list: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        Ok(self.index.query_paged(&tag_list, operator, page, page_size))
    }

    /// Multi-condition query, folded left to right
    pub fn complex_query(
        &self,
        conditions: &[QueryCondition],
        page: usize,
        page_size: usize,
    ) -> Result<QueryResult> {
        Ok(self.index.complex_query(conditions, page, page_size))
    }

    /// Every tag in use, with the number of keys carrying it
    pub fn list_all_tags(&self) -> Result<HashMap<String, usize>> {
        Ok(self.index.tag_counts())
    }

    /// Store-level statistics snapshot
    pub fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            count: self.count()?,
            buffer_bytes: self.buffer.as_ref().map(|b| b.byte_size()).unwrap_or(0),
            buffered_entries: self.buffer.as_ref().map(|b| b.len()).unwrap_or(0),
            active_transactions: self.transactions.active_count(),
            uptime_s: self.started_at.elapsed().as_secs(),
            cache: self.index.cache_stats(),
            queries: self.index.query_stats(),
        })
    }

    // -------------------------------------------------------------------------
    // Public Contract: Transactions
    // -------------------------------------------------------------------------

    /// Begin a scoped transaction.
    ///
    /// Commit applies the queued operations atomically; dropping the
    /// handle without committing rolls back.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        self.ensure_writable()?;
        Ok(Transaction::begin(self))
    }

    // -------------------------------------------------------------------------
    // Maintenance (synchronizer + backup entry points)
    // -------------------------------------------------------------------------

    /// Remove every expired key: metadata, blob, buffered entry, index.
    /// Returns how many keys were reclaimed.
    pub fn purge_expired(&self) -> Result<usize> {
        let expired = match &self.catalog {
            Some(catalog) => catalog.cleanup_expired(self.db(), self.namespace(), now_ms())?,
            None => self.backend.cleanup_expired(self.db(), self.namespace())?,
        };

        for record in &expired {
            let lock = self.locks.acquire(&record.key);
            let _guard = lock.lock();

            // A concurrent set may have re-created the key after the
            // metadata cleanup; its new blob must survive
            if self.meta_get(&record.key)?.is_some() {
                continue;
            }
            if let Some(buffer) = &self.buffer {
                buffer.remove(&record.key);
            }
            if let Err(e) = self.backend.delete_file(&record.path) {
                tracing::warn!(
                    component = "store",
                    key = %record.key,
                    error = %e,
                    "failed to delete expired blob"
                );
            }
            self.index.remove_key(&record.key);
        }

        if !expired.is_empty() {
            tracing::debug!(
                component = "store",
                db = self.db(),
                namespace = self.namespace(),
                removed = expired.len(),
                "purged expired keys"
            );
        }
        Ok(expired.len())
    }

    /// Delete blobs that no metadata record references. Orphan metadata
    /// (a record whose blob is missing and not buffered) is reported and
    /// left for the next write to reconcile.
    pub fn sweep_orphans(&self) -> Result<usize> {
        // Native-metadata backends expire blob and record atomically
        let catalog = match &self.catalog {
            Some(catalog) => catalog,
            None => return Ok(0),
        };

        let mut removed = 0;
        let mut cursor = 0u64;
        loop {
            let (paths, next) = self.backend.scan_paths(self.db(), cursor, 512)?;
            for path in paths {
                if !catalog.path_known(&path)? {
                    self.backend.delete_file(&path)?;
                    removed += 1;
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // Report orphan metadata without mutating it
        let records = catalog.query_metadata(&MetadataQuery::scope(self.db(), self.namespace()))?;
        for record in records {
            let buffered = self
                .buffer
                .as_ref()
                .map(|b| b.get(&record.key).is_some())
                .unwrap_or(false);
            if !buffered && !self.backend.file_exists(&record.path)? {
                tracing::warn!(
                    component = "store",
                    key = %record.key,
                    path = %record.path,
                    "orphan metadata record; blob will be re-created on next write"
                );
            }
        }
        Ok(removed)
    }

    /// Rebuild the tag index from a full metadata scan
    pub fn rebuild_index(&self) -> Result<()> {
        let records = match &self.catalog {
            Some(catalog) => {
                catalog.query_metadata(&MetadataQuery::scope(self.db(), self.namespace()))?
            }
            None => self
                .backend
                .query_metadata(&MetadataQuery::scope(self.db(), self.namespace()))?,
        };
        self.index
            .rebuild(records.into_iter().map(|r| (r.key, r.tags)));
        Ok(())
    }

    /// Metadata of every live key in scope (backup enumeration)
    pub(crate) fn all_metadata(&self) -> Result<Vec<MetadataRecord>> {
        match &self.catalog {
            Some(catalog) => {
                Ok(catalog.query_metadata(&MetadataQuery::scope(self.db(), self.namespace()))?)
            }
            None => self
                .backend
                .query_metadata(&MetadataQuery::scope(self.db(), self.namespace())),
        }
    }

    /// Metadata of keys updated strictly after `since_ms` (incremental backup)
    pub(crate) fn metadata_updated_after(&self, since_ms: i64) -> Result<Vec<MetadataRecord>> {
        let mut query = MetadataQuery::scope(self.db(), self.namespace());
        query.updated_after = Some(since_ms);
        match &self.catalog {
            Some(catalog) => Ok(catalog.query_metadata(&query)?),
            None => self.backend.query_metadata(&query),
        }
    }

    /// Write one restored entry, preserving its original update time
    pub(crate) fn restore_entry(
        &self,
        key: &str,
        value: &[u8],
        tags: &[String],
        ttl: Option<i64>,
        last_updated: i64,
    ) -> Result<()> {
        self.ensure_writable()?;
        self.validate_key(key)?;
        let tags: BTreeSet<String> = tags.iter().cloned().collect();
        self.write_record(
            key,
            value,
            tags.into_iter().collect(),
            ttl,
            Some(last_updated),
            true,
        )
    }

    /// Delete every key in this (db, namespace). Returns how many were
    /// removed. Used by restore with `clear_existing`.
    pub(crate) fn clear_namespace(&self) -> Result<usize> {
        self.ensure_writable()?;
        let records = self.all_metadata()?;
        let mut removed = 0;
        for record in records {
            if self.delete_record(&record.key, true)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Transaction Support (crate-internal)
    // -------------------------------------------------------------------------

    /// Current record for a key as transaction snapshot material
    pub(crate) fn snapshot_for_tx(&self, key: &str) -> Result<Option<SnapshotData>> {
        self.validate_key(key)?;
        match self.get_with_metadata(key) {
            Ok((value, meta)) => Ok(Some(SnapshotData {
                value,
                tags: meta.tags,
                ttl: meta.ttl,
            })),
            Err(QuartzError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Apply a committed (or rollback-restoring) transactional set
    pub(crate) fn apply_tx_set(
        &self,
        key: &str,
        value: &[u8],
        tags: &[String],
        ttl: Option<i64>,
    ) -> Result<()> {
        self.ensure_writable()?;
        self.validate_key(key)?;
        let tags: BTreeSet<String> = tags.iter().cloned().collect();
        self.write_record(key, value, tags.into_iter().collect(), ttl, None, true)
    }

    /// Apply a transactional delete; absent keys are not an error so
    /// rollback of a created key is idempotent
    pub(crate) fn apply_tx_delete(&self, key: &str) -> Result<()> {
        self.ensure_writable()?;
        self.validate_key(key)?;
        self.delete_record(key, true)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Replication Support (crate-internal)
    // -------------------------------------------------------------------------

    /// Apply an operation received from the primary. Bypasses the
    /// read-only gate and never re-broadcasts.
    pub(crate) fn apply_replicated(&self, op: &ReplicationOp) -> Result<()> {
        match op.op_type {
            OpType::Set => {
                let payload: SetPayload = op.decode_payload()?;
                if payload.db != self.db() || payload.namespace != self.namespace() {
                    tracing::warn!(
                        component = "replication",
                        db = %payload.db,
                        namespace = %payload.namespace,
                        "ignoring replicated set for a different scope"
                    );
                    return Ok(());
                }
                let value = payload.value_bytes()?;
                let tags: BTreeSet<String> = payload.tags.iter().cloned().collect();
                self.write_record(
                    &payload.key,
                    &value,
                    tags.into_iter().collect(),
                    payload.ttl,
                    None,
                    false,
                )
            }
            OpType::Delete => {
                let payload: DeletePayload = op.decode_payload()?;
                if payload.db != self.db() || payload.namespace != self.namespace() {
                    return Ok(());
                }
                self.delete_record(&payload.key, false)?;
                Ok(())
            }
            OpType::Metadata => {
                let record: MetadataRecord = op.decode_payload()?;
                self.meta_set(&record)?;
                self.index.add_key(&record.key, &record.tags);
                Ok(())
            }
            other => Err(QuartzError::Protocol(format!(
                "cannot apply control operation {:?} to the store",
                other
            ))),
        }
    }

    // -------------------------------------------------------------------------
    // Core Write / Delete Paths
    // -------------------------------------------------------------------------

    /// The single write path behind set, transactions, replication apply
    /// and restore.
    ///
    /// `preserve_updated` keeps a historical last_updated (backup
    /// restore); `broadcast` is false only when applying a replicated
    /// operation on a secondary.
    fn write_record(
        &self,
        key: &str,
        value: &[u8],
        tags: Vec<String>,
        ttl: Option<i64>,
        preserve_updated: Option<i64>,
        broadcast: bool,
    ) -> Result<()> {
        if let Some(max) = self.caps.max_value_size_bytes {
            if value.len() as u64 > max {
                return Err(QuartzError::ValueTooLarge {
                    size: value.len() as u64,
                    max,
                });
            }
        }

        let compress = self.config.compression_enabled && self.caps.supports_compression;
        let payload = compress_payload(value, compress)?.into_owned();
        let path = storage_path(self.db(), self.namespace(), key);
        let now = now_ms();
        let last_updated = preserve_updated.unwrap_or(now);

        let mut should_flush = false;
        {
            let lock = self.locks.acquire(key);
            let _guard = lock.lock();

            // The catalog preserves created_at on upsert; native-metadata
            // backends overwrite the whole record, so look it up first
            let created_at = if self.caps.supports_metadata {
                self.backend
                    .get_metadata(self.db(), self.namespace(), key)?
                    .map(|m| m.created_at)
                    .unwrap_or(last_updated)
            } else {
                last_updated
            };

            if self.use_buffering {
                let buffer = self.buffer.as_ref().expect("buffered store has a buffer");
                should_flush = buffer.insert(
                    key.to_string(),
                    BufferEntry {
                        path: path.clone(),
                        payload,
                        original_size: value.len() as u64,
                    },
                );
            } else {
                self.backend.write_data(&path, &payload)?;
            }

            let record = MetadataRecord {
                db: self.db().to_string(),
                namespace: self.namespace().to_string(),
                key: key.to_string(),
                path,
                created_at,
                last_updated,
                last_accessed: now,
                size: value.len() as u64,
                ttl,
                tags: tags.clone(),
            };
            self.meta_set(&record)?;
            self.index.add_key(key, &tags);

            // Sequence assignment must match apply order, so the enqueue
            // happens under the per-key lock; it never awaits a socket.
            // Replication trouble never fails a locally-committed write.
            if broadcast {
                if let Some(primary) = &self.primary {
                    if let Err(e) =
                        primary.broadcast_set(self.db(), self.namespace(), key, value, &tags, ttl)
                    {
                        tracing::warn!(
                            component = "replication",
                            key = key,
                            error = %e,
                            "failed to broadcast set"
                        );
                    }
                }
            }
        }

        // Scheduled outside the per-key critical section
        if should_flush {
            if let Err(e) = self.flush() {
                tracing::warn!(
                    component = "store",
                    error = %e,
                    "high-water flush failed; entries remain staged"
                );
            }
        }
        Ok(())
    }

    /// The single delete path. Returns whether the key existed.
    fn delete_record(&self, key: &str, broadcast: bool) -> Result<bool> {
        let existed;
        {
            let lock = self.locks.acquire(key);
            let _guard = lock.lock();

            let meta = self.meta_get(key)?;
            existed = match meta {
                Some(meta) if !meta.is_expired(now_ms()) => {
                    if let Some(buffer) = &self.buffer {
                        buffer.remove(key);
                    }
                    self.backend.delete_file(&meta.path)?;
                    self.meta_delete(key)?;
                    self.index.remove_key(key);
                    true
                }
                Some(_) => {
                    // Expired: reclaim quietly, report NotFound
                    if let Some(buffer) = &self.buffer {
                        buffer.remove(key);
                    }
                    self.meta_delete(key)?;
                    self.index.remove_key(key);
                    false
                }
                None => false,
            };

            if existed && broadcast {
                if let Some(primary) = &self.primary {
                    if let Err(e) = primary.broadcast_delete(self.db(), self.namespace(), key) {
                        tracing::warn!(
                            component = "replication",
                            key = key,
                            error = %e,
                            "failed to broadcast delete"
                        );
                    }
                }
            }
        }
        Ok(existed)
    }

    // -------------------------------------------------------------------------
    // Metadata Routing
    // -------------------------------------------------------------------------

    fn meta_get(&self, key: &str) -> Result<Option<MetadataRecord>> {
        match &self.catalog {
            Some(catalog) => Ok(catalog.get_metadata(self.db(), self.namespace(), key)?),
            None => self.backend.get_metadata(self.db(), self.namespace(), key),
        }
    }

    fn meta_set(&self, record: &MetadataRecord) -> Result<()> {
        match &self.catalog {
            Some(catalog) => Ok(catalog.set_metadata(record)?),
            None => self.backend.set_metadata(record),
        }
    }

    fn meta_delete(&self, key: &str) -> Result<()> {
        match &self.catalog {
            Some(catalog) => {
                catalog.delete_metadata(self.db(), self.namespace(), key)?;
            }
            None => {
                self.backend.delete_metadata(self.db(), self.namespace(), key)?;
            }
        }
        Ok(())
    }

    fn touch_accessed(&self, key: &str) {
        let outcome = match &self.catalog {
            Some(catalog) => catalog.touch_accessed(self.db(), self.namespace(), key, now_ms()),
            None => self
                .backend
                .touch_accessed(self.db(), self.namespace(), key, now_ms()),
        };
        if let Err(e) = outcome {
            tracing::debug!(
                component = "store",
                key = key,
                error = %e,
                "access-time refresh failed"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(QuartzError::ReadOnly);
        }
        Ok(())
    }

    fn validate_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(QuartzError::InvalidArgument("key must not be empty".to_string()));
        }
        if key.len() > MAX_KEY_BYTES {
            return Err(QuartzError::InvalidArgument(format!(
                "key of {} bytes exceeds the {} byte limit",
                key.len(),
                MAX_KEY_BYTES
            )));
        }
        Ok(())
    }

    fn collect_tags(tags: &[&str]) -> Vec<String> {
        let unique: BTreeSet<String> = tags.iter().map(|t| t.to_string()).collect();
        unique.into_iter().collect()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Last-chance drain so accepted writes reach the backend even
        // without an orderly synchronizer stop
        if let Some(buffer) = &self.buffer {
            if let Err(e) = buffer.flush(self.backend.as_ref()) {
                tracing::warn!(component = "store", error = %e, "final flush on drop failed");
            }
        }
        if let Some(primary) = &self.primary {
            primary.stop();
        }
    }
}
