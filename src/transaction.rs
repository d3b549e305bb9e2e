//! Transactions
//!
//! Scoped units of work with snapshot-based rollback.
//!
//! ## Model
//! A transaction queues intended operations and snapshots the original
//! record (value + tags + ttl) the first time it touches each key.
//! Nothing reaches the store until `commit`, which applies the queue in
//! order; if any apply step fails, the already-applied prefix is undone
//! in reverse from the snapshots and the original error is surfaced.
//!
//! Dropping an uncommitted transaction rolls it back, which is the
//! context-exit contract: normal flow calls `commit()`, early returns
//! and panics restore the pre-transaction state.
//!
//! Isolation is Read Committed: concurrent transactions serialize per
//! key through the store's per-key locks at apply time.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::backend::now_ms;
use crate::error::Result;
use crate::store::Store;

/// Lifecycle of a transaction; it can only advance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// Original record captured before the first write to a key.
/// None means the key did not exist.
#[derive(Debug, Clone)]
pub struct SnapshotData {
    pub value: Vec<u8>,
    pub tags: Vec<String>,
    pub ttl: Option<i64>,
}

/// A queued intent, not yet applied
#[derive(Debug, Clone)]
enum TxOp {
    Set {
        key: String,
        value: Vec<u8>,
        tags: Vec<String>,
        ttl: Option<i64>,
    },
    Delete {
        key: String,
    },
}

impl TxOp {
    fn key(&self) -> &str {
        match self {
            TxOp::Set { key, .. } => key,
            TxOp::Delete { key } => key,
        }
    }
}

/// Tracks live transactions for statistics and stale detection
pub struct TransactionManager {
    active: Mutex<HashMap<String, i64>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Ids of transactions that have been active longer than `max_age_ms`
    pub fn stale_ids(&self, max_age_ms: i64) -> Vec<String> {
        let now = now_ms();
        self.active
            .lock()
            .iter()
            .filter(|(_, started)| now - **started > max_age_ms)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub(crate) fn register(&self, id: &str) {
        self.active.lock().insert(id.to_string(), now_ms());
    }

    pub(crate) fn unregister(&self, id: &str) {
        self.active.lock().remove(id);
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A scoped transaction bound to one store instance
pub struct Transaction<'a> {
    store: &'a Store,
    id: String,
    state: TransactionState,
    ops: Vec<TxOp>,
    /// Snapshots in insertion order; rollback walks them in reverse
    snapshots: Vec<(String, Option<SnapshotData>)>,
    snapshotted: HashSet<String>,
}

impl<'a> std::fmt::Debug for Transaction<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(store: &'a Store) -> Self {
        let id = Uuid::new_v4().to_string();
        store.transactions().register(&id);
        tracing::debug!(component = "transaction", id = %id, "transaction started");
        Self {
            store,
            id,
            state: TransactionState::Active,
            ops: Vec::new(),
            snapshots: Vec::new(),
            snapshotted: HashSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn operation_count(&self) -> usize {
        self.ops.len()
    }

    /// Queue a set; applied at commit
    pub fn set(&mut self, key: &str, value: &[u8], tags: &[&str]) -> Result<()> {
        self.snapshot(key)?;
        self.ops.push(TxOp::Set {
            key: key.to_string(),
            value: value.to_vec(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ttl: None,
        });
        Ok(())
    }

    /// Queue a set with TTL; applied at commit
    pub fn set_with_ttl(
        &mut self,
        key: &str,
        value: &[u8],
        ttl_seconds: i64,
        tags: &[&str],
    ) -> Result<()> {
        self.snapshot(key)?;
        self.ops.push(TxOp::Set {
            key: key.to_string(),
            value: value.to_vec(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ttl: Some(ttl_seconds),
        });
        Ok(())
    }

    /// Queue a delete; applied at commit
    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.snapshot(key)?;
        self.ops.push(TxOp::Delete {
            key: key.to_string(),
        });
        Ok(())
    }

    /// Queue several sets at once
    pub fn batch_set(&mut self, items: &[(&str, &[u8], &[&str])]) -> Result<()> {
        for (key, value, tags) in items {
            self.set(key, value, tags)?;
        }
        Ok(())
    }

    /// Queue several deletes at once
    pub fn batch_delete(&mut self, keys: &[&str]) -> Result<()> {
        for key in keys {
            self.delete(key)?;
        }
        Ok(())
    }

    /// Apply all queued operations in order.
    ///
    /// If any step fails, the operations applied so far are undone in
    /// reverse from the snapshots, the transaction ends ROLLED_BACK, and
    /// the original error is returned.
    pub fn commit(mut self) -> Result<()> {
        let snapshots: HashMap<String, Option<SnapshotData>> =
            self.snapshots.iter().cloned().collect();
        let ops = std::mem::take(&mut self.ops);

        let mut applied: Vec<&TxOp> = Vec::with_capacity(ops.len());
        for op in &ops {
            let outcome = match op {
                TxOp::Set {
                    key,
                    value,
                    tags,
                    ttl,
                } => self.store.apply_tx_set(key, value, tags, *ttl),
                TxOp::Delete { key } => self.store.apply_tx_delete(key),
            };

            if let Err(e) = outcome {
                tracing::warn!(
                    component = "transaction",
                    id = %self.id,
                    key = op.key(),
                    error = %e,
                    "commit failed, undoing applied operations"
                );
                for undone in applied.into_iter().rev() {
                    if let Some(snapshot) = snapshots.get(undone.key()) {
                        self.restore_key(undone.key(), snapshot);
                    }
                }
                self.finish(TransactionState::RolledBack);
                return Err(e);
            }
            applied.push(op);
        }

        self.finish(TransactionState::Committed);
        tracing::debug!(
            component = "transaction",
            id = %self.id,
            operations = ops.len(),
            "transaction committed"
        );
        Ok(())
    }

    /// Discard queued operations and restore every snapshotted key
    pub fn rollback(mut self) -> Result<()> {
        self.rollback_inner();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Private Helpers
    // -------------------------------------------------------------------------

    /// Capture the original record the first time a key is touched
    fn snapshot(&mut self, key: &str) -> Result<()> {
        if self.snapshotted.contains(key) {
            return Ok(());
        }
        let original = self.store.snapshot_for_tx(key)?;
        self.snapshotted.insert(key.to_string());
        self.snapshots.push((key.to_string(), original));
        Ok(())
    }

    fn rollback_inner(&mut self) {
        let snapshots = std::mem::take(&mut self.snapshots);
        for (key, snapshot) in snapshots.iter().rev() {
            self.restore_key(key, snapshot);
        }
        self.finish(TransactionState::RolledBack);
        tracing::debug!(component = "transaction", id = %self.id, "transaction rolled back");
    }

    /// Put a key back to its snapshotted state (best effort; failures
    /// are logged and the remaining keys are still restored)
    fn restore_key(&self, key: &str, snapshot: &Option<SnapshotData>) {
        let outcome = match snapshot {
            Some(data) => self
                .store
                .apply_tx_set(key, &data.value, &data.tags, data.ttl),
            None => self.store.apply_tx_delete(key),
        };
        if let Err(e) = outcome {
            tracing::error!(
                component = "transaction",
                id = %self.id,
                key = key,
                error = %e,
                "failed to restore key during rollback"
            );
        }
    }

    fn finish(&mut self, state: TransactionState) {
        if self.state == TransactionState::Active {
            self.state = state;
            self.store.transactions().unregister(&self.id);
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            self.rollback_inner();
        }
    }
}
