//! Backup Manager
//!
//! Full and incremental snapshots with two-level integrity checksums.
//!
//! ## Archive Layout
//! ```text
//! <backup_dir>/<backup_id>/
//!     header.json        backup metadata + archive checksum
//!     entries.json[.gz]  ordered entry stream
//! ```
//! Each entry carries a SHA-256 checksum of its raw value; the header
//! carries a SHA-256 checksum of the (possibly gzip-compressed) entries
//! file. An incremental backup records its parent; restore walks the
//! chain from the earliest full ancestor forward, later snapshots
//! overlaying earlier ones.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{QuartzError, Result};
use crate::store::Store;

/// Kind of snapshot an archive holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
}

/// Archive header, persisted as `header.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupHeader {
    pub backup_id: String,
    /// RFC 3339 creation time
    pub timestamp: String,
    pub backup_type: BackupType,
    pub source_db: String,
    pub source_namespace: String,
    pub parent_backup_id: Option<String>,
    pub file_count: usize,
    /// Sum of raw value sizes
    pub total_size: u64,
    pub compression: bool,
    /// SHA-256 hex of the entries file bytes
    pub checksum: String,
}

/// One archived key
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupEntry {
    key: String,
    /// base64-encoded raw value
    value: String,
    tags: Vec<String>,
    ttl: Option<i64>,
    last_updated: i64,
    /// SHA-256 hex of the raw value
    checksum: String,
}

/// Creates, verifies, restores and prunes backup archives for one store
pub struct BackupManager {
    store: Arc<Store>,
    backup_dir: PathBuf,
    lock: Mutex<()>,
}

impl BackupManager {
    pub fn new(store: Arc<Store>, backup_dir: &Path) -> Result<Self> {
        fs::create_dir_all(backup_dir)?;
        Ok(Self {
            store,
            backup_dir: backup_dir.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    // -------------------------------------------------------------------------
    // Creation
    // -------------------------------------------------------------------------

    /// Snapshot every key in the store's (db, namespace)
    pub fn create_full_backup(&self, compression: bool) -> Result<BackupHeader> {
        let _guard = self.lock.lock();
        let backup_id = Self::generate_id("full");
        let records = self.store.all_metadata()?;
        self.write_archive(backup_id, BackupType::Full, None, records, compression)
    }

    /// Snapshot only keys updated since the parent backup was taken
    pub fn create_incremental_backup(
        &self,
        parent_backup_id: &str,
        compression: bool,
    ) -> Result<BackupHeader> {
        let _guard = self.lock.lock();
        let parent = self.load_header(parent_backup_id)?;
        let parent_ms = Self::timestamp_ms(&parent)?;

        let backup_id = Self::generate_id("inc");
        let records = self.store.metadata_updated_after(parent_ms)?;
        self.write_archive(
            backup_id,
            BackupType::Incremental,
            Some(parent_backup_id.to_string()),
            records,
            compression,
        )
    }

    // -------------------------------------------------------------------------
    // Verification
    // -------------------------------------------------------------------------

    /// Re-read the archive and recompute both checksum levels
    pub fn verify_backup(&self, backup_id: &str) -> Result<bool> {
        let header = self.load_header(backup_id)?;
        let entries_path = self.entries_path(backup_id, header.compression);

        let file_bytes = match fs::read(&entries_path) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        };
        if hex::encode(Sha256::digest(&file_bytes)) != header.checksum {
            return Ok(false);
        }

        let entries = Self::decode_entries(&file_bytes, header.compression)?;
        if entries.len() != header.file_count {
            return Ok(false);
        }
        for entry in &entries {
            let value = BASE64
                .decode(&entry.value)
                .map_err(|e| QuartzError::Corruption(format!("invalid base64 in backup: {}", e)))?;
            if hex::encode(Sha256::digest(&value)) != entry.checksum {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Restore
    // -------------------------------------------------------------------------

    /// Restore a backup, walking its chain from the earliest full
    /// ancestor forward. Returns the number of entries applied.
    pub fn restore(&self, backup_id: &str, verify: bool, clear_existing: bool) -> Result<usize> {
        let _guard = self.lock.lock();

        if verify && !self.verify_backup(backup_id)? {
            return Err(QuartzError::Corruption(format!(
                "backup {} failed integrity check",
                backup_id
            )));
        }

        let chain = self.backup_chain(backup_id)?;

        if clear_existing {
            let cleared = self.store.clear_namespace()?;
            tracing::info!(
                component = "backup",
                operation = "restore",
                cleared,
                "cleared existing keys before restore"
            );
        }

        let mut restored = 0;
        for chain_id in &chain {
            let header = self.load_header(chain_id)?;
            let file_bytes = fs::read(self.entries_path(chain_id, header.compression))?;
            let entries = Self::decode_entries(&file_bytes, header.compression)?;

            for entry in entries {
                let value = BASE64.decode(&entry.value).map_err(|e| {
                    QuartzError::Corruption(format!("invalid base64 in backup: {}", e))
                })?;
                match self.store.restore_entry(
                    &entry.key,
                    &value,
                    &entry.tags,
                    entry.ttl,
                    entry.last_updated,
                ) {
                    Ok(()) => restored += 1,
                    Err(e) => tracing::error!(
                        component = "backup",
                        operation = "restore",
                        key = %entry.key,
                        error = %e,
                        "failed to restore key"
                    ),
                }
            }
        }

        self.store.flush()?;
        tracing::info!(
            component = "backup",
            operation = "restore",
            backup_id = backup_id,
            chain_len = chain.len(),
            restored,
            "restore complete"
        );
        Ok(restored)
    }

    // -------------------------------------------------------------------------
    // Housekeeping
    // -------------------------------------------------------------------------

    /// Headers of every archive on disk, oldest first
    pub fn list_backups(&self) -> Result<Vec<BackupHeader>> {
        let mut headers = Vec::new();
        for entry in fs::read_dir(&self.backup_dir)? {
            let entry = entry?;
            if entry.path().is_dir() {
                let id = entry.file_name().to_string_lossy().into_owned();
                if let Ok(header) = self.load_header(&id) {
                    headers.push(header);
                }
            }
        }
        headers.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(headers)
    }

    /// Delete one archive directory
    pub fn delete_backup(&self, backup_id: &str) -> Result<()> {
        let dir = self.backup_dir.join(backup_id);
        if dir.is_dir() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// Remove archives older than `keep_days`, always retaining at least
    /// the `keep_count` most recent regardless of age. Returns how many
    /// were deleted.
    pub fn cleanup_old_backups(&self, keep_days: i64, keep_count: usize) -> Result<usize> {
        let _guard = self.lock.lock();
        let mut headers = self.list_backups()?;
        // Newest first
        headers.reverse();

        let cutoff = chrono::Utc::now() - chrono::Duration::days(keep_days);
        let mut deleted = 0;
        for header in headers.iter().skip(keep_count) {
            let created = chrono::DateTime::parse_from_rfc3339(&header.timestamp)
                .map_err(|e| QuartzError::Corruption(format!("bad backup timestamp: {}", e)))?;
            if created < cutoff {
                self.delete_backup(&header.backup_id)?;
                deleted += 1;
            }
        }

        if deleted > 0 {
            tracing::info!(
                component = "backup",
                operation = "cleanup",
                deleted,
                keep_days,
                keep_count,
                "pruned old backups"
            );
        }
        Ok(deleted)
    }

    // -------------------------------------------------------------------------
    // Private Helpers
    // -------------------------------------------------------------------------

    fn generate_id(prefix: &str) -> String {
        format!(
            "{}_{}_{}",
            prefix,
            chrono::Utc::now().format("%Y%m%d_%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..6]
        )
    }

    fn entries_path(&self, backup_id: &str, compression: bool) -> PathBuf {
        let name = if compression {
            "entries.json.gz"
        } else {
            "entries.json"
        };
        self.backup_dir.join(backup_id).join(name)
    }

    fn header_path(&self, backup_id: &str) -> PathBuf {
        self.backup_dir.join(backup_id).join("header.json")
    }

    fn load_header(&self, backup_id: &str) -> Result<BackupHeader> {
        let raw = fs::read(self.header_path(backup_id)).map_err(|_| {
            QuartzError::InvalidArgument(format!("backup {} not found", backup_id))
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn timestamp_ms(header: &BackupHeader) -> Result<i64> {
        chrono::DateTime::parse_from_rfc3339(&header.timestamp)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| QuartzError::Corruption(format!("bad backup timestamp: {}", e)))
    }

    /// Ids from the earliest full ancestor down to the requested backup
    fn backup_chain(&self, backup_id: &str) -> Result<Vec<String>> {
        let mut chain = vec![backup_id.to_string()];
        let mut current = self.load_header(backup_id)?;
        while let Some(parent_id) = current.parent_backup_id.clone() {
            if chain.contains(&parent_id) {
                return Err(QuartzError::Corruption(format!(
                    "backup chain cycle at {}",
                    parent_id
                )));
            }
            chain.push(parent_id.clone());
            current = self.load_header(&parent_id)?;
        }
        chain.reverse();
        Ok(chain)
    }

    fn write_archive(
        &self,
        backup_id: String,
        backup_type: BackupType,
        parent_backup_id: Option<String>,
        records: Vec<crate::backend::MetadataRecord>,
        compression: bool,
    ) -> Result<BackupHeader> {
        let dir = self.backup_dir.join(&backup_id);
        fs::create_dir_all(&dir)?;

        let mut entries = Vec::with_capacity(records.len());
        let mut total_size = 0u64;
        for record in records {
            let (value, meta) = match self.store.get_with_metadata(&record.key) {
                Ok(pair) => pair,
                Err(e) => {
                    // Key expired or vanished mid-enumeration; skip it
                    tracing::warn!(
                        component = "backup",
                        key = %record.key,
                        error = %e,
                        "skipping key during backup"
                    );
                    continue;
                }
            };

            total_size += value.len() as u64;
            entries.push(BackupEntry {
                key: meta.key,
                checksum: hex::encode(Sha256::digest(&value)),
                value: BASE64.encode(&value),
                tags: meta.tags,
                ttl: meta.ttl,
                last_updated: meta.last_updated,
            });
        }

        // Deterministic entry order
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let file_count = entries.len();

        let json = serde_json::to_vec(&entries)?;
        let file_bytes = if compression {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&json)?;
            encoder.finish()?
        } else {
            json
        };
        fs::write(self.entries_path(&backup_id, compression), &file_bytes)?;

        let header = BackupHeader {
            backup_id: backup_id.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            backup_type,
            source_db: self.store.db().to_string(),
            source_namespace: self.store.namespace().to_string(),
            parent_backup_id,
            file_count,
            total_size,
            compression,
            checksum: hex::encode(Sha256::digest(&file_bytes)),
        };
        fs::write(self.header_path(&backup_id), serde_json::to_vec_pretty(&header)?)?;

        tracing::info!(
            component = "backup",
            operation = match backup_type {
                BackupType::Full => "full_backup",
                BackupType::Incremental => "incremental_backup",
            },
            backup_id = %backup_id,
            file_count,
            total_size,
            "backup created"
        );
        Ok(header)
    }

    fn decode_entries(file_bytes: &[u8], compression: bool) -> Result<Vec<BackupEntry>> {
        let json = if compression {
            let mut decoder = GzDecoder::new(file_bytes);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| QuartzError::Corruption(format!("gzip inflate failed: {}", e)))?;
            out
        } else {
            file_bytes.to_vec()
        };
        Ok(serde_json::from_slice(&json)?)
    }
}
