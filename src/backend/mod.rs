//! Storage Backend Module
//!
//! Pluggable persistence layer behind a capability-typed interface.
//!
//! ## Responsibilities
//! - Persist opaque byte blobs by backend-relative path
//! - Publish a capabilities descriptor the store reads once at construction
//! - Optionally hold metadata and honor native TTL (networked backends)
//! - Derive deterministic storage paths and reject traversal attempts
//!
//! ## Path Layout
//! ```text
//! <db>/<hh>/<hh>/<hexdigest>
//! ```
//! where `hh` are the first two hex byte-pairs of the SHA-256 digest of
//! `"<namespace>:<key>"`. The fan-out keeps directory sizes bounded on
//! filesystem backends and shards key ranges on networked ones.

mod filesystem;
mod network;

pub use filesystem::FilesystemBackend;
pub use network::NetworkKvBackend;

use std::borrow::Cow;
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{QuartzError, Result};

// =============================================================================
// Shared Constants
// =============================================================================

/// Values at or below this size are never compressed
pub const COMPRESS_MIN_SIZE: usize = 1024;

/// zlib compression level (0-9)
pub const COMPRESS_LEVEL: u32 = 6;

/// Header marking a compressed payload
const COMPRESS_MAGIC: &[u8; 4] = b"CMP:";

// =============================================================================
// Capabilities
// =============================================================================

/// How a backend prefers writes to reach it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Stage writes in the in-memory buffer, flush in batches
    Buffered,

    /// Write through to the backend on every call
    Immediate,
}

/// Describes what a storage backend supports natively.
///
/// The store reads this once at construction and routes each operation
/// accordingly (buffer vs. direct write, catalog vs. native metadata).
#[derive(Debug, Clone, Copy)]
pub struct BackendCapabilities {
    /// Store should batch writes in memory before flushing
    pub supports_buffering: bool,

    /// Preferred write path
    pub write_strategy: WriteStrategy,

    /// Backend expires entries on its own
    pub supports_native_ttl: bool,

    /// Backend holds metadata itself (no catalog needed)
    pub supports_metadata: bool,

    /// Backend can answer tag queries natively
    pub supports_native_queries: bool,

    /// Operations cross a network
    pub is_distributed: bool,

    /// Backend accepts pre-compressed payloads
    pub supports_compression: bool,

    /// Hard ceiling on value size, None = unbounded
    pub max_value_size_bytes: Option<u64>,
}

// =============================================================================
// Metadata Types
// =============================================================================

/// Durable per-key metadata record.
///
/// Timestamps are unix milliseconds; `ttl` is whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub db: String,
    pub namespace: String,
    pub key: String,

    /// Backend-relative storage path of the data blob
    pub path: String,

    pub created_at: i64,
    pub last_updated: i64,
    pub last_accessed: i64,

    /// Original (uncompressed) value size in bytes
    pub size: u64,

    /// Time-to-live in seconds; None = no expiration
    pub ttl: Option<i64>,

    /// Unordered tag set (duplicates collapsed on write)
    pub tags: Vec<String>,
}

impl MetadataRecord {
    /// Expiration predicate: now >= last_updated + ttl
    pub fn is_expired(&self, now_ms: i64) -> bool {
        match self.ttl {
            Some(ttl) => now_ms >= self.last_updated + ttl * 1000,
            None => false,
        }
    }
}

/// Constraints for a metadata query. All present constraints must match.
#[derive(Debug, Clone, Default)]
pub struct MetadataQuery {
    pub db: String,
    pub namespace: String,

    /// Keys must carry ALL of these tags (conjunctive)
    pub tags: Vec<String>,

    pub min_size: Option<u64>,
    pub max_size: Option<u64>,

    /// Some(true) = only keys with a TTL, Some(false) = only keys without
    pub has_ttl: Option<bool>,

    /// Substring match on the key; `%` and `_` are escaped before the
    /// pattern reaches any LIKE comparison
    pub key_pattern: Option<String>,

    /// Only keys updated strictly after this timestamp (unix ms)
    pub updated_after: Option<i64>,
}

impl MetadataQuery {
    /// Query matching every key in a (db, namespace) scope
    pub fn scope(db: &str, namespace: &str) -> Self {
        Self {
            db: db.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }
}

// =============================================================================
// Backend Contract
// =============================================================================

/// Common contract every storage backend implements.
///
/// Data operations are mandatory. Metadata operations are meaningful only
/// when `capabilities().supports_metadata` is true; the defaults reject
/// them so the catalog-backed path can never silently hit a backend that
/// does not hold metadata.
pub trait StorageBackend: Send + Sync {
    /// Capability descriptor, read once at store construction
    fn capabilities(&self) -> BackendCapabilities;

    /// Persist a blob at the given relative path. Must be atomic.
    fn write_data(&self, relative_path: &str, data: &[u8]) -> Result<()>;

    /// Read a blob. Fails with NotFound if absent.
    fn read_data(&self, relative_path: &str) -> Result<Vec<u8>>;

    /// Delete a blob. Idempotent; absent paths are not an error.
    fn delete_file(&self, relative_path: &str) -> Result<()>;

    /// Check whether a blob exists.
    fn file_exists(&self, relative_path: &str) -> Result<bool>;

    /// Size of the stored blob in bytes, or NotFound.
    fn get_file_size(&self, relative_path: &str) -> Result<u64>;

    /// Cursor-based iteration over stored blob paths under a database.
    ///
    /// Returns up to `limit` relative paths and the next cursor; a returned
    /// cursor of 0 means the scan is complete. Implementations must not
    /// hold a backend-wide lock across the full scan.
    fn scan_paths(&self, db: &str, cursor: u64, limit: usize) -> Result<(Vec<String>, u64)>;

    // -------------------------------------------------------------------------
    // Metadata extension (supports_metadata backends only)
    // -------------------------------------------------------------------------

    fn set_metadata(&self, _record: &MetadataRecord) -> Result<()> {
        Err(QuartzError::Backend(
            "backend does not store metadata".to_string(),
        ))
    }

    fn get_metadata(&self, _db: &str, _namespace: &str, _key: &str) -> Result<Option<MetadataRecord>> {
        Err(QuartzError::Backend(
            "backend does not store metadata".to_string(),
        ))
    }

    fn delete_metadata(&self, _db: &str, _namespace: &str, _key: &str) -> Result<bool> {
        Err(QuartzError::Backend(
            "backend does not store metadata".to_string(),
        ))
    }

    fn query_metadata(&self, _query: &MetadataQuery) -> Result<Vec<MetadataRecord>> {
        Err(QuartzError::Backend(
            "backend does not store metadata".to_string(),
        ))
    }

    /// Remove expired entries and return what was removed.
    fn cleanup_expired(&self, _db: &str, _namespace: &str) -> Result<Vec<MetadataRecord>> {
        Err(QuartzError::Backend(
            "backend does not store metadata".to_string(),
        ))
    }

    /// Best-effort refresh of last_accessed. Defaults to a no-op for
    /// backends without metadata (the catalog handles it there).
    fn touch_accessed(&self, _db: &str, _namespace: &str, _key: &str, _now_ms: i64) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Path Derivation & Validation
// =============================================================================

/// Derive the deterministic storage path for a key.
pub fn storage_path(db: &str, namespace: &str, key: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", namespace, key).as_bytes());
    let h = hex::encode(digest);
    format!("{}/{}/{}/{}", db, &h[0..2], &h[2..4], h)
}

/// Reject any relative path that could escape the backend root.
///
/// Normalization is purely lexical: absolute paths, drive prefixes and
/// `..`/`.` components all fail with PathTraversal before any IO happens.
pub fn validate_relative_path(relative_path: &str) -> Result<()> {
    if relative_path.is_empty() {
        return Err(QuartzError::PathTraversal("empty path".to_string()));
    }
    if relative_path.starts_with('/') || relative_path.starts_with('\\') {
        return Err(QuartzError::PathTraversal(relative_path.to_string()));
    }
    if relative_path.contains(':') {
        // Windows drive or stream prefix
        return Err(QuartzError::PathTraversal(relative_path.to_string()));
    }
    for component in relative_path.split(['/', '\\']) {
        if component.is_empty() || component == "." || component == ".." {
            return Err(QuartzError::PathTraversal(relative_path.to_string()));
        }
    }
    Ok(())
}

// =============================================================================
// Transparent Compression
// =============================================================================

/// Compress a payload if compression is enabled and worthwhile.
///
/// Small payloads and disabled stores pass through unchanged; compressed
/// payloads carry a 4-byte header so reads can detect them.
pub fn compress_payload(data: &[u8], enabled: bool) -> Result<Cow<'_, [u8]>> {
    if !enabled || data.len() <= COMPRESS_MIN_SIZE {
        return Ok(Cow::Borrowed(data));
    }

    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(COMPRESS_MAGIC.len() + data.len() / 2),
        Compression::new(COMPRESS_LEVEL),
    );
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;

    let mut out = Vec::with_capacity(COMPRESS_MAGIC.len() + compressed.len());
    out.extend_from_slice(COMPRESS_MAGIC);
    out.extend_from_slice(&compressed);
    Ok(Cow::Owned(out))
}

/// Undo `compress_payload`. Uncompressed payloads pass through unchanged.
pub fn decompress_payload(data: Vec<u8>) -> Result<Vec<u8>> {
    if !data.starts_with(COMPRESS_MAGIC) {
        return Ok(data);
    }

    let mut decoder = ZlibDecoder::new(&data[COMPRESS_MAGIC.len()..]);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| QuartzError::Corruption(format!("zlib inflate failed: {}", e)))?;
    Ok(out)
}

// =============================================================================
// Time Helper
// =============================================================================

/// Current unix time in milliseconds
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_path_is_deterministic() {
        let a = storage_path("db", "ns", "key");
        let b = storage_path("db", "ns", "key");
        assert_eq!(a, b);
        assert!(a.starts_with("db/"));

        // db/hh/hh/digest
        let parts: Vec<&str> = a.split('/').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[1].len(), 2);
        assert_eq!(parts[2].len(), 2);
        assert_eq!(parts[3].len(), 64);
        assert!(parts[3].starts_with(parts[1]));
    }

    #[test]
    fn test_storage_path_differs_by_namespace() {
        assert_ne!(storage_path("db", "a", "key"), storage_path("db", "b", "key"));
    }

    #[test]
    fn test_validate_rejects_traversal() {
        assert!(validate_relative_path("db/aa/bb/digest").is_ok());
        assert!(validate_relative_path("../etc/passwd").is_err());
        assert!(validate_relative_path("db/../../x").is_err());
        assert!(validate_relative_path("/absolute").is_err());
        assert!(validate_relative_path("db//x").is_err());
        assert!(validate_relative_path("c:\\windows").is_err());
        assert!(validate_relative_path("").is_err());
    }

    #[test]
    fn test_compression_round_trip() {
        let data = vec![42u8; 8192];
        let compressed = compress_payload(&data, true).unwrap().into_owned();
        assert!(compressed.len() < data.len());
        assert!(compressed.starts_with(b"CMP:"));

        let restored = decompress_payload(compressed).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_small_payloads_skip_compression() {
        let data = b"tiny".to_vec();
        let out = compress_payload(&data, true).unwrap();
        assert_eq!(out.as_ref(), data.as_slice());
    }

    #[test]
    fn test_expiration_predicate() {
        let mut record = MetadataRecord {
            db: "db".into(),
            namespace: "ns".into(),
            key: "k".into(),
            path: "db/aa/bb/cc".into(),
            created_at: 1_000,
            last_updated: 1_000,
            last_accessed: 1_000,
            size: 1,
            ttl: Some(2),
            tags: vec![],
        };
        assert!(!record.is_expired(2_000));
        assert!(record.is_expired(3_000));
        record.ttl = None;
        assert!(!record.is_expired(i64::MAX));
    }
}
