//! Configuration for QuartzKV
//!
//! Centralized configuration with sensible defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum key length in bytes accepted by the store
pub const MAX_KEY_BYTES: usize = 1024;

/// Main configuration for a QuartzKV store instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory for data blobs, the metadata catalog and backups
    pub data_dir: PathBuf,

    /// Logical database name (first path component of every blob)
    pub db: String,

    /// Namespace within the database
    pub namespace: String,

    /// Which storage backend to use
    pub backend: BackendKind,

    /// Compress values larger than 1 KiB before they reach the backend
    pub compression_enabled: bool,

    // -------------------------------------------------------------------------
    // Write Buffer Configuration
    // -------------------------------------------------------------------------
    /// High-water mark of the in-memory write buffer (in bytes)
    pub buffer_size_bytes: usize,

    /// How often the background synchronizer flushes the buffer
    pub flush_interval: Duration,

    /// How often the background synchronizer sweeps expired keys
    pub ttl_sweep_interval: Duration,

    // -------------------------------------------------------------------------
    // Index / Query Cache Configuration
    // -------------------------------------------------------------------------
    /// Maximum number of cached query results
    pub cache_size: usize,

    /// How long a cached query result stays valid
    pub query_cache_ttl: Duration,

    // -------------------------------------------------------------------------
    // Networked Backend Configuration
    // -------------------------------------------------------------------------
    /// Connection parameters for the networked KV backend
    pub connection: ConnectionParams,

    // -------------------------------------------------------------------------
    // Replication Configuration
    // -------------------------------------------------------------------------
    /// Replication role and wiring
    pub replication: ReplicationConfig,
}

/// Selects the storage backend implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Local filesystem, buffered writes, metadata in the catalog
    Filesystem,

    /// Networked KV server (Redis wire model), immediate writes,
    /// native metadata and TTL
    NetworkKv,
}

/// Connection parameters for the networked KV backend
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Server URL, e.g. "redis://127.0.0.1:6379/0"
    pub url: String,

    /// Number of pooled connections
    pub pool_size: usize,

    /// How long a caller waits for a free connection before Busy
    pub checkout_timeout: Duration,

    /// Socket read/write deadline for individual operations
    pub operation_timeout: Duration,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            pool_size: 8,
            checkout_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

/// Replication role of a store instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Standalone store, no replication
    None,

    /// Accepts writes and broadcasts ordered operations to secondaries
    Primary,

    /// Read-only replica applying the primary's operation stream
    Secondary,
}

/// Replication wiring for primary and secondary roles
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Role of this store instance
    pub mode: ReplicationMode,

    /// Listen address for the primary's replication server
    pub listen_addr: String,

    /// Address of the primary (secondary mode)
    pub primary_addr: String,

    /// Heartbeat cadence on the primary
    pub heartbeat_interval: Duration,

    /// Capacity of the in-memory operation ring kept for catch-up
    pub max_op_log: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            mode: ReplicationMode::None,
            listen_addr: "127.0.0.1:9000".to_string(),
            primary_addr: "127.0.0.1:9000".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            max_op_log: 10_000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./quartzkv_data"),
            db: "default".to_string(),
            namespace: "default".to_string(),
            backend: BackendKind::Filesystem,
            compression_enabled: true,
            buffer_size_bytes: 4 * 1024 * 1024, // 4 MB
            flush_interval: Duration::from_secs(1),
            ttl_sweep_interval: Duration::from_secs(60),
            cache_size: 1000,
            query_cache_ttl: Duration::from_secs(300),
            connection: ConnectionParams::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn db<S: Into<String>>(mut self, db: S) -> Self {
        self.config.db = db.into();
        self
    }

    pub fn namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn compression_enabled(mut self, enabled: bool) -> Self {
        self.config.compression_enabled = enabled;
        self
    }

    pub fn buffer_size_bytes(mut self, bytes: usize) -> Self {
        self.config.buffer_size_bytes = bytes;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    pub fn ttl_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.ttl_sweep_interval = interval;
        self
    }

    pub fn cache_size(mut self, size: usize) -> Self {
        self.config.cache_size = size;
        self
    }

    pub fn query_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.query_cache_ttl = ttl;
        self
    }

    pub fn connection(mut self, params: ConnectionParams) -> Self {
        self.config.connection = params;
        self
    }

    pub fn replication(mut self, replication: ReplicationConfig) -> Self {
        self.config.replication = replication;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
