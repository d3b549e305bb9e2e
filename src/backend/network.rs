//! Networked KV Backend
//!
//! Talks to a Redis-compatible server. Writes are immediate, metadata is
//! held natively in hashes, tag membership in sets, and TTL expiration is
//! delegated to the server.
//!
//! ## Key Layout
//! ```text
//! data:<db>/<hh>/<hh>/<digest>   value blob
//! meta:<db>:<ns>:<key>           metadata hash
//! tags:<db>:<ns>:<tag>           set of member keys
//! ```
//!
//! ## Connection Pool
//! A fixed number of connections circulate through a bounded channel.
//! Checkout waits up to the configured timeout and then fails Busy;
//! connections are returned on every exit path, with broken ones replaced
//! by a freshly dialed connection.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::backend::{
    now_ms, validate_relative_path, BackendCapabilities, MetadataQuery, MetadataRecord,
    StorageBackend, WriteStrategy,
};
use crate::config::ConnectionParams;
use crate::error::{QuartzError, Result};

/// Hard ceiling the server enforces on a single value
const MAX_VALUE_SIZE: u64 = 512 * 1024 * 1024;

/// SCAN batch hint
const SCAN_COUNT: usize = 256;

/// Redis-backed storage backend with native metadata and TTL
pub struct NetworkKvBackend {
    client: redis::Client,
    slots: Sender<redis::Connection>,
    returns: Receiver<redis::Connection>,
    checkout_timeout: Duration,
    operation_timeout: Duration,
}

impl NetworkKvBackend {
    /// Dial the server and fill the connection pool
    pub fn connect(params: &ConnectionParams) -> Result<Self> {
        let client = redis::Client::open(params.url.as_str())?;
        let (slots, returns) = bounded(params.pool_size.max(1));

        for _ in 0..params.pool_size.max(1) {
            let conn = Self::dial(&client, params.operation_timeout)?;
            slots
                .send(conn)
                .map_err(|_| QuartzError::Backend("pool channel closed".to_string()))?;
        }

        Ok(Self {
            client,
            slots,
            returns,
            checkout_timeout: params.checkout_timeout,
            operation_timeout: params.operation_timeout,
        })
    }

    fn dial(client: &redis::Client, operation_timeout: Duration) -> Result<redis::Connection> {
        let conn = client.get_connection()?;
        conn.set_read_timeout(Some(operation_timeout))?;
        conn.set_write_timeout(Some(operation_timeout))?;
        Ok(conn)
    }

    /// Run `f` with a pooled connection.
    ///
    /// The connection is returned to the pool on every path; a connection
    /// that died mid-operation is replaced by a fresh dial so one failure
    /// cannot permanently shrink the pool.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T> {
        let mut conn = match self.returns.recv_timeout(self.checkout_timeout) {
            Ok(conn) => conn,
            Err(RecvTimeoutError::Timeout) => {
                return Err(QuartzError::Backend(
                    "connection pool busy: checkout timed out".to_string(),
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(QuartzError::Backend("pool channel closed".to_string()))
            }
        };

        let result = f(&mut conn);

        let give_back = match &result {
            Err(e) if e.is_connection_dropped() || e.is_io_error() || e.is_timeout() => {
                Self::dial(&self.client, self.operation_timeout)
            }
            _ => Ok(conn),
        };
        if let Ok(conn) = give_back {
            let _ = self.slots.send(conn);
        }

        result.map_err(Into::into)
    }

    fn data_key(relative_path: &str) -> String {
        format!("data:{}", relative_path)
    }

    fn meta_key(db: &str, namespace: &str, key: &str) -> String {
        format!("meta:{}:{}:{}", db, namespace, key)
    }

    fn tag_key(db: &str, namespace: &str, tag: &str) -> String {
        format!("tags:{}:{}:{}", db, namespace, tag)
    }

    /// Remaining native TTL in seconds for a record, clamped to >= 1
    fn remaining_ttl_secs(record: &MetadataRecord) -> Option<i64> {
        record.ttl.map(|ttl| {
            let deadline_ms = record.last_updated + ttl * 1000;
            ((deadline_ms - now_ms()) / 1000).max(1)
        })
    }

    fn record_from_hash(map: HashMap<String, String>) -> Result<MetadataRecord> {
        let get = |field: &str| -> Result<String> {
            map.get(field)
                .cloned()
                .ok_or_else(|| QuartzError::Corruption(format!("metadata hash missing {}", field)))
        };
        let parse_i64 = |field: &str| -> Result<i64> {
            get(field)?
                .parse()
                .map_err(|_| QuartzError::Corruption(format!("bad {} in metadata hash", field)))
        };

        let ttl = match map.get("ttl") {
            Some(raw) if !raw.is_empty() => Some(
                raw.parse()
                    .map_err(|_| QuartzError::Corruption("bad ttl in metadata hash".to_string()))?,
            ),
            _ => None,
        };
        let tags: Vec<String> = serde_json::from_str(map.get("tags").map(String::as_str).unwrap_or("[]"))?;

        Ok(MetadataRecord {
            db: get("db")?,
            namespace: get("namespace")?,
            key: get("key")?,
            path: get("path")?,
            created_at: parse_i64("created_at")?,
            last_updated: parse_i64("last_updated")?,
            last_accessed: parse_i64("last_accessed")?,
            size: parse_i64("size")? as u64,
            ttl,
            tags,
        })
    }

    /// Keys currently holding a metadata hash in (db, ns)
    fn scan_meta_keys(&self, db: &str, namespace: &str) -> Result<Vec<String>> {
        let prefix = format!("meta:{}:{}:", db, namespace);
        let pattern = format!("{}*", prefix);

        let mut keys = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, batch): (u64, Vec<String>) = self.with_conn(|conn| {
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query(conn)
            })?;
            keys.extend(
                batch
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string)),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}

impl StorageBackend for NetworkKvBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_buffering: false,
            write_strategy: WriteStrategy::Immediate,
            supports_native_ttl: true,
            supports_metadata: true,
            supports_native_queries: false,
            is_distributed: true,
            supports_compression: true,
            max_value_size_bytes: Some(MAX_VALUE_SIZE),
        }
    }

    fn write_data(&self, relative_path: &str, data: &[u8]) -> Result<()> {
        validate_relative_path(relative_path)?;
        if data.len() as u64 > MAX_VALUE_SIZE {
            return Err(QuartzError::ValueTooLarge {
                size: data.len() as u64,
                max: MAX_VALUE_SIZE,
            });
        }
        let key = Self::data_key(relative_path);
        self.with_conn(|conn| redis::cmd("SET").arg(&key).arg(data).query::<()>(conn))
    }

    fn read_data(&self, relative_path: &str) -> Result<Vec<u8>> {
        validate_relative_path(relative_path)?;
        let key = Self::data_key(relative_path);
        let data: Option<Vec<u8>> =
            self.with_conn(|conn| redis::cmd("GET").arg(&key).query(conn))?;
        data.ok_or(QuartzError::NotFound)
    }

    fn delete_file(&self, relative_path: &str) -> Result<()> {
        validate_relative_path(relative_path)?;
        let key = Self::data_key(relative_path);
        self.with_conn(|conn| redis::cmd("DEL").arg(&key).query::<i64>(conn))?;
        Ok(())
    }

    fn file_exists(&self, relative_path: &str) -> Result<bool> {
        validate_relative_path(relative_path)?;
        let key = Self::data_key(relative_path);
        self.with_conn(|conn| redis::cmd("EXISTS").arg(&key).query(conn))
    }

    fn get_file_size(&self, relative_path: &str) -> Result<u64> {
        validate_relative_path(relative_path)?;
        let key = Self::data_key(relative_path);
        let (exists, len): (bool, u64) = self.with_conn(|conn| {
            redis::pipe()
                .cmd("EXISTS")
                .arg(&key)
                .cmd("STRLEN")
                .arg(&key)
                .query(conn)
        })?;
        if !exists {
            return Err(QuartzError::NotFound);
        }
        Ok(len)
    }

    fn scan_paths(&self, db: &str, cursor: u64, limit: usize) -> Result<(Vec<String>, u64)> {
        let pattern = format!("data:{}/*", db);
        let (next, batch): (u64, Vec<String>) = self.with_conn(|conn| {
            redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(limit.max(1))
                .query(conn)
        })?;
        let paths = batch
            .into_iter()
            .filter_map(|k| k.strip_prefix("data:").map(str::to_string))
            .collect();
        Ok((paths, next))
    }

    // -------------------------------------------------------------------------
    // Native Metadata
    // -------------------------------------------------------------------------

    fn set_metadata(&self, record: &MetadataRecord) -> Result<()> {
        let meta_key = Self::meta_key(&record.db, &record.namespace, &record.key);
        let data_key = Self::data_key(&record.path);
        let tags_json = serde_json::to_string(&record.tags)?;

        // Diff tag membership against the previous record
        let old: HashMap<String, String> =
            self.with_conn(|conn| redis::cmd("HGETALL").arg(&meta_key).query(conn))?;
        let old_tags: HashSet<String> = match old.get("tags") {
            Some(raw) => serde_json::from_str(raw).unwrap_or_default(),
            None => HashSet::new(),
        };
        let new_tags: HashSet<String> = record.tags.iter().cloned().collect();

        let ttl_secs = Self::remaining_ttl_secs(record);

        self.with_conn(|conn| {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.cmd("HSET")
                .arg(&meta_key)
                .arg("db")
                .arg(&record.db)
                .arg("namespace")
                .arg(&record.namespace)
                .arg("key")
                .arg(&record.key)
                .arg("path")
                .arg(&record.path)
                .arg("created_at")
                .arg(record.created_at)
                .arg("last_updated")
                .arg(record.last_updated)
                .arg("last_accessed")
                .arg(record.last_accessed)
                .arg("size")
                .arg(record.size)
                .arg("ttl")
                .arg(record.ttl.map(|t| t.to_string()).unwrap_or_default())
                .arg("tags")
                .arg(&tags_json)
                .ignore();

            for tag in old_tags.difference(&new_tags) {
                pipe.cmd("SREM")
                    .arg(Self::tag_key(&record.db, &record.namespace, tag))
                    .arg(&record.key)
                    .ignore();
            }
            for tag in new_tags.difference(&old_tags) {
                pipe.cmd("SADD")
                    .arg(Self::tag_key(&record.db, &record.namespace, tag))
                    .arg(&record.key)
                    .ignore();
            }

            // Native TTL covers both the blob and the metadata entry
            match ttl_secs {
                Some(secs) => {
                    pipe.cmd("EXPIRE").arg(&meta_key).arg(secs).ignore();
                    pipe.cmd("EXPIRE").arg(&data_key).arg(secs).ignore();
                }
                None => {
                    pipe.cmd("PERSIST").arg(&meta_key).ignore();
                    pipe.cmd("PERSIST").arg(&data_key).ignore();
                }
            }

            pipe.query::<()>(conn)
        })
    }

    fn get_metadata(&self, db: &str, namespace: &str, key: &str) -> Result<Option<MetadataRecord>> {
        let meta_key = Self::meta_key(db, namespace, key);
        let map: HashMap<String, String> =
            self.with_conn(|conn| redis::cmd("HGETALL").arg(&meta_key).query(conn))?;
        if map.is_empty() {
            return Ok(None);
        }
        Self::record_from_hash(map).map(Some)
    }

    fn delete_metadata(&self, db: &str, namespace: &str, key: &str) -> Result<bool> {
        let record = match self.get_metadata(db, namespace, key)? {
            Some(record) => record,
            None => return Ok(false),
        };

        let meta_key = Self::meta_key(db, namespace, key);
        self.with_conn(|conn| {
            let mut pipe = redis::pipe();
            pipe.atomic();
            for tag in &record.tags {
                pipe.cmd("SREM")
                    .arg(Self::tag_key(db, namespace, tag))
                    .arg(key)
                    .ignore();
            }
            pipe.cmd("DEL").arg(&meta_key).ignore();
            pipe.query::<()>(conn)
        })?;
        Ok(true)
    }

    fn query_metadata(&self, query: &MetadataQuery) -> Result<Vec<MetadataRecord>> {
        // Tag constraints narrow the candidate set server-side (SINTER);
        // everything else is filtered in core
        let candidates: Vec<String> = if query.tags.is_empty() {
            self.scan_meta_keys(&query.db, &query.namespace)?
        } else {
            let set_keys: Vec<String> = query
                .tags
                .iter()
                .map(|tag| Self::tag_key(&query.db, &query.namespace, tag))
                .collect();
            self.with_conn(|conn| redis::cmd("SINTER").arg(&set_keys).query(conn))?
        };

        let mut records = Vec::new();
        for key in candidates {
            let record = match self.get_metadata(&query.db, &query.namespace, &key)? {
                Some(record) => record,
                None => continue, // expired between SINTER and fetch
            };

            if let Some(min) = query.min_size {
                if record.size < min {
                    continue;
                }
            }
            if let Some(max) = query.max_size {
                if record.size > max {
                    continue;
                }
            }
            if let Some(has_ttl) = query.has_ttl {
                if record.ttl.is_some() != has_ttl {
                    continue;
                }
            }
            if let Some(pattern) = &query.key_pattern {
                if !record.key.contains(pattern.as_str()) {
                    continue;
                }
            }
            if let Some(after) = query.updated_after {
                if record.last_updated <= after {
                    continue;
                }
            }
            records.push(record);
        }
        Ok(records)
    }

    fn cleanup_expired(&self, db: &str, namespace: &str) -> Result<Vec<MetadataRecord>> {
        // The server already evicted expired blobs and hashes; what is left
        // behind is tag-set membership pointing at vanished metadata.
        let pattern = format!("tags:{}:{}:*", db, namespace);
        let mut expired: HashMap<String, MetadataRecord> = HashMap::new();

        let mut cursor = 0u64;
        loop {
            let (next, sets): (u64, Vec<String>) = self.with_conn(|conn| {
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query(conn)
            })?;

            for set_key in sets {
                let members: Vec<String> =
                    self.with_conn(|conn| redis::cmd("SMEMBERS").arg(&set_key).query(conn))?;
                for member in members {
                    let exists: bool = self.with_conn(|conn| {
                        redis::cmd("EXISTS")
                            .arg(Self::meta_key(db, namespace, &member))
                            .query(conn)
                    })?;
                    if exists {
                        continue;
                    }

                    self.with_conn(|conn| {
                        redis::cmd("SREM").arg(&set_key).arg(&member).query::<i64>(conn)
                    })?;
                    expired
                        .entry(member.clone())
                        .or_insert_with(|| MetadataRecord {
                            db: db.to_string(),
                            namespace: namespace.to_string(),
                            key: member.clone(),
                            path: crate::backend::storage_path(db, namespace, &member),
                            created_at: 0,
                            last_updated: 0,
                            last_accessed: 0,
                            size: 0,
                            ttl: Some(0),
                            tags: Vec::new(),
                        });
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(expired.into_values().collect())
    }

    fn touch_accessed(&self, db: &str, namespace: &str, key: &str, now_ms: i64) -> Result<()> {
        let meta_key = Self::meta_key(db, namespace, key);
        self.with_conn(|conn| {
            let exists: bool = redis::cmd("EXISTS").arg(&meta_key).query(conn)?;
            if exists {
                redis::cmd("HSET")
                    .arg(&meta_key)
                    .arg("last_accessed")
                    .arg(now_ms)
                    .query::<i64>(conn)?;
            }
            Ok(())
        })
    }
}
