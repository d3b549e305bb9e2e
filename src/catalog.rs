//! Metadata Catalog
//!
//! Durable SQLite index of keys for backends that do not hold metadata
//! themselves (the filesystem backend). Three relations: metadata rows,
//! interned tags, and a linking table.
//!
//! ## Concurrency
//! A single catalog-wide mutex serializes every operation; each call
//! commits before returning. The catalog is independent of any backend.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::backend::{MetadataQuery, MetadataRecord};
use crate::error::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metadata (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    db            TEXT NOT NULL,
    namespace     TEXT NOT NULL,
    key           TEXT NOT NULL,
    path          TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    last_updated  INTEGER NOT NULL,
    last_accessed INTEGER NOT NULL,
    size          INTEGER NOT NULL,
    ttl           INTEGER,
    UNIQUE(db, namespace, key)
);
CREATE TABLE IF NOT EXISTS tags (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    tag_name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS metadata_tags (
    metadata_id INTEGER NOT NULL,
    tag_id      INTEGER NOT NULL,
    UNIQUE(metadata_id, tag_id)
);
CREATE INDEX IF NOT EXISTS idx_metadata_scope ON metadata(db, namespace);
CREATE INDEX IF NOT EXISTS idx_metadata_path  ON metadata(path);
CREATE INDEX IF NOT EXISTS idx_links_tag      ON metadata_tags(tag_id);
";

/// Escape `%`, `_` and the escape character itself so a user-provided
/// substring only matches literally inside a LIKE pattern.
pub fn escape_like(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    for ch in fragment.chars() {
        if ch == '\\' || ch == '%' || ch == '_' {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Durable metadata index backed by SQLite
pub struct MetadataCatalog {
    conn: Mutex<Connection>,
}

impl MetadataCatalog {
    /// Open or create the catalog database file
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory catalog (tests)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Upsert a record by (db, namespace, key) and replace its tag links.
    ///
    /// `created_at` of an existing row is preserved; every other column
    /// takes the new record's value.
    pub fn set_metadata(&self, record: &MetadataRecord) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO metadata
                 (db, namespace, key, path, created_at, last_updated, last_accessed, size, ttl)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(db, namespace, key) DO UPDATE SET
                 path = excluded.path,
                 last_updated = excluded.last_updated,
                 last_accessed = excluded.last_accessed,
                 size = excluded.size,
                 ttl = excluded.ttl",
            params![
                record.db,
                record.namespace,
                record.key,
                record.path,
                record.created_at,
                record.last_updated,
                record.last_accessed,
                record.size as i64,
                record.ttl,
            ],
        )?;

        let metadata_id: i64 = tx.query_row(
            "SELECT id FROM metadata WHERE db = ?1 AND namespace = ?2 AND key = ?3",
            params![record.db, record.namespace, record.key],
            |row| row.get(0),
        )?;

        tx.execute(
            "DELETE FROM metadata_tags WHERE metadata_id = ?1",
            params![metadata_id],
        )?;
        for tag in &record.tags {
            tx.execute(
                "INSERT OR IGNORE INTO tags (tag_name) VALUES (?1)",
                params![tag],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO metadata_tags (metadata_id, tag_id)
                 SELECT ?1, id FROM tags WHERE tag_name = ?2",
                params![metadata_id, tag],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Fetch one record, or None
    pub fn get_metadata(&self, db: &str, namespace: &str, key: &str) -> Result<Option<MetadataRecord>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT id, db, namespace, key, path, created_at, last_updated,
                        last_accessed, size, ttl
                 FROM metadata WHERE db = ?1 AND namespace = ?2 AND key = ?3",
                params![db, namespace, key],
                Self::row_to_record,
            )
            .optional()?;

        match row {
            Some((id, mut record)) => {
                record.tags = Self::tags_for(&conn, id)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Remove a record and its tag links. Returns whether it existed.
    pub fn delete_metadata(&self, db: &str, namespace: &str, key: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM metadata WHERE db = ?1 AND namespace = ?2 AND key = ?3",
                params![db, namespace, key],
                |row| row.get(0),
            )
            .optional()?;

        let existed = match id {
            Some(id) => {
                tx.execute("DELETE FROM metadata_tags WHERE metadata_id = ?1", params![id])?;
                tx.execute("DELETE FROM metadata WHERE id = ?1", params![id])?;
                true
            }
            None => false,
        };

        tx.commit()?;
        Ok(existed)
    }

    /// Records matching ALL constraints of the query, ordered by key.
    ///
    /// Tag constraints are conjunctive; key patterns are escaped so `%`
    /// and `_` from the caller match literally.
    pub fn query_metadata(&self, query: &MetadataQuery) -> Result<Vec<MetadataRecord>> {
        let conn = self.conn.lock();

        let mut sql = String::from(
            "SELECT m.id, m.db, m.namespace, m.key, m.path, m.created_at,
                    m.last_updated, m.last_accessed, m.size, m.ttl
             FROM metadata m
             WHERE m.db = ?1 AND m.namespace = ?2",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(query.db.clone()), Box::new(query.namespace.clone())];

        if let Some(min) = query.min_size {
            args.push(Box::new(min as i64));
            sql.push_str(&format!(" AND m.size >= ?{}", args.len()));
        }
        if let Some(max) = query.max_size {
            args.push(Box::new(max as i64));
            sql.push_str(&format!(" AND m.size <= ?{}", args.len()));
        }
        match query.has_ttl {
            Some(true) => sql.push_str(" AND m.ttl IS NOT NULL"),
            Some(false) => sql.push_str(" AND m.ttl IS NULL"),
            None => {}
        }
        if let Some(pattern) = &query.key_pattern {
            args.push(Box::new(format!("%{}%", escape_like(pattern))));
            sql.push_str(&format!(" AND m.key LIKE ?{} ESCAPE '\\'", args.len()));
        }
        if let Some(after) = query.updated_after {
            args.push(Box::new(after));
            sql.push_str(&format!(" AND m.last_updated > ?{}", args.len()));
        }
        if !query.tags.is_empty() {
            let placeholders: Vec<String> = query
                .tags
                .iter()
                .map(|tag| {
                    args.push(Box::new(tag.clone()));
                    format!("?{}", args.len())
                })
                .collect();
            args.push(Box::new(query.tags.len() as i64));
            sql.push_str(&format!(
                " AND m.id IN (
                     SELECT mt.metadata_id FROM metadata_tags mt
                     JOIN tags t ON t.id = mt.tag_id
                     WHERE t.tag_name IN ({})
                     GROUP BY mt.metadata_id
                     HAVING COUNT(DISTINCT t.tag_name) = ?{})",
                placeholders.join(", "),
                args.len()
            ));
        }
        sql.push_str(" ORDER BY m.key");

        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<(i64, MetadataRecord)> = stmt
            .query_map(
                params_from_iter(args.iter().map(|a| a.as_ref())),
                Self::row_to_record,
            )?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        let mut records = Vec::with_capacity(rows.len());
        for (id, mut record) in rows {
            record.tags = Self::tags_for(&conn, id)?;
            records.push(record);
        }
        Ok(records)
    }

    /// Delete every expired row in one transaction and return what was
    /// removed so the store can drop the data blobs.
    pub fn cleanup_expired(&self, db: &str, namespace: &str, now_ms: i64) -> Result<Vec<MetadataRecord>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut stmt = tx.prepare(
            "SELECT id, db, namespace, key, path, created_at, last_updated,
                    last_accessed, size, ttl
             FROM metadata
             WHERE db = ?1 AND namespace = ?2
               AND ttl IS NOT NULL
               AND last_updated + ttl * 1000 <= ?3",
        )?;
        let expired: Vec<(i64, MetadataRecord)> = stmt
            .query_map(params![db, namespace, now_ms], Self::row_to_record)?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        let mut records = Vec::with_capacity(expired.len());
        for (id, mut record) in expired {
            record.tags = Self::tags_for(&tx, id)?;
            tx.execute("DELETE FROM metadata_tags WHERE metadata_id = ?1", params![id])?;
            tx.execute("DELETE FROM metadata WHERE id = ?1", params![id])?;
            records.push(record);
        }

        tx.commit()?;
        Ok(records)
    }

    /// Best-effort refresh of last_accessed
    pub fn touch_accessed(&self, db: &str, namespace: &str, key: &str, now_ms: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE metadata SET last_accessed = ?4
             WHERE db = ?1 AND namespace = ?2 AND key = ?3",
            params![db, namespace, key, now_ms],
        )?;
        Ok(())
    }

    /// Number of keys in a (db, namespace) scope
    pub fn count(&self, db: &str, namespace: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM metadata WHERE db = ?1 AND namespace = ?2",
            params![db, namespace],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Tag -> number of keys carrying it, within a scope
    pub fn list_tags_with_counts(&self, db: &str, namespace: &str) -> Result<HashMap<String, usize>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT t.tag_name, COUNT(mt.metadata_id)
             FROM tags t
             JOIN metadata_tags mt ON mt.tag_id = t.id
             JOIN metadata m ON m.id = mt.metadata_id
             WHERE m.db = ?1 AND m.namespace = ?2
             GROUP BY t.tag_name",
        )?;
        let rows = stmt.query_map(params![db, namespace], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        let mut counts = HashMap::new();
        for row in rows {
            let (tag, count) = row?;
            counts.insert(tag, count);
        }
        Ok(counts)
    }

    /// Whether any record references this storage path (orphan detection)
    pub fn path_known(&self, path: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM metadata WHERE path = ?1",
            params![path],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // -------------------------------------------------------------------------
    // Private Helpers
    // -------------------------------------------------------------------------

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, MetadataRecord)> {
        Ok((
            row.get(0)?,
            MetadataRecord {
                db: row.get(1)?,
                namespace: row.get(2)?,
                key: row.get(3)?,
                path: row.get(4)?,
                created_at: row.get(5)?,
                last_updated: row.get(6)?,
                last_accessed: row.get(7)?,
                size: row.get::<_, i64>(8)? as u64,
                ttl: row.get(9)?,
                tags: Vec::new(),
            },
        ))
    }

    fn tags_for(conn: &Connection, metadata_id: i64) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT t.tag_name FROM tags t
             JOIN metadata_tags mt ON mt.tag_id = t.id
             WHERE mt.metadata_id = ?1
             ORDER BY t.tag_name",
        )?;
        let tags = stmt
            .query_map(params![metadata_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::storage_path;

    fn record(key: &str, tags: &[&str], ttl: Option<i64>) -> MetadataRecord {
        MetadataRecord {
            db: "db".into(),
            namespace: "ns".into(),
            key: key.into(),
            path: storage_path("db", "ns", key),
            created_at: 1_000,
            last_updated: 1_000,
            last_accessed: 1_000,
            size: 10,
            ttl,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn test_upsert_preserves_created_at() {
        let catalog = MetadataCatalog::open_in_memory().unwrap();
        catalog.set_metadata(&record("k", &["a"], None)).unwrap();

        let mut updated = record("k", &["b"], Some(60));
        updated.created_at = 9_999;
        updated.last_updated = 2_000;
        catalog.set_metadata(&updated).unwrap();

        let fetched = catalog.get_metadata("db", "ns", "k").unwrap().unwrap();
        assert_eq!(fetched.created_at, 1_000);
        assert_eq!(fetched.last_updated, 2_000);
        assert_eq!(fetched.tags, vec!["b".to_string()]);
        assert_eq!(fetched.ttl, Some(60));
    }

    #[test]
    fn test_query_by_tags_is_conjunctive() {
        let catalog = MetadataCatalog::open_in_memory().unwrap();
        catalog.set_metadata(&record("k1", &["a", "b"], None)).unwrap();
        catalog.set_metadata(&record("k2", &["a"], None)).unwrap();

        let mut query = MetadataQuery::scope("db", "ns");
        query.tags = vec!["a".into(), "b".into()];
        let results = catalog.query_metadata(&query).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, "k1");
    }

    #[test]
    fn test_like_pattern_is_escaped() {
        let catalog = MetadataCatalog::open_in_memory().unwrap();
        catalog.set_metadata(&record("a_b%c", &[], None)).unwrap();
        catalog.set_metadata(&record("aXbYc", &[], None)).unwrap();

        // A literal-minded caller searching "a_b%c" must match only the
        // key that actually contains those characters
        let mut query = MetadataQuery::scope("db", "ns");
        query.key_pattern = Some("a_b%c".into());
        let results = catalog.query_metadata(&query).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, "a_b%c");
    }

    #[test]
    fn test_cleanup_expired_removes_and_returns() {
        let catalog = MetadataCatalog::open_in_memory().unwrap();
        catalog.set_metadata(&record("dies", &["t"], Some(2))).unwrap();
        catalog.set_metadata(&record("lives", &["t"], None)).unwrap();

        // last_updated = 1_000, ttl = 2s -> expired at 3_000
        let removed = catalog.cleanup_expired("db", "ns", 3_000).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].key, "dies");
        assert_eq!(removed[0].tags, vec!["t".to_string()]);

        assert!(catalog.get_metadata("db", "ns", "dies").unwrap().is_none());
        assert!(catalog.get_metadata("db", "ns", "lives").unwrap().is_some());
        assert_eq!(catalog.count("db", "ns").unwrap(), 1);
    }

    #[test]
    fn test_delete_removes_tag_links() {
        let catalog = MetadataCatalog::open_in_memory().unwrap();
        catalog.set_metadata(&record("k", &["a"], None)).unwrap();

        assert!(catalog.delete_metadata("db", "ns", "k").unwrap());
        assert!(!catalog.delete_metadata("db", "ns", "k").unwrap());
        assert!(catalog.list_tags_with_counts("db", "ns").unwrap().is_empty());
    }
}
