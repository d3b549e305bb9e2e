//! Filesystem Backend
//!
//! Stores blobs as plain files under a validated base path.
//!
//! ## Write Atomicity
//! Every write lands in `<path>.tmp.<random>` first and is renamed into
//! place, so readers never observe a partially written blob.
//!
//! ## Metadata
//! This backend does not hold metadata; the store pairs it with the
//! metadata catalog and the in-memory write buffer (buffered strategy).

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::backend::{
    validate_relative_path, BackendCapabilities, StorageBackend, WriteStrategy,
};
use crate::error::{QuartzError, Result};

/// Local-disk storage backend
pub struct FilesystemBackend {
    /// Validated base directory; all relative paths resolve under it
    base_path: PathBuf,
}

impl FilesystemBackend {
    /// Open or create the backend rooted at `base_path`
    pub fn open(base_path: &Path) -> Result<Self> {
        fs::create_dir_all(base_path)?;
        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    /// Base directory of this backend
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a relative path under the base, rejecting traversal
    fn full_path(&self, relative_path: &str) -> Result<PathBuf> {
        validate_relative_path(relative_path)?;
        Ok(self.base_path.join(relative_path))
    }

    /// Collect every blob path under `<base>/<db>`, sorted for stable
    /// cursor iteration
    fn collect_paths(&self, db: &str) -> Result<Vec<String>> {
        let db_root = self.base_path.join(db);
        if !db_root.exists() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        let mut pending = vec![db_root];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if path.is_file() {
                    // Skip in-flight temp files
                    if path
                        .file_name()
                        .map(|n| n.to_string_lossy().contains(".tmp."))
                        .unwrap_or(false)
                    {
                        continue;
                    }
                    if let Ok(rel) = path.strip_prefix(&self.base_path) {
                        paths.push(rel.to_string_lossy().replace('\\', "/"));
                    }
                }
            }
        }
        paths.sort();
        Ok(paths)
    }
}

impl StorageBackend for FilesystemBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_buffering: true,
            write_strategy: WriteStrategy::Buffered,
            supports_native_ttl: false,
            supports_metadata: false,
            supports_native_queries: false,
            is_distributed: false,
            supports_compression: true,
            max_value_size_bytes: None,
        }
    }

    fn write_data(&self, relative_path: &str, data: &[u8]) -> Result<()> {
        let final_path = self.full_path(relative_path)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to a temp sibling, then rename into place
        let tmp_path = final_path.with_file_name(format!(
            "{}.tmp.{:08x}",
            final_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            rand::random::<u32>()
        ));

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(data)?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| QuartzError::Backend(format!("flush failed: {}", e)))?
            .sync_all()?;

        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    fn read_data(&self, relative_path: &str) -> Result<Vec<u8>> {
        let path = self.full_path(relative_path)?;
        if !path.exists() {
            return Err(QuartzError::NotFound);
        }
        let mut file = File::open(&path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn delete_file(&self, relative_path: &str) -> Result<()> {
        let path = self.full_path(relative_path)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn file_exists(&self, relative_path: &str) -> Result<bool> {
        Ok(self.full_path(relative_path)?.is_file())
    }

    fn get_file_size(&self, relative_path: &str) -> Result<u64> {
        let path = self.full_path(relative_path)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(QuartzError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn scan_paths(&self, db: &str, cursor: u64, limit: usize) -> Result<(Vec<String>, u64)> {
        let all = self.collect_paths(db)?;
        let start = cursor as usize;
        if start >= all.len() {
            return Ok((Vec::new(), 0));
        }

        let end = (start + limit).min(all.len());
        let batch = all[start..end].to_vec();
        let next = if end >= all.len() { 0 } else { end as u64 };
        Ok((batch, next))
    }
}
