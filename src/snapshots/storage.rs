//! Snapshot storage implementation.

use crate::error::{Result, StoreError};
use crate::types::SnapshotId;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes for snapshot files.
const SNAPSHOT_MAGIC: &[u8; 4] = b"SNP\0";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

/// Content-addressed snapshot storage.
///
/// New snapshots are staged in memory by the open transaction and only
/// written to disk when the transaction persists.
pub struct SnapshotStore {
    /// Base directory for snapshot files.
    path: PathBuf,

    /// LRU cache for recently read snapshots.
    cache: Mutex<LruCache<SnapshotId, Arc<Value>>>,

    /// Snapshots created by the open transaction.
    staged: HashMap<SnapshotId, Arc<Value>>,

    /// Ids present on disk.
    stored: HashSet<SnapshotId>,
}

impl SnapshotStore {
    /// Open snapshot storage at the given path, indexing existing files.
    pub fn open(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        let mut store = Self {
            path,
            cache: Mutex::new(LruCache::new(cache_size)),
            staged: HashMap::new(),
            stored: HashSet::new(),
        };
        store.stored = store.scan()?;

        Ok(store)
    }

    /// Stage a snapshot, returning its id.
    ///
    /// `None` and JSON `null` map to [`SnapshotId::NO_CONTENT`] without storing anything.
    /// Content that already exists is not stored again.
    pub fn put(&mut self, content: Option<&Value>) -> Result<SnapshotId> {
        let content = match content {
            None | Some(Value::Null) => return Ok(SnapshotId::NO_CONTENT),
            Some(value) => value,
        };

        let id = SnapshotId::for_content(Some(content))?;
        if !self.contains(&id) {
            self.staged.insert(id, Arc::new(content.clone()));
        }

        Ok(id)
    }

    /// Check if a snapshot exists (staged or stored). The no-content id always exists.
    pub fn contains(&self, id: &SnapshotId) -> bool {
        id.is_no_content() || self.staged.contains_key(id) || self.stored.contains(id)
    }

    /// Get snapshot content. Returns `None` for the no-content id.
    pub fn get(&self, id: &SnapshotId) -> Result<Option<Arc<Value>>> {
        if id.is_no_content() {
            return Ok(None);
        }

        if let Some(value) = self.staged.get(id) {
            return Ok(Some(Arc::clone(value)));
        }

        if let Some(value) = self.cache.lock().get(id).cloned() {
            return Ok(Some(value));
        }

        if !self.stored.contains(id) {
            return Err(StoreError::SnapshotNotFound(*id));
        }

        let bytes = self.read_file(id)?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        let value = Arc::new(value);

        self.cache.lock().put(*id, Arc::clone(&value));

        Ok(Some(value))
    }

    /// Get an owned copy of snapshot content.
    pub fn content(&self, id: &SnapshotId) -> Result<Option<Value>> {
        Ok(self.get(id)?.map(|value| (*value).clone()))
    }

    /// Canonical bytes of every staged snapshot.
    pub fn staged_entries(&self) -> Result<Vec<(SnapshotId, Vec<u8>)>> {
        let mut entries = Vec::with_capacity(self.staged.len());
        for (id, value) in &self.staged {
            entries.push((*id, SnapshotId::canonical_bytes(value)?));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    pub fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    /// Write staged snapshots to disk.
    pub fn flush_staged(&mut self) -> Result<usize> {
        let staged: Vec<(SnapshotId, Arc<Value>)> = self.staged.drain().collect();
        let count = staged.len();

        for (id, value) in staged {
            let bytes = SnapshotId::canonical_bytes(&value)?;
            self.write_file(&id, &bytes)?;
            self.stored.insert(id);
            self.cache.lock().put(id, value);
        }

        Ok(count)
    }

    /// Drop staged snapshots (transaction rollback).
    pub fn discard_staged(&mut self) {
        self.staged.clear();
    }

    /// Keep only the staged snapshots in `keep` (savepoint rollback).
    pub fn retain_staged(&mut self, keep: &HashSet<SnapshotId>) {
        self.staged.retain(|id, _| keep.contains(id));
    }

    /// Store canonical bytes under a known id (WAL replay, import).
    pub fn store_raw(&mut self, id: SnapshotId, bytes: &[u8]) -> Result<()> {
        if id.is_no_content() {
            return Ok(());
        }

        let computed = SnapshotId::from_bytes(bytes);
        if computed != id {
            return Err(StoreError::HashMismatch {
                expected: id,
                got: computed,
            });
        }

        if !self.stored.contains(&id) {
            self.write_file(&id, bytes)?;
            self.stored.insert(id);
        }
        self.staged.remove(&id);

        Ok(())
    }

    /// Canonical bytes of a snapshot.
    pub fn raw_bytes(&self, id: &SnapshotId) -> Result<Vec<u8>> {
        match self.get(id)? {
            Some(value) => Ok(SnapshotId::canonical_bytes(&value)?),
            None => Ok(Vec::new()),
        }
    }

    /// All snapshot ids (stored and staged), sorted.
    pub fn ids(&self) -> Vec<SnapshotId> {
        let mut ids: Vec<SnapshotId> = self
            .stored
            .iter()
            .chain(self.staged.keys())
            .copied()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Number of distinct snapshots.
    pub fn len(&self) -> usize {
        self.stored.len() + self.staged.keys().filter(|id| !self.stored.contains(id)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// List ids of snapshot files on disk.
    fn scan(&self) -> Result<HashSet<SnapshotId>> {
        let mut ids = HashSet::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                for snapshot_entry in fs::read_dir(entry.path())? {
                    let snapshot_entry = snapshot_entry?;
                    let filename = snapshot_entry.file_name();
                    let filename_str = filename.to_string_lossy();
                    if let Ok(id) = SnapshotId::from_hex(&filename_str) {
                        ids.insert(id);
                    }
                }
            }
        }

        Ok(ids)
    }

    fn write_file(&self, id: &SnapshotId, content: &[u8]) -> Result<()> {
        let shard_dir = self.shard_path(id);
        fs::create_dir_all(&shard_dir)?;

        // Written under a temporary name so a torn write never looks like a snapshot.
        let final_path = self.snapshot_path(id);
        let tmp_path = shard_dir.join(format!("{}.tmp", id.to_hex()));
        let mut file = File::create(&tmp_path)?;

        file.write_all(SNAPSHOT_MAGIC)?;
        file.write_all(&[SNAPSHOT_VERSION])?;
        file.write_all(&(content.len() as u64).to_le_bytes())?;
        file.write_all(content)?;
        file.write_all(&crc32fast::hash(content).to_le_bytes())?;
        file.sync_all()?;

        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    fn read_file(&self, id: &SnapshotId) -> Result<Vec<u8>> {
        let mut file = File::open(self.snapshot_path(id))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid snapshot magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported snapshot version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut content = vec![0u8; len];
        file.read_exact(&mut content)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&content);
        if stored_checksum != computed_checksum {
            return Err(StoreError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let computed = SnapshotId::from_bytes(&content);
        if &computed != id {
            return Err(StoreError::HashMismatch {
                expected: *id,
                got: computed,
            });
        }

        Ok(content)
    }

    fn shard_path(&self, id: &SnapshotId) -> PathBuf {
        self.path.join(id.shard_prefix())
    }

    fn snapshot_path(&self, id: &SnapshotId) -> PathBuf {
        self.shard_path(id).join(id.to_hex())
    }
}
