//! Untracked overlay: state written outside the change log.

use crate::error::{Result, StoreError};
use crate::types::{EntityKey, StateRow, VersionId};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Magic bytes for the overlay file.
const UNTRACKED_MAGIC: &[u8; 4] = b"UNT\0";

/// Current overlay format version.
const UNTRACKED_VERSION: u8 = 1;

/// Untracked rows per version, with an undo journal for the open transaction.
#[derive(Default)]
pub struct UntrackedOverlay {
    versions: HashMap<VersionId, BTreeMap<EntityKey, StateRow>>,

    /// Previous value of every slot touched since the journal was last cleared.
    journal: Vec<(VersionId, EntityKey, Option<StateRow>)>,
}

impl UntrackedOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, version_id: VersionId, key: &EntityKey) -> Option<&StateRow> {
        self.versions.get(&version_id)?.get(key)
    }

    /// Insert or replace an untracked row.
    pub fn set(&mut self, row: StateRow) {
        let version_id = row.version_id;
        let key = row.key();
        let previous = self
            .versions
            .entry(version_id)
            .or_default()
            .insert(key.clone(), row);
        self.journal.push((version_id, key, previous));
    }

    /// Remove an entity's untracked row. Returns whether one existed.
    pub fn remove(&mut self, version_id: VersionId, key: &EntityKey) -> bool {
        let Some(rows) = self.versions.get_mut(&version_id) else {
            return false;
        };
        let Some(previous) = rows.remove(key) else {
            return false;
        };
        if rows.is_empty() {
            self.versions.remove(&version_id);
        }
        self.journal.push((version_id, key.clone(), Some(previous)));
        true
    }

    /// Drop every row of a version.
    pub fn remove_version(&mut self, version_id: VersionId) {
        let keys: Vec<EntityKey> = self
            .versions
            .get(&version_id)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default();
        for key in keys {
            self.remove(version_id, &key);
        }
    }

    /// Rows of a version, ordered by key.
    pub fn rows(&self, version_id: VersionId) -> impl Iterator<Item = &StateRow> {
        self.versions
            .get(&version_id)
            .into_iter()
            .flat_map(|rows| rows.values())
    }

    pub fn len(&self) -> usize {
        self.versions.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position in the undo journal.
    pub fn mark(&self) -> usize {
        self.journal.len()
    }

    /// Whether anything changed since `mark`.
    pub fn changed_since(&self, mark: usize) -> bool {
        self.journal.len() > mark
    }

    /// Undo every change made after `mark`.
    pub fn rollback_to(&mut self, mark: usize) {
        while self.journal.len() > mark {
            let Some((version_id, key, previous)) = self.journal.pop() else {
                break;
            };
            match previous {
                Some(row) => {
                    self.versions.entry(version_id).or_default().insert(key, row);
                }
                None => {
                    if let Some(rows) = self.versions.get_mut(&version_id) {
                        rows.remove(&key);
                        if rows.is_empty() {
                            self.versions.remove(&version_id);
                        }
                    }
                }
            }
        }
    }

    /// Forget the undo journal (transaction committed).
    pub fn clear_journal(&mut self) {
        self.journal.clear();
    }

    /// Encode the overlay.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let rows: Vec<&StateRow> = {
            let mut ids: Vec<&VersionId> = self.versions.keys().collect();
            ids.sort();
            ids.into_iter()
                .flat_map(|id| self.versions[id].values())
                .collect()
        };

        let mut bytes = Vec::new();
        bytes.extend_from_slice(UNTRACKED_MAGIC);
        bytes.push(UNTRACKED_VERSION);
        bytes.extend_from_slice(&rmp_serde::to_vec_named(&rows)?);
        Ok(bytes)
    }

    /// Decode an overlay written by [`UntrackedOverlay::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 5 || &bytes[0..4] != UNTRACKED_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid untracked overlay magic".into()));
        }
        if bytes[4] != UNTRACKED_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported untracked overlay version: {}",
                bytes[4]
            )));
        }

        let rows: Vec<StateRow> = rmp_serde::from_slice(&bytes[5..])?;
        let mut overlay = Self::new();
        for row in rows {
            overlay
                .versions
                .entry(row.version_id)
                .or_default()
                .insert(row.key(), row);
        }
        Ok(overlay)
    }

    /// Load the overlay file, or an empty overlay when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        Self::from_bytes(&fs::read(path)?)
    }

    /// Atomically replace the overlay file with `bytes`.
    pub fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}
