//! Read path: resolve an entity as seen from a version.

use super::{RowTable, UntrackedOverlay};
use crate::changes::ChangeIndex;
use crate::commit::PendingChanges;
use crate::error::{Result, StoreError};
use crate::snapshots::SnapshotStore;
use crate::types::{ChangeId, EntityKey, StateRow, VersionId};
use crate::versions::VersionRegistry;
use std::collections::BTreeMap;

/// Resolves rows through untracked overlay, pending changes, the
/// materialized cache and then the inheritance chain.
pub struct StateReader<'a> {
    pub(crate) registry: &'a VersionRegistry,
    pub(crate) rows: &'a RowTable,
    pub(crate) untracked: &'a UntrackedOverlay,
    pub(crate) pending: &'a PendingChanges,
    pub(crate) changes: &'a ChangeIndex,
    pub(crate) snapshots: &'a SnapshotStore,
}

impl<'a> StateReader<'a> {
    /// Raw row for an entity, tombstones included.
    pub fn resolve(&self, version_id: VersionId, key: &EntityKey) -> Result<Option<StateRow>> {
        self.check_version(version_id)?;

        for level in self.registry.ancestry(version_id) {
            if let Some(row) = self.level_row(level, key)? {
                return Ok(Some(annotate(row, version_id, level)));
            }
        }

        Ok(None)
    }

    /// Live row for an entity (tombstones read as absent).
    pub fn read(&self, version_id: VersionId, key: &EntityKey) -> Result<Option<StateRow>> {
        Ok(self.resolve(version_id, key)?.filter(|row| !row.is_tombstone()))
    }

    /// Every row visible from a version, tombstones included, ordered by key.
    pub fn visible_rows(
        &self,
        version_id: VersionId,
        schema_key: Option<&str>,
    ) -> Result<Vec<StateRow>> {
        self.check_version(version_id)?;

        let matches = |key: &EntityKey| schema_key.map_or(true, |s| key.schema_key == s);
        let mut visible: BTreeMap<EntityKey, StateRow> = BTreeMap::new();

        for level in self.registry.ancestry(version_id) {
            let mut level_rows: BTreeMap<EntityKey, StateRow> = BTreeMap::new();

            for row in self.rows.rows(level) {
                if matches(&row.key()) {
                    level_rows.insert(row.key(), row.clone());
                }
            }
            for (key, change_id) in self.pending.rows(level) {
                if matches(key) {
                    level_rows.insert(key.clone(), self.pending_row(level, key, change_id)?);
                }
            }
            for row in self.untracked.rows(level) {
                if matches(&row.key()) {
                    level_rows.insert(row.key(), row.clone());
                }
            }

            for (key, row) in level_rows {
                visible
                    .entry(key)
                    .or_insert_with(|| annotate(row, version_id, level));
            }
        }

        Ok(visible.into_values().collect())
    }

    /// Live rows of one schema visible from a version.
    pub fn live_rows(&self, version_id: VersionId, schema_key: &str) -> Result<Vec<StateRow>> {
        Ok(self
            .visible_rows(version_id, Some(schema_key))?
            .into_iter()
            .filter(|row| !row.is_tombstone())
            .collect())
    }

    /// Native rows of a version only: cache plus pending, no overlay, no inheritance.
    pub fn native_rows(&self, version_id: VersionId) -> Result<Vec<StateRow>> {
        let mut rows: BTreeMap<EntityKey, StateRow> = self
            .rows
            .rows(version_id)
            .map(|row| (row.key(), row.clone()))
            .collect();
        for (key, change_id) in self.pending.rows(version_id) {
            rows.insert(key.clone(), self.pending_row(version_id, key, change_id)?);
        }
        Ok(rows.into_values().collect())
    }

    fn check_version(&self, version_id: VersionId) -> Result<()> {
        if !self.registry.contains(version_id) {
            return Err(StoreError::VersionNotFound(version_id.to_string()));
        }
        if let Some(reason) = self.registry.quarantine_reason(version_id) {
            return Err(StoreError::GraphIntegrity(format!(
                "version {} is quarantined: {}",
                version_id, reason
            )));
        }
        Ok(())
    }

    fn level_row(&self, level: VersionId, key: &EntityKey) -> Result<Option<StateRow>> {
        if let Some(row) = self.untracked.get(level, key) {
            return Ok(Some(row.clone()));
        }
        if let Some(change_id) = self.pending.latest(level, key) {
            return Ok(Some(self.pending_row(level, key, change_id)?));
        }
        Ok(self.rows.get(level, key).cloned())
    }

    fn pending_row(
        &self,
        version_id: VersionId,
        key: &EntityKey,
        change_id: ChangeId,
    ) -> Result<StateRow> {
        let change = self
            .changes
            .get(change_id)
            .ok_or(StoreError::ChangeNotFound(change_id))?;
        let created_at = self
            .rows
            .get(version_id, key)
            .map(|existing| existing.created_at.min(change.created_at))
            .unwrap_or(change.created_at);

        Ok(StateRow {
            entity_id: change.entity_id.clone(),
            schema_key: change.schema_key.clone(),
            schema_version: change.schema_version.clone(),
            file_id: change.file_id.clone(),
            plugin_key: change.plugin_key.clone(),
            version_id,
            snapshot_content: self.snapshots.content(&change.snapshot_id)?,
            change_id: Some(change.id),
            commit_id: None,
            inherited_from_version_id: None,
            created_at,
            updated_at: change.created_at,
            untracked: false,
        })
    }
}

/// Re-target a row found at `level` to the version it was read from.
fn annotate(mut row: StateRow, version_id: VersionId, level: VersionId) -> StateRow {
    if level != version_id {
        row.version_id = version_id;
        row.inherited_from_version_id = Some(level);
    }
    row
}
