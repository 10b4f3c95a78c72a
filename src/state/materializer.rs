//! Projection of commit history into materialized rows.

use super::RowTable;
use crate::changes::ChangeIndex;
use crate::error::{Result, StoreError};
use crate::graph::ChangeGraph;
use crate::snapshots::SnapshotStore;
use crate::types::{
    Change, ChangeId, CommitId, EntityKey, StateRow, Timestamp, Version, VersionId, WorkingCommit,
};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Best candidate change for an entity during a full walk.
struct Candidate {
    change_id: ChangeId,
    commit_id: CommitId,
    depth: usize,
    position: usize,
    created_at: Timestamp,
}

impl Candidate {
    /// Nearer commits win, then later position, later time, larger id.
    fn beats(&self, other: &Candidate) -> bool {
        if self.depth != other.depth {
            return self.depth < other.depth;
        }
        (self.position, self.created_at, self.change_id)
            > (other.position, other.created_at, other.change_id)
    }
}

/// Computes native rows of a version from the change graph.
pub struct Materializer<'a> {
    graph: &'a ChangeGraph,
    changes: &'a ChangeIndex,
    snapshots: &'a SnapshotStore,
}

impl<'a> Materializer<'a> {
    pub fn new(graph: &'a ChangeGraph, changes: &'a ChangeIndex, snapshots: &'a SnapshotStore) -> Self {
        Self {
            graph,
            changes,
            snapshots,
        }
    }

    /// Native rows of a version at its tip, ignoring staged elements.
    ///
    /// History reachable from the fork commit belongs to the base version
    /// and is left to inheritance.
    pub fn full(&self, version: &Version) -> Result<BTreeMap<EntityKey, StateRow>> {
        let stop = match version.fork_commit_id {
            Some(fork) => self.graph.ancestors(fork),
            None => HashSet::new(),
        };

        let mut winners: HashMap<EntityKey, Candidate> = HashMap::new();
        let mut earliest: HashMap<EntityKey, Timestamp> = HashMap::new();

        for (commit_id, depth) in self.graph.depths(version.commit_id, &stop) {
            let Some(node) = self.graph.get(commit_id) else {
                continue;
            };

            for (position, change_id) in node.record.meta_change_ids.iter().enumerate() {
                let change = self.change(commit_id, *change_id)?;
                let key = change.key();

                earliest
                    .entry(key.clone())
                    .and_modify(|t| *t = (*t).min(change.created_at))
                    .or_insert(change.created_at);

                let candidate = Candidate {
                    change_id: *change_id,
                    commit_id,
                    depth,
                    position,
                    created_at: change.created_at,
                };
                match winners.get(&key) {
                    Some(current) if !candidate.beats(current) => {}
                    _ => {
                        winners.insert(key, candidate);
                    }
                }
            }
        }

        let mut rows = BTreeMap::new();
        for (key, winner) in winners {
            let Some(change) = self.changes.get(winner.change_id) else {
                continue;
            };
            let created_at = earliest.get(&key).copied().unwrap_or(change.created_at);
            let row = self.row(change, version.id, winner.commit_id, created_at)?;
            rows.insert(key, row);
        }

        Ok(rows)
    }

    /// Apply the member changes of a commit on top of a version's rows.
    pub fn apply_commit(
        &self,
        rows: &mut RowTable,
        version_id: VersionId,
        commit_id: CommitId,
    ) -> Result<()> {
        let node = self.graph.get(commit_id).ok_or_else(|| {
            StoreError::GraphIntegrity(format!("commit {} is not in the graph", commit_id))
        })?;
        self.apply_changes(rows, version_id, commit_id, &node.record.meta_change_ids)
    }

    /// Apply staged elements of a working commit on top of a version's rows.
    pub fn apply_staged(
        &self,
        rows: &mut RowTable,
        version_id: VersionId,
        working: &WorkingCommit,
    ) -> Result<()> {
        self.apply_changes(rows, version_id, working.id, &working.meta_change_ids)
    }

    fn apply_changes(
        &self,
        rows: &mut RowTable,
        version_id: VersionId,
        commit_id: CommitId,
        change_ids: &[ChangeId],
    ) -> Result<()> {
        for change_id in change_ids {
            let change = self.change(commit_id, *change_id)?;
            let created_at = rows
                .get(version_id, &change.key())
                .map(|existing| existing.created_at.min(change.created_at))
                .unwrap_or(change.created_at);
            let row = self.row(change, version_id, commit_id, created_at)?;
            rows.set(row);
        }
        Ok(())
    }

    fn change(&self, commit_id: CommitId, change_id: ChangeId) -> Result<&'a Change> {
        self.changes.get(change_id).ok_or_else(|| {
            StoreError::GraphIntegrity(format!(
                "commit {} references unknown change {}",
                commit_id, change_id
            ))
        })
    }

    fn row(
        &self,
        change: &Change,
        version_id: VersionId,
        commit_id: CommitId,
        created_at: Timestamp,
    ) -> Result<StateRow> {
        Ok(StateRow {
            entity_id: change.entity_id.clone(),
            schema_key: change.schema_key.clone(),
            schema_version: change.schema_version.clone(),
            file_id: change.file_id.clone(),
            plugin_key: change.plugin_key.clone(),
            version_id,
            snapshot_content: self.snapshots.content(&change.snapshot_id)?,
            change_id: Some(change.id),
            commit_id: Some(commit_id),
            inherited_from_version_id: None,
            created_at,
            updated_at: change.created_at,
            untracked: false,
        })
    }
}
