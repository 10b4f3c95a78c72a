//! In-memory engine: the single entry point for every write.
//!
//! The engine owns the change index and everything folded from it: the
//! change graph, the version registry, conflicts, schemas and the
//! materialized cache. Every write appends change rows and folds them
//! right away. Undoing writes truncates the index and replays the rest,
//! so a rolled-back engine is indistinguishable from a freshly opened one.

use crate::changes::ChangeIndex;
use crate::commit::{CommitBuilder, PendingChanges, PlannedRow, VersionHead};
use crate::error::{Result, StoreError};
use crate::graph::{ChangeGraph, CommitNode};
use crate::merge::{
    plan_merge, ConflictCandidate, ConflictIndex, DetectorRegistry, MergeCandidate, MergeOutcome,
};
use crate::snapshots::SnapshotStore;
use crate::state::{Bookkeeping, Materializer, RowTable, StateReader, UntrackedOverlay};
use crate::types::{
    is_internal_schema, AccountId, Change, ChangeConflict, ChangeId, ChangeSetId, CommitId,
    CommitRecord, ConflictId, CreateVersion, EntityKey, IdAllocator, Mutation, SnapshotId,
    StateRow, StoreStats, Timestamp, Version, VersionDescriptor, VersionId, VersionTip,
    WorkingCommit, COMMIT_SCHEMA, CONFLICT_SCHEMA, STORED_SCHEMA_SCHEMA,
    VERSION_DESCRIPTOR_SCHEMA, VERSION_TIP_SCHEMA, WORKING_COMMIT_SCHEMA,
};
use crate::validate::{SchemaCatalog, SchemaDefinition, Validator};
use crate::versions::{VersionRegistry, GLOBAL_VERSION_NAME};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, error, info};

/// How a change row is being folded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ApplyMode {
    /// Written by the open transaction; integrity failures abort it.
    Live,
    /// Read back from the log; integrity failures quarantine the version.
    Replay,
}

/// Point a transaction can roll back to.
#[derive(Clone, Debug)]
pub struct Savepoint {
    log_len: usize,
    untracked_mark: usize,
    pending: PendingChanges,
}

impl Savepoint {
    /// Length of the change index when the savepoint was taken.
    pub fn log_len(&self) -> usize {
        self.log_len
    }
}

pub struct Engine {
    ids: IdAllocator,
    pub(crate) snapshots: SnapshotStore,
    pub(crate) changes: ChangeIndex,
    graph: ChangeGraph,
    registry: VersionRegistry,
    rows: RowTable,
    bookkeeping: Bookkeeping,
    conflicts: ConflictIndex,
    schemas: SchemaCatalog,
    pub(crate) untracked: UntrackedOverlay,
    pending: PendingChanges,

    /// Index length when the open transaction began.
    txn_start: Option<usize>,

    /// Fail after this many more bookkeeping rows.
    #[cfg(test)]
    pub(crate) fail_after_rows: Option<usize>,
}

impl Engine {
    pub fn new(snapshots: SnapshotStore) -> Self {
        Self {
            ids: IdAllocator::default(),
            snapshots,
            changes: ChangeIndex::new(),
            graph: ChangeGraph::new(),
            registry: VersionRegistry::new(),
            rows: RowTable::new(),
            bookkeeping: Bookkeeping::new(),
            conflicts: ConflictIndex::new(),
            schemas: SchemaCatalog::new(),
            untracked: UntrackedOverlay::new(),
            pending: PendingChanges::new(),
            txn_start: None,
            #[cfg(test)]
            fail_after_rows: None,
        }
    }

    /// Write the root commit and the global version.
    pub fn bootstrap(&mut self, timestamp: Timestamp) -> Result<()> {
        let root = CommitRecord {
            id: self.ids.commit(),
            change_set_id: self.ids.change_set(),
            parent_commit_ids: Vec::new(),
            meta_change_ids: Vec::new(),
            author_account_ids: Vec::new(),
        };
        let global = VersionDescriptor {
            id: self.ids.version(),
            name: GLOBAL_VERSION_NAME.to_string(),
            inherits_from_version_id: None,
            hidden: false,
            fork_commit_id: None,
        };
        let working = WorkingCommit {
            id: self.ids.commit(),
            base_commit_id: root.id,
            change_set_id: self.ids.change_set(),
            meta_change_ids: Vec::new(),
        };
        let tip = VersionTip {
            id: global.id,
            commit_id: root.id,
            working_commit_id: working.id,
        };

        self.append_internal(COMMIT_SCHEMA, root.id.to_string(), &root, timestamp)?;
        self.append_internal(VERSION_DESCRIPTOR_SCHEMA, global.id.to_string(), &global, timestamp)?;
        self.append_internal(WORKING_COMMIT_SCHEMA, working.id.to_string(), &working, timestamp)?;
        self.append_internal(VERSION_TIP_SCHEMA, global.id.to_string(), &tip, timestamp)?;

        info!(version = %global.id, commit = %root.id, "bootstrapped global version");
        Ok(())
    }

    /// Fold changes read from the log.
    pub fn load(&mut self, changes: Vec<Change>) -> Result<()> {
        for change in changes {
            self.changes.push(change.clone());
            self.apply_change(&change, ApplyMode::Replay)?;
        }

        let quarantined = self.registry.quarantined();
        info!(
            changes = self.changes.len(),
            commits = self.graph.len(),
            versions = self.registry.len(),
            quarantined = quarantined.len(),
            "engine loaded"
        );
        Ok(())
    }

    /// Recompute every derived structure by replaying the change index.
    pub fn rebuild(&mut self) -> Result<()> {
        let changes = self.changes.take_all();

        self.ids = IdAllocator::default();
        self.graph = ChangeGraph::new();
        self.registry = VersionRegistry::new();
        self.rows.clear();
        self.bookkeeping.clear();
        self.conflicts.clear();
        self.schemas.clear();

        for change in changes {
            self.changes.push(change.clone());
            self.apply_change(&change, ApplyMode::Replay)?;
        }

        debug!(changes = self.changes.len(), "engine rebuilt");
        Ok(())
    }

    // --- Transactions ---

    /// Start a transaction and return its starting point.
    pub fn begin(&mut self) -> Savepoint {
        self.txn_start = Some(self.changes.len());
        self.savepoint()
    }

    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            log_len: self.changes.len(),
            untracked_mark: self.untracked.mark(),
            pending: self.pending.clone(),
        }
    }

    /// Undo everything written after `savepoint`.
    ///
    /// Staged snapshots survive only while a remaining change of the
    /// transaction still refers to them.
    pub fn rollback_to(&mut self, savepoint: &Savepoint) -> Result<()> {
        self.untracked.rollback_to(savepoint.untracked_mark);
        self.pending = savepoint.pending.clone();

        if self.changes.len() == savepoint.log_len {
            return Ok(());
        }

        let dropped = self.changes.len() - savepoint.log_len;
        self.changes.truncate(savepoint.log_len);

        let start = self.txn_start.unwrap_or(savepoint.log_len);
        let referenced: HashSet<SnapshotId> = self
            .changes
            .since(start)
            .iter()
            .map(|change| change.snapshot_id)
            .collect();
        self.snapshots.retain_staged(&referenced);

        self.rebuild()?;
        info!(dropped, log_len = savepoint.log_len, "rolled back");
        Ok(())
    }

    /// Changes written by the open transaction, in log order.
    pub fn transaction_changes(&self) -> &[Change] {
        match self.txn_start {
            Some(start) => self.changes.since(start),
            None => &[],
        }
    }

    /// Whether anything was written since `savepoint`.
    pub fn written_since(&self, savepoint: &Savepoint) -> bool {
        self.changes.len() != savepoint.log_len
            || self.untracked.changed_since(savepoint.untracked_mark)
    }

    /// Close the open transaction after it persisted.
    pub fn finish(&mut self) {
        self.txn_start = None;
        self.untracked.clear_journal();
    }

    // --- Writes ---

    /// Validate and record one mutation. Returns the row now visible.
    pub fn mutate(&mut self, mutation: Mutation, timestamp: Timestamp) -> Result<StateRow> {
        let version_id = mutation.version_id;
        self.writable(version_id)?;

        let key = Validator::new(&self.schemas).validate(&mutation, &self.reader())?;

        if mutation.untracked {
            let created_at = self
                .reader()
                .read(version_id, &key)?
                .map_or(timestamp, |row| row.created_at);
            let row = StateRow {
                entity_id: key.entity_id.clone(),
                schema_key: key.schema_key.clone(),
                schema_version: mutation.schema_version,
                file_id: key.file_id.clone(),
                plugin_key: mutation.plugin_key,
                version_id,
                snapshot_content: mutation.content.filter(|content| !content.is_null()),
                change_id: None,
                commit_id: None,
                inherited_from_version_id: None,
                created_at,
                updated_at: timestamp,
                untracked: true,
            };
            self.untracked.set(row.clone());
            debug!(version = %version_id, entity = %key, "untracked write");
            return Ok(row);
        }

        let snapshot_id = self.snapshots.put(mutation.content.as_ref())?;
        let change = Change {
            id: self.ids.change(),
            entity_id: key.entity_id.clone(),
            schema_key: key.schema_key.clone(),
            schema_version: mutation.schema_version,
            file_id: key.file_id.clone(),
            plugin_key: mutation.plugin_key,
            snapshot_id,
            created_at: timestamp,
        };
        let change_id = change.id;

        self.changes.push(change);
        self.pending.push(version_id, key.clone(), change_id);
        self.untracked.remove(version_id, &key);

        self.reader()
            .resolve(version_id, &key)?
            .ok_or(StoreError::ChangeNotFound(change_id))
    }

    /// Turn pending changes into one commit per touched version.
    pub fn commit(
        &mut self,
        authors: &[AccountId],
        timestamp: Timestamp,
    ) -> Result<Vec<(VersionId, CommitId)>> {
        let heads = self.heads(&self.pending.versions());
        let plan = CommitBuilder::new(authors, timestamp).build(&mut self.ids, &heads, &self.pending)?;

        for row in plan.rows {
            self.append_row(row)?;
        }
        self.pending.clear();

        for (version_id, commit_id) in &plan.commits {
            let changes = self
                .graph
                .get(*commit_id)
                .map_or(0, |node| node.record.meta_change_ids.len());
            info!(version = %version_id, commit = %commit_id, changes, "committed");
        }

        Ok(plan.commits)
    }

    /// Commit the staged elements of a version on their own.
    pub fn checkpoint(
        &mut self,
        version_id: VersionId,
        authors: &[AccountId],
        timestamp: Timestamp,
    ) -> Result<Option<CommitId>> {
        self.writable(version_id)?;

        let heads = self.heads(&[version_id]);
        let plan = CommitBuilder::new(authors, timestamp).build(
            &mut self.ids,
            &heads,
            &PendingChanges::new(),
        )?;

        for row in plan.rows {
            self.append_row(row)?;
        }

        let commit_id = plan.commits.first().map(|(_, commit_id)| *commit_id);
        if let Some(commit_id) = commit_id {
            info!(version = %version_id, commit = %commit_id, "checkpoint");
        }
        Ok(commit_id)
    }

    pub fn create_version(
        &mut self,
        options: CreateVersion,
        timestamp: Timestamp,
    ) -> Result<Version> {
        let base = match options.inherits_from {
            Some(id) => id,
            None => self.registry.global().ok_or(StoreError::NotInitialized)?,
        };
        self.writable(base)?;

        if let Some(name) = &options.name {
            if name.is_empty() {
                return Err(StoreError::InvalidMutation("version name is empty".into()));
            }
            if self.registry.id_by_name(name).is_some() {
                return Err(StoreError::VersionExists(name.clone()));
            }
        }

        let (commit_id, fork_commit_id) = match options.from_commit_id {
            Some(commit_id) => {
                if !self.graph.contains(commit_id) {
                    return Err(StoreError::InvalidMutation(format!(
                        "unknown commit {}",
                        commit_id
                    )));
                }
                (commit_id, None)
            }
            None => {
                let tip = self
                    .registry
                    .tip(base)
                    .ok_or_else(|| StoreError::VersionNotFound(base.to_string()))?;
                (tip.commit_id, Some(tip.commit_id))
            }
        };

        let id = self.ids.version();
        let name = match options.name {
            Some(name) => name,
            None => self.registry.generate_name(id.0),
        };
        let descriptor = VersionDescriptor {
            id,
            name,
            inherits_from_version_id: Some(base),
            hidden: options.hidden,
            fork_commit_id,
        };
        let working = WorkingCommit {
            id: self.ids.commit(),
            base_commit_id: commit_id,
            change_set_id: self.ids.change_set(),
            meta_change_ids: Vec::new(),
        };
        let tip = VersionTip {
            id,
            commit_id,
            working_commit_id: working.id,
        };

        self.append_internal(VERSION_DESCRIPTOR_SCHEMA, id.to_string(), &descriptor, timestamp)?;
        self.append_internal(WORKING_COMMIT_SCHEMA, working.id.to_string(), &working, timestamp)?;
        self.append_internal(VERSION_TIP_SCHEMA, id.to_string(), &tip, timestamp)?;

        let version = self
            .registry
            .get(id)
            .ok_or_else(|| StoreError::VersionNotFound(id.to_string()))?;
        info!(version = %id, name = %version.name, base = %base, commit = %commit_id, "created version");
        Ok(version)
    }

    /// Delete a version nothing inherits from. Returns what was deleted.
    pub fn delete_version(&mut self, version_id: VersionId, timestamp: Timestamp) -> Result<Version> {
        let version = self
            .registry
            .get(version_id)
            .ok_or_else(|| StoreError::VersionNotFound(version_id.to_string()))?;

        if self.registry.global() == Some(version_id) {
            return Err(StoreError::InvalidMutation(
                "the global version cannot be deleted".into(),
            ));
        }
        let children = self.registry.children_of(version_id);
        if !children.is_empty() {
            return Err(StoreError::InvalidMutation(format!(
                "version {} is inherited by {:?}",
                version_id, children
            )));
        }

        self.append_tombstone(VERSION_DESCRIPTOR_SCHEMA, version_id.to_string(), timestamp)?;
        self.pending.remove_version(version_id);
        self.untracked.remove_version(version_id);

        info!(version = %version_id, name = %version.name, "deleted version");
        Ok(version)
    }

    /// Merge `source` into `target`.
    ///
    /// Every detector runs before anything is written. Entities the source
    /// changed are staged in the target's working commit unless a conflict
    /// protects an existing target row.
    pub fn merge_version(
        &mut self,
        source: VersionId,
        target: VersionId,
        detectors: &DetectorRegistry,
        timestamp: Timestamp,
    ) -> Result<MergeOutcome> {
        for (side, id) in [("source", source), ("target", target)] {
            if !self.registry.contains(id) {
                return Err(StoreError::MergePrecondition(format!(
                    "unknown {} version {}",
                    side, id
                )));
            }
        }
        if source == target {
            debug!(version = %source, "self-merge is a no-op");
            return Ok(MergeOutcome::empty(source, target));
        }
        self.writable(source)?;
        self.writable(target)?;

        let source_version = self.version(source)?;
        let target_version = self.version(target)?;

        let candidates = self.merge_candidates(&source_version, &target_version)?;
        let plan = plan_merge(&candidates, detectors)?;

        let mut outcome = MergeOutcome {
            fast_forwarded: plan.fast_forward.iter().map(|(key, _)| key.clone()).collect(),
            held_back: plan.held_back.iter().map(|(key, _)| key.clone()).collect(),
            merge_bases: self
                .graph
                .merge_bases(source_version.commit_id, target_version.commit_id),
            ..MergeOutcome::empty(source, target)
        };

        if !plan.fast_forward.is_empty() {
            let (change_set_id, mut staged) = match self.registry.active_working(target) {
                Some(working) => (working.change_set_id, working.meta_change_ids.clone()),
                None => (self.ids.change_set(), Vec::new()),
            };
            let mut seen: HashSet<ChangeId> = staged.iter().copied().collect();
            for (_, change_id) in &plan.fast_forward {
                if seen.insert(*change_id) {
                    staged.push(*change_id);
                }
            }

            let working = WorkingCommit {
                id: target_version.working_commit_id,
                base_commit_id: target_version.commit_id,
                change_set_id,
                meta_change_ids: staged,
            };
            self.append_internal(WORKING_COMMIT_SCHEMA, working.id.to_string(), &working, timestamp)?;
        }

        for detected in plan.conflicts {
            if let Some(existing) = self.conflicts.find(&detected.key, &detected.change_ids) {
                outcome.conflicts.push(existing.clone());
                continue;
            }
            let conflict = ChangeConflict {
                id: self.ids.conflict(),
                key: detected.key,
                change_ids: detected.change_ids,
            };
            self.append_internal(CONFLICT_SCHEMA, conflict.id.to_string(), &conflict, timestamp)?;
            outcome.new_conflicts += 1;
            outcome.conflicts.push(conflict);
        }

        info!(
            source = %source,
            target = %target,
            fast_forwarded = outcome.fast_forwarded.len(),
            held_back = outcome.held_back.len(),
            conflicts = outcome.conflicts.len(),
            new_conflicts = outcome.new_conflicts,
            "merged"
        );
        Ok(outcome)
    }

    pub fn register_schema(&mut self, schema: SchemaDefinition, timestamp: Timestamp) -> Result<()> {
        schema.check()?;
        let key = schema.key.clone();
        self.append_internal(STORED_SCHEMA_SCHEMA, key.clone(), &schema, timestamp)?;
        debug!(schema = %key, version = %schema.version, "registered schema");
        Ok(())
    }

    /// Mark a conflict as resolved.
    pub fn dismiss_conflict(&mut self, conflict_id: ConflictId, timestamp: Timestamp) -> Result<()> {
        if self.conflicts.get(conflict_id).is_none() {
            return Err(StoreError::InvalidMutation(format!(
                "unknown conflict {}",
                conflict_id
            )));
        }
        self.append_tombstone(CONFLICT_SCHEMA, conflict_id.to_string(), timestamp)?;
        debug!(conflict = %conflict_id, "dismissed conflict");
        Ok(())
    }

    // --- Reads ---

    pub fn reader(&self) -> StateReader<'_> {
        StateReader {
            registry: &self.registry,
            rows: &self.rows,
            untracked: &self.untracked,
            pending: &self.pending,
            changes: &self.changes,
            snapshots: &self.snapshots,
        }
    }

    /// Live row of an entity as seen from a version.
    pub fn read_state(&self, version_id: VersionId, key: &EntityKey) -> Result<Option<StateRow>> {
        self.reader().read(version_id, key)
    }

    /// Row of an entity as seen from a version, tombstones included.
    pub fn resolve_state(&self, version_id: VersionId, key: &EntityKey) -> Result<Option<StateRow>> {
        self.reader().resolve(version_id, key)
    }

    /// Live rows visible from a version, optionally limited to one schema.
    pub fn list_state(&self, version_id: VersionId, schema_key: Option<&str>) -> Result<Vec<StateRow>> {
        Ok(self
            .reader()
            .visible_rows(version_id, schema_key)?
            .into_iter()
            .filter(|row| !row.is_tombstone())
            .collect())
    }

    pub fn version(&self, version_id: VersionId) -> Result<Version> {
        self.registry
            .get(version_id)
            .ok_or_else(|| StoreError::VersionNotFound(version_id.to_string()))
    }

    pub fn version_by_name(&self, name: &str) -> Result<Version> {
        self.registry
            .by_name(name)
            .ok_or_else(|| StoreError::VersionNotFound(name.to_string()))
    }

    pub fn global_version(&self) -> Result<Version> {
        let id = self.registry.global().ok_or(StoreError::NotInitialized)?;
        self.version(id)
    }

    pub fn versions(&self) -> Vec<Version> {
        self.registry.list()
    }

    /// Staged change ids of a version that apply on top of its tip.
    pub fn staged(&self, version_id: VersionId) -> Vec<ChangeId> {
        self.registry.active_staged(version_id).to_vec()
    }

    pub fn quarantined(&self) -> Vec<VersionId> {
        self.registry.quarantined()
    }

    pub fn conflicts(&self) -> Vec<ChangeConflict> {
        self.conflicts.list()
    }

    pub fn conflicts_involving(&self, change_id: ChangeId) -> Vec<ChangeConflict> {
        self.conflicts.involving(change_id)
    }

    pub fn change(&self, change_id: ChangeId) -> Option<Change> {
        self.changes.get(change_id).cloned()
    }

    /// Domain changes in log order; bookkeeping rows are left out.
    pub fn changes(&self) -> Vec<Change> {
        self.changes
            .all()
            .iter()
            .filter(|change| !is_internal_schema(&change.schema_key))
            .cloned()
            .collect()
    }

    /// Change ids recorded for an entity, oldest first.
    pub fn entity_history(&self, key: &EntityKey) -> Vec<ChangeId> {
        self.changes.history(key).to_vec()
    }

    pub fn commit_record(&self, commit_id: CommitId) -> Option<CommitRecord> {
        self.graph.get(commit_id).map(|node| node.record.clone())
    }

    /// All commits ordered by id.
    pub fn commits(&self) -> Vec<CommitRecord> {
        let mut commits: Vec<CommitRecord> =
            self.graph.nodes().map(|node| node.record.clone()).collect();
        commits.sort_by_key(|record| record.id);
        commits
    }

    /// Commits reachable from a version's tip, nearest first.
    pub fn history(&self, version_id: VersionId) -> Result<Vec<CommitId>> {
        let version = self.version(version_id)?;
        Ok(self
            .graph
            .depths(version.commit_id, &HashSet::new())
            .into_iter()
            .map(|(commit_id, _)| commit_id)
            .collect())
    }

    /// Every `(parent, child)` commit edge.
    pub fn commit_edges(&self) -> Vec<(CommitId, CommitId)> {
        self.graph.edges()
    }

    pub fn merge_bases(&self, a: VersionId, b: VersionId) -> Result<Vec<CommitId>> {
        let a = self.version(a)?;
        let b = self.version(b)?;
        Ok(self.graph.merge_bases(a.commit_id, b.commit_id))
    }

    pub fn change_authors(&self, change_id: ChangeId) -> Vec<AccountId> {
        self.bookkeeping.change_authors(change_id)
    }

    pub fn commits_of_change(&self, change_id: ChangeId) -> Vec<CommitId> {
        self.bookkeeping.commits_of_change(change_id).to_vec()
    }

    pub fn change_set_elements(&self, change_set_id: ChangeSetId) -> Vec<ChangeId> {
        self.bookkeeping.change_set_elements(change_set_id).to_vec()
    }

    pub fn schemas(&self) -> Vec<SchemaDefinition> {
        self.schemas.list()
    }

    pub fn schema(&self, key: &str) -> Option<SchemaDefinition> {
        self.schemas.get(key).cloned()
    }

    /// Number of uncommitted tracked changes.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            change_count: self.changes.len() as u64,
            commit_count: self.graph.len() as u64,
            version_count: self.registry.len() as u64,
            snapshot_count: self.snapshots.len() as u64,
            conflict_count: self.conflicts.len() as u64,
            materialized_rows: self.rows.len() as u64,
            untracked_rows: self.untracked.len() as u64,
        }
    }

    /// Re-check the history of every version and quarantine the broken ones.
    /// Returns every quarantined version.
    pub fn verify_integrity(&mut self) -> Vec<VersionId> {
        for version in self.registry.list() {
            if self.registry.quarantine_reason(version.id).is_some() {
                continue;
            }
            if let Err(e) = self.check_history(&version) {
                error!(version = %version.id, error = %e, "integrity check failed; quarantining version");
                self.registry.quarantine(version.id, e.to_string());
                self.rows.remove_version(version.id);
            }
        }
        self.registry.quarantined()
    }

    // --- Internals ---

    fn writable(&self, version_id: VersionId) -> Result<()> {
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

    fn heads(&self, versions: &[VersionId]) -> Vec<VersionHead> {
        versions
            .iter()
            .filter_map(|id| self.registry.get(*id))
            .map(|version| VersionHead {
                version_id: version.id,
                tip: version.commit_id,
                working_commit_id: version.working_commit_id,
                staged: self.registry.active_staged(version.id).to_vec(),
            })
            .collect()
    }

    /// Source rows the target has not caught up on.
    fn merge_candidates(&self, source: &Version, target: &Version) -> Result<Vec<MergeCandidate>> {
        let everything = HashSet::new();

        let mut target_history = self.graph.change_ids_reachable(target.commit_id, &everything);
        target_history.extend(self.registry.active_staged(target.id).iter().copied());
        let mut source_history = self.graph.change_ids_reachable(source.commit_id, &everything);
        source_history.extend(self.registry.active_staged(source.id).iter().copied());

        // Merges see committed and staged state only.
        let no_pending = PendingChanges::new();
        let no_overlay = UntrackedOverlay::new();
        let committed = StateReader {
            registry: &self.registry,
            rows: &self.rows,
            untracked: &no_overlay,
            pending: &no_pending,
            changes: &self.changes,
            snapshots: &self.snapshots,
        };

        // Rows the source sees through a parent count when their change is
        // part of the source's own history.
        let mut candidates = Vec::new();
        for row in committed.visible_rows(source.id, None)? {
            let Some(source_change_id) = row.change_id else {
                continue;
            };
            if !source_history.contains(&source_change_id) {
                continue;
            }
            let key = row.key();
            let target_row = committed.resolve(target.id, &key)?;
            let target_change_id = target_row.as_ref().and_then(|r| r.change_id);

            if target_change_id == Some(source_change_id) || target_history.contains(&source_change_id)
            {
                continue;
            }

            let source_change = self.known_change(source_change_id)?;
            let target_change = match target_change_id {
                Some(id) => Some(self.known_change(id)?),
                None => None,
            };

            // Native or inherited, the target row diverges when its change is
            // part of the target's history and unknown to the source.
            let diverges = target_change.as_ref().map_or(false, |target_change| {
                target_history.contains(&target_change.id)
                    && !source_history.contains(&target_change.id)
                    && target_change.snapshot_id != source_change.snapshot_id
            });

            candidates.push(MergeCandidate {
                candidate: ConflictCandidate {
                    key,
                    source_content: row.snapshot_content.clone(),
                    source_change,
                    target_content: target_row.and_then(|r| r.snapshot_content),
                    target_change,
                },
                diverges,
            });
        }

        debug!(source = %source.id, target = %target.id, candidates = candidates.len(), "merge candidates");
        Ok(candidates)
    }

    fn known_change(&self, change_id: ChangeId) -> Result<Change> {
        self.changes
            .get(change_id)
            .cloned()
            .ok_or(StoreError::ChangeNotFound(change_id))
    }

    fn append_internal<T: Serialize>(
        &mut self,
        schema_key: &str,
        entity_id: String,
        content: &T,
        timestamp: Timestamp,
    ) -> Result<ChangeId> {
        let row = PlannedRow::internal(&mut self.ids, schema_key, entity_id, Some(content), timestamp)?;
        self.append_row(row)
    }

    fn append_tombstone(
        &mut self,
        schema_key: &str,
        entity_id: String,
        timestamp: Timestamp,
    ) -> Result<ChangeId> {
        let row = PlannedRow::internal::<Value>(&mut self.ids, schema_key, entity_id, None, timestamp)?;
        self.append_row(row)
    }

    fn append_row(&mut self, row: PlannedRow) -> Result<ChangeId> {
        #[cfg(test)]
        if let Some(remaining) = self.fail_after_rows {
            if remaining == 0 {
                return Err(StoreError::Transaction("injected failure".into()));
            }
            self.fail_after_rows = Some(remaining - 1);
        }

        let PlannedRow { change, content } = row;
        self.snapshots.put(content.as_ref())?;

        let change_id = change.id;
        self.changes.push(change.clone());
        self.apply_change(&change, ApplyMode::Live)?;
        Ok(change_id)
    }

    /// Fold one change row into the derived structures.
    fn apply_change(&mut self, change: &Change, mode: ApplyMode) -> Result<()> {
        self.ids.observe(change.id.0);
        if !is_internal_schema(&change.schema_key) {
            return Ok(());
        }

        let content = self.snapshots.content(&change.snapshot_id)?;
        match change.schema_key.as_str() {
            COMMIT_SCHEMA => self.apply_commit_row(change, content, mode),
            VERSION_DESCRIPTOR_SCHEMA => self.apply_descriptor_row(change, content),
            WORKING_COMMIT_SCHEMA => self.apply_working_row(change, content, mode),
            VERSION_TIP_SCHEMA => self.apply_tip_row(change, content, mode),
            CONFLICT_SCHEMA => {
                match content {
                    Some(_) => {
                        let conflict: ChangeConflict = decode(change, content)?;
                        self.ids.observe(conflict.id.0);
                        self.conflicts.apply(conflict);
                    }
                    None => {
                        self.conflicts.remove(ConflictId(parse_id(change)?));
                    }
                }
                Ok(())
            }
            STORED_SCHEMA_SCHEMA => {
                match content {
                    Some(_) => {
                        self.schemas.register(decode(change, content)?);
                    }
                    None => {
                        self.schemas.remove(&change.entity_id);
                    }
                }
                Ok(())
            }
            other => {
                debug!(schema = other, change = %change.id, "ignoring unknown bookkeeping row");
                Ok(())
            }
        }
    }

    fn apply_commit_row(&mut self, change: &Change, content: Option<Value>, mode: ApplyMode) -> Result<()> {
        let record: CommitRecord = decode(change, content)?;
        self.ids.observe(record.id.0);
        self.ids.observe(record.change_set_id.0);

        let node = CommitNode {
            record: record.clone(),
            change_id: change.id,
            created_at: change.created_at,
        };
        match self.graph.insert(node) {
            Ok(()) => {
                self.bookkeeping.record_commit(&record);
                Ok(())
            }
            Err(e) if mode == ApplyMode::Replay => {
                // Versions pointing at this commit are quarantined when their tip is folded.
                error!(commit = %record.id, error = %e, "skipping commit during replay");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn apply_descriptor_row(&mut self, change: &Change, content: Option<Value>) -> Result<()> {
        match content {
            Some(_) => {
                let descriptor: VersionDescriptor = decode(change, content)?;
                self.ids.observe(descriptor.id.0);
                self.registry.apply_descriptor(descriptor);
            }
            None => {
                let version_id = VersionId(parse_id(change)?);
                self.registry.remove(version_id);
                self.rows.remove_version(version_id);
            }
        }
        Ok(())
    }

    fn apply_working_row(&mut self, change: &Change, content: Option<Value>, mode: ApplyMode) -> Result<()> {
        let working: WorkingCommit = decode(change, content)?;
        self.ids.observe(working.id.0);
        self.ids.observe(working.change_set_id.0);
        self.registry.apply_working(working.clone());

        let Some(owner) = self.registry.owner_of_working(working.id) else {
            return Ok(());
        };
        if self.registry.quarantine_reason(owner).is_some()
            || self.registry.active_working(owner).is_none()
        {
            return Ok(());
        }

        let result = Materializer::new(&self.graph, &self.changes, &self.snapshots).apply_staged(
            &mut self.rows,
            owner,
            &working,
        );
        self.settle(owner, result, mode)
    }

    fn apply_tip_row(&mut self, change: &Change, content: Option<Value>, mode: ApplyMode) -> Result<()> {
        let tip: VersionTip = decode(change, content)?;
        self.ids.observe(tip.id.0);
        self.ids.observe(tip.commit_id.0);
        self.ids.observe(tip.working_commit_id.0);

        let previous = self.registry.apply_tip(tip.clone());
        if self.registry.quarantine_reason(tip.id).is_some() {
            return Ok(());
        }

        let result = self.materialize_tip(&tip, previous.as_ref());
        self.settle(tip.id, result, mode)
    }

    /// Bring a version's cached rows in line with its new tip.
    fn materialize_tip(&mut self, tip: &VersionTip, previous: Option<&VersionTip>) -> Result<()> {
        let version = self.registry.get(tip.id).ok_or_else(|| {
            StoreError::GraphIntegrity(format!("tip row for unknown version {}", tip.id))
        })?;
        self.check_pointers(&version)?;

        let incremental = self.extends_previous(&version, previous);
        let materializer = Materializer::new(&self.graph, &self.changes, &self.snapshots);

        if incremental {
            materializer.apply_commit(&mut self.rows, version.id, version.commit_id)?;
        } else {
            let rows = materializer.full(&version)?;
            self.rows.replace_version(version.id, rows);
        }

        if let Some(working) = self.registry.active_working(version.id) {
            materializer.apply_staged(&mut self.rows, version.id, working)?;
        }
        Ok(())
    }

    /// Whether the new tip is a child of the previous one that folds in
    /// everything that was staged on it.
    fn extends_previous(&self, version: &Version, previous: Option<&VersionTip>) -> bool {
        let Some(previous) = previous else {
            return false;
        };
        let Some(node) = self.graph.get(version.commit_id) else {
            return false;
        };
        if node.record.parent_commit_ids != [previous.commit_id] {
            return false;
        }

        let staged = self
            .registry
            .working(previous.working_commit_id)
            .filter(|working| working.base_commit_id == previous.commit_id)
            .map(|working| working.meta_change_ids.as_slice())
            .unwrap_or(&[]);
        staged
            .iter()
            .all(|id| node.record.meta_change_ids.contains(id))
    }

    fn check_pointers(&self, version: &Version) -> Result<()> {
        if !self.graph.contains(version.commit_id) {
            return Err(StoreError::GraphIntegrity(format!(
                "version {} points to unknown commit {}",
                version.id, version.commit_id
            )));
        }
        if let Some(fork) = version.fork_commit_id {
            if !self.graph.contains(fork) {
                return Err(StoreError::GraphIntegrity(format!(
                    "version {} was forked from unknown commit {}",
                    version.id, fork
                )));
            }
        }
        Ok(())
    }

    fn check_history(&self, version: &Version) -> Result<()> {
        self.check_pointers(version)?;

        for (commit_id, _) in self.graph.depths(version.commit_id, &HashSet::new()) {
            for parent in self.graph.parents(commit_id) {
                if !self.graph.contains(*parent) {
                    return Err(StoreError::GraphIntegrity(format!(
                        "commit {} references missing parent {}",
                        commit_id, parent
                    )));
                }
            }
            let members = self
                .graph
                .get(commit_id)
                .map(|node| node.record.meta_change_ids.as_slice())
                .unwrap_or(&[]);
            if let Some(missing) = members.iter().find(|id| !self.changes.contains(**id)) {
                return Err(StoreError::GraphIntegrity(format!(
                    "commit {} references unknown change {}",
                    commit_id, missing
                )));
            }
        }

        if let Some(missing) = self
            .registry
            .active_staged(version.id)
            .iter()
            .find(|id| !self.changes.contains(**id))
        {
            return Err(StoreError::GraphIntegrity(format!(
                "version {} stages unknown change {}",
                version.id, missing
            )));
        }
        Ok(())
    }

    /// Quarantine a version on an integrity failure during replay.
    fn settle(&mut self, version_id: VersionId, result: Result<()>, mode: ApplyMode) -> Result<()> {
        match result {
            Err(StoreError::GraphIntegrity(reason)) if mode == ApplyMode::Replay => {
                error!(version = %version_id, %reason, "quarantining version");
                self.registry.quarantine(version_id, reason);
                self.rows.remove_version(version_id);
                Ok(())
            }
            other => other,
        }
    }
}

fn decode<T: DeserializeOwned>(change: &Change, content: Option<Value>) -> Result<T> {
    let content = content.ok_or_else(|| {
        StoreError::Corruption(format!(
            "{} row {} has no content",
            change.schema_key, change.id
        ))
    })?;
    serde_json::from_value(content).map_err(|e| {
        StoreError::Deserialization(format!("{} row {}: {}", change.schema_key, change.id, e))
    })
}

fn parse_id(change: &Change) -> Result<u64> {
    change.entity_id.parse().map_err(|_| {
        StoreError::Corruption(format!(
            "{} row {} has non-numeric entity id '{}'",
            change.schema_key, change.id, change.entity_id
        ))
    })
}
