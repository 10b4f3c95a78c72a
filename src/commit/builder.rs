//! Turns pending changes into commit and tip rows.

use super::PendingChanges;
use crate::error::Result;
use crate::types::{
    AccountId, Change, ChangeId, CommitId, CommitRecord, IdAllocator, SnapshotId, Timestamp,
    VersionId, VersionTip, COMMIT_SCHEMA, INTERNAL_FILE_ID, INTERNAL_PLUGIN_KEY,
    INTERNAL_SCHEMA_VERSION, VERSION_TIP_SCHEMA,
};
use serde::Serialize;
use serde_json::Value;

/// A bookkeeping row ready to be applied: the change plus its snapshot content.
#[derive(Clone, Debug)]
pub struct PlannedRow {
    pub change: Change,
    /// `None` for tombstones.
    pub content: Option<Value>,
}

impl PlannedRow {
    /// Build a row under a reserved schema.
    pub fn internal<T: Serialize>(
        ids: &mut IdAllocator,
        schema_key: &str,
        entity_id: impl Into<String>,
        content: Option<&T>,
        created_at: Timestamp,
    ) -> Result<Self> {
        let content = match content {
            Some(record) => Some(serde_json::to_value(record)?),
            None => None,
        };
        let snapshot_id = SnapshotId::for_content(content.as_ref())?;

        Ok(Self {
            change: Change {
                id: ids.change(),
                entity_id: entity_id.into(),
                schema_key: schema_key.to_string(),
                schema_version: INTERNAL_SCHEMA_VERSION.to_string(),
                file_id: INTERNAL_FILE_ID.to_string(),
                plugin_key: INTERNAL_PLUGIN_KEY.to_string(),
                snapshot_id,
                created_at,
            },
            content,
        })
    }
}

/// Where a version stands when the commit is built.
#[derive(Clone, Debug)]
pub struct VersionHead {
    pub version_id: VersionId,
    /// Current tip commit.
    pub tip: CommitId,
    pub working_commit_id: CommitId,
    /// Staged change ids that apply on top of the tip.
    pub staged: Vec<ChangeId>,
}

/// Rows to append, in order, and the commit created per version.
#[derive(Clone, Debug, Default)]
pub struct CommitPlan {
    pub rows: Vec<PlannedRow>,
    pub commits: Vec<(VersionId, CommitId)>,
}

impl CommitPlan {
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }
}

/// Groups pending changes per version into commits.
pub struct CommitBuilder<'a> {
    authors: &'a [AccountId],
    timestamp: Timestamp,
}

impl<'a> CommitBuilder<'a> {
    pub fn new(authors: &'a [AccountId], timestamp: Timestamp) -> Self {
        Self { authors, timestamp }
    }

    /// Plan one commit per head that has staged or pending changes.
    ///
    /// Staged elements come first in `meta_change_ids` so pending changes,
    /// which are newer, win on materialization.
    pub fn build(
        &self,
        ids: &mut IdAllocator,
        heads: &[VersionHead],
        pending: &PendingChanges,
    ) -> Result<CommitPlan> {
        let mut heads: Vec<&VersionHead> = heads.iter().collect();
        heads.sort_by_key(|head| head.version_id);

        let mut plan = CommitPlan::default();

        for head in heads {
            let mut meta_change_ids = head.staged.clone();
            meta_change_ids.extend(pending.for_version(head.version_id));
            if meta_change_ids.is_empty() {
                continue;
            }

            let record = CommitRecord {
                id: ids.commit(),
                change_set_id: ids.change_set(),
                parent_commit_ids: vec![head.tip],
                meta_change_ids,
                author_account_ids: self.authors.to_vec(),
            };
            let tip = VersionTip {
                id: head.version_id,
                commit_id: record.id,
                working_commit_id: head.working_commit_id,
            };

            plan.rows.push(PlannedRow::internal(
                ids,
                COMMIT_SCHEMA,
                record.id.to_string(),
                Some(&record),
                self.timestamp,
            )?);
            plan.rows.push(PlannedRow::internal(
                ids,
                VERSION_TIP_SCHEMA,
                head.version_id.to_string(),
                Some(&tip),
                self.timestamp,
            )?);
            plan.commits.push((head.version_id, record.id));
        }

        Ok(plan)
    }
}
