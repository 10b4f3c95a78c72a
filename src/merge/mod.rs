//! Merge engine.
//!
//! A merge fast-forwards entities the source changed into the target's
//! working commit and records conflicts for entities both sides changed.
//! Conflict records are unique per key and change-id set, so running the
//! same merge again adds nothing.

mod conflicts;
mod detector;
mod planner;

pub use conflicts::ConflictIndex;
pub use detector::{
    ConflictCandidate, ConflictDetector, DetectedConflict, DetectorRegistry, PluginError,
    DIVERGING_ENTITY_KEY,
};
pub use planner::{plan_merge, MergeCandidate, MergePlan};

use crate::types::{ChangeConflict, CommitId, EntityKey, VersionId};

/// What a merge did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub source: VersionId,
    pub target: VersionId,
    /// Entities now pointing at the source's change.
    pub fast_forwarded: Vec<EntityKey>,
    /// Entities kept at the target's change because of a conflict.
    pub held_back: Vec<EntityKey>,
    /// Every conflict this merge found, including ones recorded by earlier merges.
    pub conflicts: Vec<ChangeConflict>,
    /// Number of conflict records created by this merge.
    pub new_conflicts: usize,
    /// Best common ancestors of the two tips.
    pub merge_bases: Vec<CommitId>,
}

impl MergeOutcome {
    pub(crate) fn empty(source: VersionId, target: VersionId) -> Self {
        Self {
            source,
            target,
            ..Self::default()
        }
    }

    /// Whether the merge changed nothing in the target.
    pub fn is_noop(&self) -> bool {
        self.fast_forwarded.is_empty() && self.new_conflicts == 0
    }
}
