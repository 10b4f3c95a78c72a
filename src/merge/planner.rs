//! Decides which merge candidates fast-forward and which are held back.

use super::detector::{ConflictCandidate, DetectedConflict, DetectorRegistry, DIVERGING_ENTITY_KEY};
use crate::error::{Result, StoreError};
use crate::types::{ChangeId, EntityKey};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// A candidate with what the engine found out about the target side.
#[derive(Clone, Debug)]
pub struct MergeCandidate {
    pub candidate: ConflictCandidate,
    /// The target changed this entity on its own since the histories split.
    pub diverges: bool,
}

/// Result of planning a merge.
#[derive(Clone, Debug, Default)]
pub struct MergePlan {
    /// Entities to point at the source change, with that change.
    pub fast_forward: Vec<(EntityKey, ChangeId)>,
    /// Entities kept at the target's change.
    pub held_back: Vec<(EntityKey, ChangeId)>,
    /// Distinct conflicts found in this run.
    pub conflicts: Vec<DetectedConflict>,
}

/// Run every detector, add divergence conflicts and split the candidates.
///
/// Detectors all run before anything is decided; the first failure aborts
/// the plan.
pub fn plan_merge(candidates: &[MergeCandidate], detectors: &DetectorRegistry) -> Result<MergePlan> {
    let mut detected: Vec<DetectedConflict> = Vec::new();

    if !candidates.is_empty() {
        let input: Vec<ConflictCandidate> =
            candidates.iter().map(|c| c.candidate.clone()).collect();

        for detector in detectors.iter() {
            let reported = detector
                .detect_conflicts(&input)
                .map_err(|e| StoreError::PluginFailure {
                    plugin: detector.key().to_string(),
                    message: e.to_string(),
                })?;
            debug!(plugin = detector.key(), conflicts = reported.len(), "conflict detector ran");
            detected.extend(reported.into_iter().filter(|c| !c.change_ids.is_empty()));
        }
    }

    for merge_candidate in candidates.iter().filter(|c| c.diverges) {
        let candidate = &merge_candidate.candidate;
        let Some(target_change) = &candidate.target_change else {
            continue;
        };
        let source_id = candidate.source_change.id;
        let target_id = target_change.id;

        let covered = detected
            .iter()
            .any(|c| c.change_ids.contains(&source_id) && c.change_ids.contains(&target_id));
        if !covered {
            detected.push(DetectedConflict::new(
                DIVERGING_ENTITY_KEY,
                [source_id, target_id],
            ));
        }
    }

    let mut seen: HashSet<(String, BTreeSet<ChangeId>)> = HashSet::new();
    let conflicts: Vec<DetectedConflict> = detected
        .into_iter()
        .filter(|c| seen.insert((c.key.clone(), c.change_ids.clone())))
        .collect();

    let implicated: HashSet<ChangeId> = conflicts
        .iter()
        .flat_map(|c| c.change_ids.iter().copied())
        .collect();

    let mut plan = MergePlan {
        conflicts,
        ..MergePlan::default()
    };

    for merge_candidate in candidates {
        let candidate = &merge_candidate.candidate;
        let source_id = candidate.source_change.id;
        let target = candidate.target_change.as_ref();

        let is_implicated = implicated.contains(&source_id)
            || target.map_or(false, |t| implicated.contains(&t.id));

        match target {
            Some(target_change) if is_implicated => {
                plan.held_back.push((candidate.key.clone(), target_change.id));
            }
            _ => plan.fast_forward.push((candidate.key.clone(), source_id)),
        }
    }

    Ok(plan)
}
