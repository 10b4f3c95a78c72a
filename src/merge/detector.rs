//! Conflict detector plugins.

use crate::types::{Change, ChangeId, EntityKey};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Key of conflicts synthesized when both sides changed an entity independently.
pub const DIVERGING_ENTITY_KEY: &str = "diverging_entity";

/// An entity the source changed that the target has not caught up on.
#[derive(Clone, Debug)]
pub struct ConflictCandidate {
    pub key: EntityKey,
    pub source_change: Change,
    pub source_content: Option<Value>,
    /// Change currently visible in the target, if any.
    pub target_change: Option<Change>,
    pub target_content: Option<Value>,
}

/// A conflict reported by a detector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectedConflict {
    pub key: String,
    pub change_ids: BTreeSet<ChangeId>,
}

impl DetectedConflict {
    pub fn new(key: impl Into<String>, change_ids: impl IntoIterator<Item = ChangeId>) -> Self {
        Self {
            key: key.into(),
            change_ids: change_ids.into_iter().collect(),
        }
    }
}

/// Error returned by a detector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginError(pub String);

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        PluginError(message.into())
    }
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for PluginError {}

/// Domain-specific conflict detection, called once per merge.
pub trait ConflictDetector: Send + Sync {
    /// Plugin key, used in error reports.
    fn key(&self) -> &str;

    /// Inspect merge candidates and report conflicting change sets.
    fn detect_conflicts(
        &self,
        candidates: &[ConflictCandidate],
    ) -> Result<Vec<DetectedConflict>, PluginError>;
}

/// Registered conflict detectors, called in registration order.
#[derive(Clone, Default)]
pub struct DetectorRegistry {
    detectors: Vec<Arc<dyn ConflictDetector>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a detector, replacing one with the same key.
    pub fn register(&mut self, detector: Arc<dyn ConflictDetector>) {
        self.detectors.retain(|d| d.key() != detector.key());
        self.detectors.push(detector);
    }

    pub fn unregister(&mut self, key: &str) -> bool {
        let before = self.detectors.len();
        self.detectors.retain(|d| d.key() != key);
        self.detectors.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ConflictDetector>> {
        self.detectors.iter()
    }

    pub fn keys(&self) -> Vec<String> {
        self.detectors.iter().map(|d| d.key().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }
}
