//! Changes written by the open transaction but not yet committed.

use crate::types::{ChangeId, EntityKey, VersionId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Pending change ids routed to their target versions.
#[derive(Clone, Debug, Default)]
pub struct PendingChanges {
    /// `(version, change)` in submission order.
    entries: Vec<(VersionId, ChangeId)>,

    /// Latest pending change per version and entity.
    latest: HashMap<VersionId, BTreeMap<EntityKey, ChangeId>>,
}

impl PendingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a change to a version.
    pub fn push(&mut self, version_id: VersionId, key: EntityKey, change_id: ChangeId) {
        self.entries.push((version_id, change_id));
        self.latest.entry(version_id).or_default().insert(key, change_id);
    }

    /// Latest pending change of an entity in a version.
    pub fn latest(&self, version_id: VersionId, key: &EntityKey) -> Option<ChangeId> {
        self.latest.get(&version_id)?.get(key).copied()
    }

    /// Latest pending change per entity of a version, ordered by key.
    pub fn rows(&self, version_id: VersionId) -> impl Iterator<Item = (&EntityKey, ChangeId)> {
        self.latest
            .get(&version_id)
            .into_iter()
            .flat_map(|rows| rows.iter().map(|(key, id)| (key, *id)))
    }

    /// Pending change ids of a version in submission order.
    pub fn for_version(&self, version_id: VersionId) -> Vec<ChangeId> {
        self.entries
            .iter()
            .filter(|(version, _)| *version == version_id)
            .map(|(_, change)| *change)
            .collect()
    }

    /// Versions with pending changes, sorted.
    pub fn versions(&self) -> Vec<VersionId> {
        self.entries
            .iter()
            .map(|(version, _)| *version)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Forget everything routed to a version.
    pub fn remove_version(&mut self, version_id: VersionId) {
        self.entries.retain(|(version, _)| *version != version_id);
        self.latest.remove(&version_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.latest.clear();
    }
}
