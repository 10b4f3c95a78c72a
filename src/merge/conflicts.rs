//! Durable conflict records, unique per key and change-id set.

use crate::types::{ChangeConflict, ChangeId, ConflictId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

type ConflictIdentity = (String, BTreeSet<ChangeId>);

#[derive(Default)]
pub struct ConflictIndex {
    conflicts: BTreeMap<ConflictId, ChangeConflict>,
    by_identity: HashMap<ConflictIdentity, ConflictId>,
}

impl ConflictIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a conflict record.
    pub fn apply(&mut self, conflict: ChangeConflict) {
        if let Some(previous) = self.conflicts.remove(&conflict.id) {
            self.by_identity.remove(&(previous.key, previous.change_ids));
        }
        self.by_identity
            .insert((conflict.key.clone(), conflict.change_ids.clone()), conflict.id);
        self.conflicts.insert(conflict.id, conflict);
    }

    /// Remove a conflict record (dismissed).
    pub fn remove(&mut self, id: ConflictId) -> Option<ChangeConflict> {
        let conflict = self.conflicts.remove(&id)?;
        self.by_identity
            .remove(&(conflict.key.clone(), conflict.change_ids.clone()));
        Some(conflict)
    }

    /// Existing record with exactly this key and change-id set.
    pub fn find(&self, key: &str, change_ids: &BTreeSet<ChangeId>) -> Option<&ChangeConflict> {
        let id = self.by_identity.get(&(key.to_string(), change_ids.clone()))?;
        self.conflicts.get(id)
    }

    pub fn get(&self, id: ConflictId) -> Option<&ChangeConflict> {
        self.conflicts.get(&id)
    }

    /// All conflicts ordered by id.
    pub fn list(&self) -> Vec<ChangeConflict> {
        self.conflicts.values().cloned().collect()
    }

    /// Conflicts referencing a change.
    pub fn involving(&self, change_id: ChangeId) -> Vec<ChangeConflict> {
        self.conflicts
            .values()
            .filter(|c| c.change_ids.contains(&change_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn clear(&mut self) {
        self.conflicts.clear();
        self.by_identity.clear();
    }
}
