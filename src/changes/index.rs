//! In-memory change index.

use crate::types::{Change, ChangeId, EntityKey};
use std::collections::HashMap;

/// All changes in log order, with lookups by id and by entity.
#[derive(Default)]
pub struct ChangeIndex {
    /// Changes in log order.
    changes: Vec<Change>,

    /// Change id to position in `changes`.
    by_id: HashMap<ChangeId, usize>,

    /// Entity to its change ids, oldest first.
    by_entity: HashMap<EntityKey, Vec<ChangeId>>,
}

impl ChangeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a change at the end of the log.
    pub fn push(&mut self, change: Change) {
        let position = self.changes.len();
        self.by_id.insert(change.id, position);
        self.by_entity.entry(change.key()).or_default().push(change.id);
        self.changes.push(change);
    }

    pub fn get(&self, id: ChangeId) -> Option<&Change> {
        self.by_id.get(&id).map(|&position| &self.changes[position])
    }

    pub fn contains(&self, id: ChangeId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Number of changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// All changes in log order.
    pub fn all(&self) -> &[Change] {
        &self.changes
    }

    /// Changes appended at or after log position `start`.
    pub fn since(&self, start: usize) -> &[Change] {
        &self.changes[start.min(self.changes.len())..]
    }

    /// Change ids recorded for an entity, oldest first.
    pub fn history(&self, key: &EntityKey) -> &[ChangeId] {
        self.by_entity.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Drop every change at or after log position `len`.
    pub fn truncate(&mut self, len: usize) {
        while self.changes.len() > len {
            let Some(change) = self.changes.pop() else {
                break;
            };
            self.by_id.remove(&change.id);

            let key = change.key();
            if let Some(ids) = self.by_entity.get_mut(&key) {
                ids.retain(|id| *id != change.id);
                if ids.is_empty() {
                    self.by_entity.remove(&key);
                }
            }
        }
    }

    /// Take every change out of the index, leaving it empty.
    pub fn take_all(&mut self) -> Vec<Change> {
        self.by_id.clear();
        self.by_entity.clear();
        std::mem::take(&mut self.changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SnapshotId, Timestamp};

    fn change(id: u64, entity: &str) -> Change {
        Change {
            id: ChangeId(id),
            entity_id: entity.into(),
            schema_key: "note".into(),
            schema_version: "1.0".into(),
            file_id: "f".into(),
            plugin_key: "json".into(),
            snapshot_id: SnapshotId::NO_CONTENT,
            created_at: Timestamp(id as i64),
        }
    }

    #[test]
    fn test_push_and_lookup() {
        let mut index = ChangeIndex::new();
        index.push(change(1, "a"));
        index.push(change(2, "b"));
        index.push(change(3, "a"));

        assert_eq!(index.len(), 3);
        assert_eq!(index.get(ChangeId(2)).unwrap().entity_id, "b");
        assert_eq!(
            index.history(&EntityKey::new("a", "note", "f")),
            &[ChangeId(1), ChangeId(3)]
        );
        assert_eq!(index.since(2).len(), 1);
    }

    #[test]
    fn test_truncate() {
        let mut index = ChangeIndex::new();
        index.push(change(1, "a"));
        index.push(change(2, "a"));
        index.push(change(3, "b"));

        index.truncate(1);

        assert_eq!(index.len(), 1);
        assert!(!index.contains(ChangeId(2)));
        assert!(index.history(&EntityKey::new("b", "note", "f")).is_empty());
        assert_eq!(index.history(&EntityKey::new("a", "note", "f")), &[ChangeId(1)]);
    }
}
