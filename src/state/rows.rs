//! Materialized state rows per version.

use crate::types::{EntityKey, StateRow, VersionId};
use std::collections::{BTreeMap, HashMap};

/// Materialized cache: native rows of each version, keyed by entity.
#[derive(Default)]
pub struct RowTable {
    versions: HashMap<VersionId, BTreeMap<EntityKey, StateRow>>,
}

impl RowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, version_id: VersionId, key: &EntityKey) -> Option<&StateRow> {
        self.versions.get(&version_id)?.get(key)
    }

    /// Insert or replace a row. Returns the previous row.
    pub fn set(&mut self, row: StateRow) -> Option<StateRow> {
        self.versions
            .entry(row.version_id)
            .or_default()
            .insert(row.key(), row)
    }

    /// Replace every row of a version.
    pub fn replace_version(&mut self, version_id: VersionId, rows: BTreeMap<EntityKey, StateRow>) {
        if rows.is_empty() {
            self.versions.remove(&version_id);
        } else {
            self.versions.insert(version_id, rows);
        }
    }

    /// Drop every row of a version.
    pub fn remove_version(&mut self, version_id: VersionId) -> usize {
        self.versions
            .remove(&version_id)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    /// Rows of a version, ordered by key.
    pub fn rows(&self, version_id: VersionId) -> impl Iterator<Item = &StateRow> {
        self.versions
            .get(&version_id)
            .into_iter()
            .flat_map(|rows| rows.values())
    }

    /// Rows of one schema in a version, ordered by key.
    pub fn rows_of_schema<'a>(
        &'a self,
        version_id: VersionId,
        schema_key: &'a str,
    ) -> impl Iterator<Item = &'a StateRow> + 'a {
        self.versions
            .get(&version_id)
            .into_iter()
            .flat_map(move |rows| {
                rows.range(EntityKey::schema_floor(schema_key)..)
                    .take_while(move |(key, _)| key.schema_key == schema_key)
                    .map(|(_, row)| row)
            })
    }

    /// Total number of rows across versions.
    pub fn len(&self) -> usize {
        self.versions.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.versions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeId, Timestamp};
    use serde_json::json;

    fn row(version: u64, schema: &str, entity: &str) -> StateRow {
        StateRow {
            entity_id: entity.into(),
            schema_key: schema.into(),
            schema_version: "1.0".into(),
            file_id: "f".into(),
            plugin_key: "json".into(),
            version_id: VersionId(version),
            snapshot_content: Some(json!({"id": entity})),
            change_id: Some(ChangeId(1)),
            commit_id: None,
            inherited_from_version_id: None,
            created_at: Timestamp(1),
            updated_at: Timestamp(1),
            untracked: false,
        }
    }

    #[test]
    fn test_schema_range() {
        let mut table = RowTable::new();
        table.set(row(1, "author", "a1"));
        table.set(row(1, "book", "b1"));
        table.set(row(1, "book", "b2"));
        table.set(row(1, "chapter", "c1"));
        table.set(row(2, "book", "b3"));

        let books: Vec<_> = table
            .rows_of_schema(VersionId(1), "book")
            .map(|r| r.entity_id.clone())
            .collect();
        assert_eq!(books, vec!["b1", "b2"]);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_remove_version() {
        let mut table = RowTable::new();
        table.set(row(1, "book", "b1"));
        table.set(row(2, "book", "b1"));

        assert_eq!(table.remove_version(VersionId(2)), 1);
        assert!(table.get(VersionId(2), &EntityKey::new("b1", "book", "f")).is_none());
        assert!(table.get(VersionId(1), &EntityKey::new("b1", "book", "f")).is_some());
    }
}
