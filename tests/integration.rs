//! Integration tests for the store's write and read paths.

use branchstore::{
    AccountId, CreateVersion, EntityKey, Mutation, SchemaDefinition, SnapshotId, Store,
    StoreConfig,
};
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

fn test_store(dir: &TempDir) -> Store {
    let store = Store::create(StoreConfig {
        path: dir.path().join("store"),
        snapshot_cache_size: 100,
        create_if_missing: true,
        log_sync_interval: 1,
    })
    .unwrap();
    store
        .register_schema(SchemaDefinition::new("kv").with_primary_key(["/key"]))
        .unwrap();
    store
}

fn key(entity: &str) -> EntityKey {
    EntityKey::new(entity, "kv", "default")
}

fn value(store: &Store, version: branchstore::VersionId, entity: &str) -> Option<Value> {
    store
        .read_state(version, &key(entity))
        .unwrap()
        .and_then(|row| row.snapshot_content)
        .map(|content| content["value"].clone())
}

// --- Basic workflow ---

#[test]
fn test_insert_update_delete() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;

    let inserted = store
        .mutate(Mutation::insert(global, "kv", json!({"key": "k1", "value": 1})))
        .unwrap();
    assert_eq!(inserted.entity_id, "k1");
    assert!(inserted.change_id.is_some());
    assert!(inserted.commit_id.is_some());

    store
        .mutate(Mutation::upsert(global, "kv", json!({"key": "k1", "value": 2})))
        .unwrap();
    assert_eq!(value(&store, global, "k1"), Some(json!(2)));

    store.mutate(Mutation::delete(global, "kv", "k1")).unwrap();
    assert!(store.read_state(global, &key("k1")).unwrap().is_none());

    let tombstone = store.resolve_state(global, &key("k1")).unwrap().unwrap();
    assert!(tombstone.is_tombstone());

    // Re-inserting after a delete is allowed.
    store
        .mutate(Mutation::insert(global, "kv", json!({"key": "k1", "value": 3})))
        .unwrap();
    assert_eq!(value(&store, global, "k1"), Some(json!(3)));
}

#[test]
fn test_list_state_skips_tombstones() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;

    store
        .transact(|tx| {
            for entity in ["a", "b", "c"] {
                tx.mutate(Mutation::upsert(global, "kv", json!({"key": entity})))?;
            }
            Ok(())
        })
        .unwrap();
    store.mutate(Mutation::delete(global, "kv", "b")).unwrap();

    let ids: Vec<String> = store
        .list_state(global, Some("kv"))
        .unwrap()
        .into_iter()
        .map(|row| row.entity_id)
        .collect();
    assert_eq!(ids, vec!["a", "c"]);

    // Bookkeeping rows never show up in entity listings.
    let all = store.list_state(global, None).unwrap();
    assert_eq!(all.len(), 2);
}

#[test]
fn test_transaction_reads_its_own_writes() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;

    store
        .transact(|tx| {
            tx.mutate(Mutation::upsert(global, "kv", json!({"key": "k1", "value": "a"})))?;
            let pending = tx.read_state(global, &key("k1"))?.unwrap();
            assert!(pending.commit_id.is_none());
            tx.mutate(Mutation::upsert(global, "kv", json!({"key": "k1", "value": "b"})))?;
            Ok(())
        })
        .unwrap();

    assert_eq!(value(&store, global, "k1"), Some(json!("b")));
    let history = store.read(|engine| engine.entity_history(&key("k1")));
    assert_eq!(history.len(), 2);
}

// --- Snapshots ---

#[test]
fn test_identical_content_shares_a_snapshot() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;
    let branch = store.create_version(CreateVersion::named("b")).unwrap();

    let content = json!({"key": "k1", "value": {"nested": [1, 2, 3]}});
    let first = store
        .mutate(Mutation::upsert(global, "kv", content.clone()))
        .unwrap();
    let second = store.mutate(Mutation::upsert(branch.id, "kv", content)).unwrap();

    let first = store.change(first.change_id.unwrap()).unwrap();
    let second = store.change(second.change_id.unwrap()).unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(first.snapshot_id, second.snapshot_id);
}

#[test]
fn test_delete_records_no_content() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;

    store
        .mutate(Mutation::upsert(global, "kv", json!({"key": "k1"})))
        .unwrap();
    let deleted = store.mutate(Mutation::delete(global, "kv", "k1")).unwrap();

    let change = store.change(deleted.change_id.unwrap()).unwrap();
    assert!(change.is_tombstone());
    assert_eq!(change.snapshot_id, SnapshotId::NO_CONTENT);
}

// --- Commits and history ---

#[test]
fn test_commit_summary_and_history() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;
    let branch = store.create_version(CreateVersion::named("b")).unwrap();
    let history_before = store.history(global).unwrap();

    let mut tx = store.begin();
    tx.mutate(Mutation::upsert(global, "kv", json!({"key": "g"})))
        .unwrap();
    tx.mutate(Mutation::upsert(branch.id, "kv", json!({"key": "b"})))
        .unwrap();
    let summary = tx.commit().unwrap();

    assert_eq!(summary.change_ids.len(), 2);
    assert_eq!(summary.commits.len(), 2);
    for (version_id, commit_id) in &summary.commits {
        assert_eq!(store.version(*version_id).unwrap().commit_id, *commit_id);
    }

    let history = store.history(global).unwrap();
    assert_eq!(history.len(), history_before.len() + 1);
    assert_eq!(history[0], store.version(global).unwrap().commit_id);
    assert!(history.contains(&history_before[0]));
}

#[test]
fn test_commit_records_authors() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;
    store.set_active_accounts(vec![AccountId::new("ana")]);

    let row = store
        .mutate(Mutation::upsert(global, "kv", json!({"key": "k1"})))
        .unwrap();
    let commit_id = row.commit_id.unwrap();

    let record = store.read(|engine| engine.commit_record(commit_id)).unwrap();
    assert_eq!(record.author_account_ids, vec![AccountId::new("ana")]);
    assert!(store
        .read(|engine| engine.commits_of_change(row.change_id.unwrap()))
        .contains(&commit_id));
}

#[test]
fn test_empty_transaction_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let before = store.stats();

    let summary = store.begin().commit().unwrap();
    assert!(summary.commits.is_empty());
    assert!(summary.change_ids.is_empty());
    assert_eq!(store.stats().change_count, before.change_count);
}

#[test]
fn test_untracked_write_is_not_logged() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;
    let before = store.stats();

    let row = store
        .mutate(Mutation::upsert(global, "kv", json!({"key": "ui", "value": "open"})).untracked())
        .unwrap();
    assert!(row.untracked);
    assert!(row.change_id.is_none());
    assert_eq!(store.stats().change_count, before.change_count);
    assert_eq!(store.stats().untracked_rows, 1);
    assert_eq!(value(&store, global, "ui"), Some(json!("open")));
}

// --- Properties ---

proptest! {
    #[test]
    fn test_snapshot_id_ignores_insertion_order(
        fields in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 1..12)
    ) {
        let mut forward = Map::new();
        for (name, number) in fields.iter() {
            forward.insert(name.clone(), json!(number));
        }
        let mut backward = Map::new();
        for (name, number) in fields.iter().rev() {
            backward.insert(name.clone(), json!(number));
        }

        let a = SnapshotId::for_content(Some(&Value::Object(forward))).unwrap();
        let b = SnapshotId::for_content(Some(&Value::Object(backward))).unwrap();
        prop_assert_eq!(a, b);
        prop_assert!(!a.is_no_content());
    }
}
