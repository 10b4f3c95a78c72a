//! Tests for rejected operations and the errors they report.

use branchstore::{
    ConflictCandidate, ConflictDetector, CreateVersion, DetectedConflict, EntityKey, ForeignKey,
    Mutation, PluginError, SchemaDefinition, Store, StoreConfig, StoreError, VersionId,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        path: dir.path().join("store"),
        snapshot_cache_size: 100,
        create_if_missing: true,
        log_sync_interval: 1,
    }
}

fn test_store(dir: &TempDir) -> Store {
    let store = Store::create(test_config(dir)).unwrap();
    store
        .register_schema(SchemaDefinition::new("kv").with_primary_key(["/key"]))
        .unwrap();
    store
}

fn library(store: &Store) {
    store
        .register_schema(SchemaDefinition::new("author").with_primary_key(["/id"]))
        .unwrap();
    store
        .register_schema(
            SchemaDefinition::new("book")
                .with_primary_key(["/id"])
                .with_unique(["/isbn"])
                .with_foreign_key(ForeignKey::new(["/author_id"], "author", ["/id"])),
        )
        .unwrap();
}

// --- Constraint violations ---

#[test]
fn test_insert_duplicate_primary_key() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;

    store
        .mutate(Mutation::insert(global, "kv", json!({"key": "k1"})))
        .unwrap();
    let err = store
        .mutate(Mutation::insert(global, "kv", json!({"key": "k1", "value": 2})))
        .unwrap_err();

    assert!(err.is_constraint_violation());
    match err {
        StoreError::PrimaryKeyViolation {
            schema_key,
            entity_id,
            ..
        } => {
            assert_eq!(schema_key, "kv");
            assert_eq!(entity_id, "k1");
        }
        other => panic!("expected PrimaryKeyViolation, got {:?}", other),
    }

    // Upsert of the same key is fine.
    store
        .mutate(Mutation::upsert(global, "kv", json!({"key": "k1", "value": 2})))
        .unwrap();
}

#[test]
fn test_insert_over_inherited_entity_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;
    store
        .mutate(Mutation::insert(global, "kv", json!({"key": "k1"})))
        .unwrap();

    let child = store.create_version(CreateVersion::named("child")).unwrap();
    let err = store
        .mutate(Mutation::insert(child.id, "kv", json!({"key": "k1"})))
        .unwrap_err();
    assert!(matches!(err, StoreError::PrimaryKeyViolation { .. }));
}

#[test]
fn test_unique_violation() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    library(&store);
    let global = store.global_version().unwrap().id;

    store
        .mutate(Mutation::insert(global, "author", json!({"id": "a1"})))
        .unwrap();
    store
        .mutate(Mutation::insert(
            global,
            "book",
            json!({"id": "b1", "isbn": "978-0", "author_id": "a1"}),
        ))
        .unwrap();

    let err = store
        .mutate(Mutation::insert(
            global,
            "book",
            json!({"id": "b2", "isbn": "978-0", "author_id": "a1"}),
        ))
        .unwrap_err();
    match err {
        StoreError::UniqueViolation {
            entity_id,
            existing_entity_id,
            ..
        } => {
            assert_eq!(entity_id, "b2");
            assert_eq!(existing_entity_id, "b1");
        }
        other => panic!("expected UniqueViolation, got {:?}", other),
    }

    // Rewriting the same entity does not clash with itself.
    store
        .mutate(Mutation::upsert(
            global,
            "book",
            json!({"id": "b1", "isbn": "978-0", "author_id": "a1", "title": "t"}),
        ))
        .unwrap();
}

#[test]
fn test_foreign_key_violation() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    library(&store);
    let global = store.global_version().unwrap().id;

    let err = store
        .mutate(Mutation::insert(
            global,
            "book",
            json!({"id": "b1", "isbn": "1", "author_id": "nobody"}),
        ))
        .unwrap_err();
    match err {
        StoreError::ForeignKeyViolation {
            referenced_schema_key,
            ..
        } => assert_eq!(referenced_schema_key, "author"),
        other => panic!("expected ForeignKeyViolation, got {:?}", other),
    }

    // A reference to an entity deleted in this version is dangling too.
    store
        .mutate(Mutation::insert(global, "author", json!({"id": "a1"})))
        .unwrap();
    store.mutate(Mutation::delete(global, "author", "a1")).unwrap();
    let err = store
        .mutate(Mutation::insert(
            global,
            "book",
            json!({"id": "b1", "isbn": "1", "author_id": "a1"}),
        ))
        .unwrap_err();
    assert!(matches!(err, StoreError::ForeignKeyViolation { .. }));
}

#[test]
fn test_foreign_key_resolves_through_inheritance() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    library(&store);
    let global = store.global_version().unwrap().id;
    store
        .mutate(Mutation::insert(global, "author", json!({"id": "a1"})))
        .unwrap();

    let child = store.create_version(CreateVersion::named("child")).unwrap();
    store
        .mutate(Mutation::insert(
            child.id,
            "book",
            json!({"id": "b1", "isbn": "1", "author_id": "a1"}),
        ))
        .unwrap();
}

#[test]
fn test_rejected_mutation_keeps_transaction_usable() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;

    let mut tx = store.begin();
    tx.mutate(Mutation::insert(global, "kv", json!({"key": "k1"})))
        .unwrap();
    assert!(tx
        .mutate(Mutation::insert(global, "kv", json!({"key": "k1"})))
        .is_err());
    tx.mutate(Mutation::insert(global, "kv", json!({"key": "k2"})))
        .unwrap();
    let summary = tx.commit().unwrap();

    assert_eq!(summary.change_ids.len(), 2);
    assert_eq!(store.list_state(global, Some("kv")).unwrap().len(), 2);
}

// --- Schemas ---

#[test]
fn test_unknown_schema() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;

    let err = store
        .mutate(Mutation::upsert(global, "nope", json!({"key": "k1"})))
        .unwrap_err();
    assert!(matches!(err, StoreError::SchemaNotFound(ref key) if key == "nope"));
}

#[test]
fn test_reserved_schema_keys() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;

    assert!(matches!(
        store.register_schema(SchemaDefinition::new("internal_mine")),
        Err(StoreError::InvalidMutation(_))
    ));
    assert!(matches!(
        store.mutate(
            Mutation::upsert(global, "internal_commit", json!({"id": 1})).with_entity_id("1")
        ),
        Err(StoreError::InvalidMutation(_))
    ));
}

#[test]
fn test_missing_primary_key_value() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;

    assert!(matches!(
        store.mutate(Mutation::upsert(global, "kv", json!({"value": 1}))),
        Err(StoreError::InvalidMutation(_))
    ));
}

// --- Versions ---

#[test]
fn test_duplicate_version_name() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    store.create_version(CreateVersion::named("draft")).unwrap();
    assert!(matches!(
        store.create_version(CreateVersion::named("draft")),
        Err(StoreError::VersionExists(ref name)) if name == "draft"
    ));
}

#[test]
fn test_unknown_version() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let missing = VersionId(987_654);

    assert!(matches!(
        store.read_state(missing, &EntityKey::new("k1", "kv", "default")),
        Err(StoreError::VersionNotFound(_))
    ));
    assert!(matches!(
        store.mutate(Mutation::upsert(missing, "kv", json!({"key": "k1"}))),
        Err(StoreError::VersionNotFound(_))
    ));
    assert!(matches!(
        store.version_by_name("missing"),
        Err(StoreError::VersionNotFound(_))
    ));
    assert!(store
        .create_version(CreateVersion::named("orphan").inheriting_from(missing))
        .is_err());
}

// --- Merge ---

struct Broken;

impl ConflictDetector for Broken {
    fn key(&self) -> &str {
        "broken"
    }

    fn detect_conflicts(
        &self,
        _candidates: &[ConflictCandidate],
    ) -> Result<Vec<DetectedConflict>, PluginError> {
        Err(PluginError::new("cannot parse document"))
    }
}

#[test]
fn test_detector_failure_aborts_merge() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;
    let branch = store.create_version(CreateVersion::named("feature")).unwrap();
    store
        .mutate(Mutation::upsert(branch.id, "kv", json!({"key": "k1"})))
        .unwrap();
    store.register_detector(Arc::new(Broken));
    let before = store.stats();

    match store.merge_version(branch.id, global).unwrap_err() {
        StoreError::PluginFailure { plugin, message } => {
            assert_eq!(plugin, "broken");
            assert!(message.contains("cannot parse"));
        }
        other => panic!("expected PluginFailure, got {:?}", other),
    }

    assert_eq!(store.stats().change_count, before.change_count);
    assert!(store
        .read_state(global, &EntityKey::new("k1", "kv", "default"))
        .unwrap()
        .is_none());
}

#[test]
fn test_merge_precondition() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;

    assert!(matches!(
        store.merge_version(VersionId(55_555), global),
        Err(StoreError::MergePrecondition(_))
    ));
}

#[test]
fn test_dismiss_unknown_conflict() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    assert!(store
        .dismiss_conflict(branchstore::ConflictId(12_345))
        .is_err());
}

// --- Store lifecycle ---

#[test]
fn test_second_open_is_locked() {
    let dir = TempDir::new().unwrap();
    let _store = test_store(&dir);

    assert!(matches!(
        Store::open(test_config(&dir)),
        Err(StoreError::Locked)
    ));
}

#[test]
fn test_open_uninitialized_directory() {
    let dir = TempDir::new().unwrap();

    assert!(matches!(
        Store::open(test_config(&dir)),
        Err(StoreError::NotInitialized)
    ));
}

#[test]
fn test_dropped_transaction_discards_everything() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;
    let before = store.stats();

    {
        let mut tx = store.begin();
        tx.mutate(Mutation::upsert(global, "kv", json!({"key": "k1"})))
            .unwrap();
        tx.register_schema(SchemaDefinition::new("extra")).unwrap();
        tx.create_version(CreateVersion::named("temp")).unwrap();
    }

    let after = store.stats();
    assert_eq!(after.change_count, before.change_count);
    assert_eq!(after.version_count, before.version_count);
    assert_eq!(after.commit_count, before.commit_count);
    assert!(store.schemas().iter().all(|schema| schema.key != "extra"));
    assert!(store
        .read_state(global, &EntityKey::new("k1", "kv", "default"))
        .unwrap()
        .is_none());
}

#[test]
fn test_explicit_rollback() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let global = store.global_version().unwrap().id;

    let mut tx = store.begin();
    tx.mutate(Mutation::upsert(global, "kv", json!({"key": "k1"})))
        .unwrap();
    tx.rollback().unwrap();

    assert!(store.list_state(global, Some("kv")).unwrap().is_empty());
}
