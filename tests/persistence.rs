//! Persistence tests: reopen, replay, export and recovery.

use branchstore::changes::ChangeLog;
use branchstore::snapshots::SnapshotStore;
use branchstore::{
    Change, ChangeId, CommitId, CreateVersion, EntityKey, Mutation, SchemaDefinition, Store,
    StoreConfig, StoreError, Timestamp, VersionId, VersionTip, INTERNAL_FILE_ID,
    INTERNAL_PLUGIN_KEY, INTERNAL_SCHEMA_VERSION, VERSION_TIP_SCHEMA,
};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
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

/// Show the store's recovery warnings in test output.
fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn key(entity: &str) -> EntityKey {
    EntityKey::new(entity, "kv", "default")
}

fn set(store: &Store, version: VersionId, entity: &str, value: &str) {
    store
        .mutate(Mutation::upsert(version, "kv", json!({"key": entity, "value": value})))
        .unwrap();
}

fn value(store: &Store, version: VersionId, entity: &str) -> Option<String> {
    store
        .read_state(version, &key(entity))
        .unwrap()
        .and_then(|row| row.snapshot_content)
        .and_then(|content| content["value"].as_str().map(str::to_string))
}

/// Global with two entities, a branch with its own edit and one conflict.
fn populate(store: &Store) -> (VersionId, VersionId) {
    let global = store.global_version().unwrap().id;
    set(store, global, "a", "1");
    set(store, global, "b", "2");

    let branch = store.create_version(CreateVersion::named("branch")).unwrap();
    set(store, branch.id, "a", "branch");
    set(store, global, "a", "global");
    store.merge_version(branch.id, global).unwrap();
    (global, branch.id)
}

#[test]
fn test_reopen_restores_everything() {
    let dir = TempDir::new().unwrap();
    let (global, branch, versions, conflicts, tip, history) = {
        let store = test_store(&dir);
        let (global, branch) = populate(&store);
        (
            global,
            branch,
            store.versions(),
            store.conflicts(),
            store.version(global).unwrap().commit_id,
            store.history(branch).unwrap(),
        )
    };
    assert_eq!(conflicts.len(), 1);

    let store = Store::open(test_config(&dir)).unwrap();
    assert_eq!(store.versions(), versions);
    assert_eq!(store.conflicts(), conflicts);
    assert_eq!(store.version(global).unwrap().commit_id, tip);
    assert_eq!(store.history(branch).unwrap(), history);
    assert_eq!(value(&store, global, "a").as_deref(), Some("global"));
    assert_eq!(value(&store, branch, "a").as_deref(), Some("branch"));
    assert_eq!(value(&store, branch, "b").as_deref(), Some("2"));
    assert!(store.schemas().iter().any(|schema| schema.key == "kv"));

    // Writing continues without id clashes.
    set(&store, global, "c", "3");
    let changes = store.read(|engine| engine.changes());
    let mut ids: Vec<ChangeId> = changes.iter().map(|change| change.id).collect();
    ids.dedup();
    assert_eq!(ids.len(), changes.len());
}

#[test]
fn test_reopen_keeps_staged_merge() {
    let dir = TempDir::new().unwrap();
    let (global, staged) = {
        let store = test_store(&dir);
        let global = store.global_version().unwrap().id;
        let branch = store.create_version(CreateVersion::named("feature")).unwrap();
        set(&store, branch.id, "k1", "v");
        store.merge_version(branch.id, global).unwrap();
        (global, store.read(|engine| engine.staged(global)))
    };
    assert_eq!(staged.len(), 1);

    let store = Store::open(test_config(&dir)).unwrap();
    assert_eq!(store.read(|engine| engine.staged(global)), staged);
    assert_eq!(value(&store, global, "k1").as_deref(), Some("v"));
}

#[test]
fn test_untracked_rows_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let global = {
        let store = test_store(&dir);
        let global = store.global_version().unwrap().id;
        store
            .mutate(Mutation::upsert(global, "kv", json!({"key": "ui", "value": "open"})).untracked())
            .unwrap();
        global
    };

    let store = Store::open(test_config(&dir)).unwrap();
    let row = store.read_state(global, &key("ui")).unwrap().unwrap();
    assert!(row.untracked);
    assert_eq!(row.snapshot_content.unwrap()["value"], "open");
}

#[test]
fn test_rebuild_matches_live_state() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let (global, branch) = populate(&store);
    let before_global = store.list_state(global, None).unwrap();
    let before_branch = store.list_state(branch, None).unwrap();

    drop(store);

    let store = Store::open(test_config(&dir)).unwrap();
    assert_eq!(store.list_state(global, None).unwrap(), before_global);
    assert_eq!(store.list_state(branch, None).unwrap(), before_branch);
}

// --- Export / import ---

#[test]
fn test_export_import_roundtrip() {
    let source_dir = TempDir::new().unwrap();
    let target_dir = TempDir::new().unwrap();

    let store = test_store(&source_dir);
    let (global, branch) = populate(&store);
    let bytes = store.export().unwrap();

    let imported = Store::import(test_config(&target_dir), &bytes).unwrap();
    assert_eq!(imported.versions(), store.versions());
    assert_eq!(imported.conflicts(), store.conflicts());
    assert_eq!(
        imported.list_state(branch, None).unwrap(),
        store.list_state(branch, None).unwrap()
    );
    assert_eq!(value(&imported, global, "a").as_deref(), Some("global"));
    drop(imported);

    // The imported copy is a regular store.
    let reopened = Store::open(test_config(&target_dir)).unwrap();
    assert_eq!(value(&reopened, branch, "a").as_deref(), Some("branch"));
}

#[test]
fn test_corrupted_export_is_rejected() {
    let source_dir = TempDir::new().unwrap();
    let target_dir = TempDir::new().unwrap();
    let store = test_store(&source_dir);
    populate(&store);

    let mut bytes = store.export().unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xff;

    assert!(matches!(
        Store::import(test_config(&target_dir), &bytes),
        Err(StoreError::ChecksumMismatch { .. })
    ));
    assert!(matches!(
        Store::import(test_config(&target_dir), b"nope"),
        Err(StoreError::InvalidFormat(_))
    ));
}

#[test]
fn test_import_refuses_existing_store() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let bytes = store.export().unwrap();

    assert!(matches!(
        Store::import(test_config(&dir), &bytes),
        Err(StoreError::InvalidFormat(_))
    ));
}

// --- Recovery ---

#[test]
fn test_torn_log_tail_is_dropped() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let global = {
        let store = test_store(&dir);
        let global = store.global_version().unwrap().id;
        set(&store, global, "k1", "kept");
        global
    };

    // A crash mid-append leaves a partial frame header behind.
    let log_path = test_config(&dir).path.join("changes.log");
    let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
    file.write_all(&[0x42, 0x43]).unwrap();
    drop(file);

    {
        let store = Store::open(test_config(&dir)).unwrap();
        assert_eq!(value(&store, global, "k1").as_deref(), Some("kept"));
        set(&store, global, "k2", "after");
    }

    let store = Store::open(test_config(&dir)).unwrap();
    assert_eq!(value(&store, global, "k1").as_deref(), Some("kept"));
    assert_eq!(value(&store, global, "k2").as_deref(), Some("after"));
}

#[test]
fn test_dangling_tip_quarantines_version() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let (global, branch) = {
        let store = test_store(&dir);
        let global = store.global_version().unwrap().id;
        set(&store, global, "k1", "v");
        let branch = store.create_version(CreateVersion::named("broken")).unwrap();
        (global, branch)
    };

    // Point the branch at a commit that was never written.
    let tip = VersionTip {
        id: branch.id,
        commit_id: CommitId(7_777_777),
        working_commit_id: branch.working_commit_id,
    };
    let mut snapshots = SnapshotStore::open(config.path.join("snapshots"), 10).unwrap();
    let snapshot_id = snapshots
        .put(Some(&serde_json::to_value(&tip).unwrap()))
        .unwrap();
    snapshots.flush_staged().unwrap();

    let mut log = ChangeLog::open(config.path.join("changes.log"), 1).unwrap();
    log.append(&[Change {
        id: ChangeId(7_777_778),
        entity_id: branch.id.to_string(),
        schema_key: VERSION_TIP_SCHEMA.to_string(),
        schema_version: INTERNAL_SCHEMA_VERSION.to_string(),
        file_id: INTERNAL_FILE_ID.to_string(),
        plugin_key: INTERNAL_PLUGIN_KEY.to_string(),
        snapshot_id,
        created_at: Timestamp::now(),
    }])
    .unwrap();
    log.sync().unwrap();
    drop(log);
    drop(snapshots);

    let store = Store::open(config).unwrap();
    assert_eq!(store.read(|engine| engine.quarantined()), vec![branch.id]);
    assert!(matches!(
        store.read_state(branch.id, &key("k1")),
        Err(StoreError::GraphIntegrity(_))
    ));
    assert!(matches!(
        store.mutate(Mutation::upsert(branch.id, "kv", json!({"key": "k2"}))),
        Err(StoreError::GraphIntegrity(_))
    ));

    // Healthy versions keep working.
    assert_eq!(value(&store, global, "k1").as_deref(), Some("v"));
    set(&store, global, "k2", "w");
    assert_eq!(store.verify_integrity(), vec![branch.id]);
}
