//! Main Store struct tying all components together.

use crate::changes::ChangeLog;
use crate::engine::{Engine, Savepoint};
use crate::error::{Result, StoreError};
use crate::merge::{ConflictDetector, DetectorRegistry, MergeOutcome};
use crate::snapshots::SnapshotStore;
use crate::state::UntrackedOverlay;
use crate::subscriptions::{StoreEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionManager};
use crate::types::{
    is_internal_schema, AccountId, Change, ChangeConflict, ChangeId, CommitId, CommitSummary, ConflictId,
    CreateVersion, EntityKey, Mutation, SnapshotId, StateRow, StoreStats, Timestamp, Version,
    VersionId,
};
use crate::validate::SchemaDefinition;
use crate::wal::{WalOperation, WriteAheadLog};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Snapshot cache size (number of snapshots).
    pub snapshot_cache_size: usize,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Sync the change log every N appended rows.
    pub log_sync_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./store"),
            snapshot_cache_size: 1000,
            create_if_missing: true,
            log_sync_interval: ChangeLog::DEFAULT_SYNC_INTERVAL,
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"BST\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Magic bytes for export bundles.
const EXPORT_MAGIC: &[u8; 4] = b"BEX\0";

const EXPORT_VERSION: u8 = 1;

const SNAPSHOTS_DIR: &str = "snapshots";
const CHANGES_FILE: &str = "changes.log";
const UNTRACKED_FILE: &str = "untracked.bin";
const WAL_FILE: &str = "store.wal";

/// Portable copy of a store: the change log and the snapshots it references.
#[derive(Serialize, Deserialize)]
struct ExportBundle {
    changes: Vec<Change>,
    snapshots: Vec<(SnapshotId, Vec<u8>)>,
}

/// A versioned entity store.
///
/// All writes go through a [`Transaction`], which holds the engine's write
/// lock until it commits or is dropped. Reads take the shared lock and see
/// either the state before or after a transaction, never the middle of one.
pub struct Store {
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    engine: RwLock<Engine>,

    log: Mutex<ChangeLog>,

    wal: WriteAheadLog,

    subscriptions: SubscriptionManager,

    detectors: RwLock<DetectorRegistry>,

    /// Authors recorded on new commits.
    accounts: RwLock<Vec<AccountId>>,
}

impl Store {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store with the global version.
    pub fn create(config: StoreConfig) -> Result<Self> {
        Self::prepare_dir(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let snapshots =
            SnapshotStore::open(config.path.join(SNAPSHOTS_DIR), config.snapshot_cache_size)?;
        let log = ChangeLog::open(config.path.join(CHANGES_FILE), config.log_sync_interval)?;
        let wal = WriteAheadLog::open(config.path.join(WAL_FILE))?;

        let store = Self::assemble(config, lock_file, Engine::new(snapshots), log, wal);
        {
            let mut tx = store.begin();
            tx.engine.bootstrap(Timestamp::now())?;
            tx.commit()?;
        }

        info!(path = %store.config.path.display(), "created store");
        Ok(store)
    }

    /// Open an existing store, rolling forward an interrupted commit.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let mut snapshots =
            SnapshotStore::open(config.path.join(SNAPSHOTS_DIR), config.snapshot_cache_size)?;
        let mut log = ChangeLog::open(config.path.join(CHANGES_FILE), config.log_sync_interval)?;
        let wal = WriteAheadLog::open(config.path.join(WAL_FILE))?;

        Self::recover(&config.path, &wal, &mut log, &mut snapshots)?;

        let mut engine = Engine::new(snapshots);
        engine.untracked = UntrackedOverlay::load(&config.path.join(UNTRACKED_FILE))?;
        engine.load(log.read_all()?)?;
        engine.global_version()?;

        let quarantined = engine.quarantined();
        if !quarantined.is_empty() {
            warn!(versions = ?quarantined, "opened store with quarantined versions");
        }
        info!(path = %config.path.display(), changes = engine.stats().change_count, "opened store");

        Ok(Self::assemble(config, lock_file, engine, log, wal))
    }

    /// Create a new store at `config.path` from an export bundle.
    pub fn import(config: StoreConfig, bytes: &[u8]) -> Result<Self> {
        let bundle = decode_bundle(bytes)?;
        if config.path.join("MANIFEST").exists() {
            return Err(StoreError::InvalidFormat(format!(
                "a store already exists at {}",
                config.path.display()
            )));
        }

        Self::prepare_dir(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let mut snapshots =
            SnapshotStore::open(config.path.join(SNAPSHOTS_DIR), config.snapshot_cache_size)?;
        for (id, raw) in &bundle.snapshots {
            snapshots.store_raw(*id, raw)?;
        }

        let mut log = ChangeLog::open(config.path.join(CHANGES_FILE), config.log_sync_interval)?;
        log.truncate(0)?;
        log.append(&bundle.changes)?;
        log.sync()?;
        let wal = WriteAheadLog::open(config.path.join(WAL_FILE))?;

        let mut engine = Engine::new(snapshots);
        engine.load(bundle.changes)?;
        engine.global_version()?;

        info!(
            path = %config.path.display(),
            changes = engine.stats().change_count,
            snapshots = bundle.snapshots.len(),
            "imported store"
        );
        Ok(Self::assemble(config, lock_file, engine, log, wal))
    }

    fn assemble(
        config: StoreConfig,
        lock_file: File,
        engine: Engine,
        log: ChangeLog,
        wal: WriteAheadLog,
    ) -> Self {
        Self {
            config,
            _lock_file: lock_file,
            engine: RwLock::new(engine),
            log: Mutex::new(log),
            wal,
            subscriptions: SubscriptionManager::new(),
            detectors: RwLock::new(DetectorRegistry::new()),
            accounts: RwLock::new(Vec::new()),
        }
    }

    /// Apply WAL entries that were synced but not fully applied.
    ///
    /// Runs on open and before every commit.
    fn recover(
        path: &Path,
        wal: &WriteAheadLog,
        log: &mut ChangeLog,
        snapshots: &mut SnapshotStore,
    ) -> Result<()> {
        let pending = wal.pending_entries()?;
        if pending.is_empty() {
            return Ok(());
        }

        for entry in &pending {
            let WalOperation::Commit {
                log_offset,
                changes,
                snapshots: raw_snapshots,
                untracked,
            } = &entry.operation
            else {
                continue;
            };

            if log.size() < *log_offset {
                return Err(StoreError::Corruption(format!(
                    "change log is {} bytes but WAL entry {} starts at {}",
                    log.size(),
                    entry.seq,
                    log_offset
                )));
            }

            for (id, raw) in raw_snapshots {
                snapshots.store_raw(*id, raw)?;
            }
            log.truncate(*log_offset)?;
            log.append(changes)?;
            log.sync()?;
            UntrackedOverlay::write_file(&path.join(UNTRACKED_FILE), untracked)?;
            wal.mark_applied(entry.seq)?;

            info!(seq = entry.seq, changes = changes.len(), "rolled forward WAL entry");
        }

        wal.clear()?;
        Ok(())
    }

    // --- Transactions ---

    /// Start a transaction. Blocks while another transaction is open.
    pub fn begin(&self) -> Transaction<'_> {
        let mut engine = self.engine.write();
        let start = engine.begin();
        Transaction {
            store: self,
            engine,
            start,
            events: Vec::new(),
            done: false,
        }
    }

    /// Run `f` in a transaction; commit on `Ok`, roll back on `Err`.
    pub fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let mut tx = self.begin();
        let value = f(&mut tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Persist everything the open transaction wrote.
    ///
    /// The WAL entry is the commit point; once it is synced the transaction
    /// counts as committed even if applying it to the files fails.
    fn persist(&self, engine: &mut Engine, start: &Savepoint, committed: &mut bool) -> Result<()> {
        if !engine.written_since(start) {
            engine.finish();
            *committed = true;
            return Ok(());
        }

        let mut log = self.log.lock();

        // An earlier commit that failed past its commit point is still in
        // the WAL; apply it before this entry can clear it.
        Self::recover(&self.config.path, &self.wal, &mut log, &mut engine.snapshots)?;

        let changes = engine.transaction_changes().to_vec();
        let snapshots = engine.snapshots.staged_entries()?;
        let untracked = engine.untracked.to_bytes()?;

        let seq = self.wal.log(WalOperation::Commit {
            log_offset: log.size(),
            changes: changes.clone(),
            snapshots,
            untracked: untracked.clone(),
        })?;
        engine.finish();
        *committed = true;

        engine.snapshots.flush_staged()?;
        log.append(&changes)?;
        log.sync()?;
        UntrackedOverlay::write_file(&self.config.path.join(UNTRACKED_FILE), &untracked)?;
        self.wal.mark_applied(seq)?;
        self.wal.clear()?;

        debug!(seq, changes = changes.len(), "persisted transaction");
        Ok(())
    }

    // --- Single-operation transactions ---

    /// Apply one mutation and commit it.
    pub fn mutate(&self, mutation: Mutation) -> Result<StateRow> {
        let version_id = mutation.version_id;
        let tracked = !mutation.untracked;
        let row = self.transact(|tx| tx.mutate(mutation))?;

        if tracked {
            // Re-read so the row carries its commit id.
            if let Some(committed) = self.resolve_state(version_id, &row.key())? {
                return Ok(committed);
            }
        }
        Ok(row)
    }

    pub fn create_version(&self, options: CreateVersion) -> Result<Version> {
        self.transact(|tx| tx.create_version(options))
    }

    pub fn delete_version(&self, version_id: VersionId) -> Result<Version> {
        self.transact(|tx| tx.delete_version(version_id))
    }

    pub fn merge_version(&self, source: VersionId, target: VersionId) -> Result<MergeOutcome> {
        self.transact(|tx| tx.merge_version(source, target))
    }

    pub fn checkpoint(&self, version_id: VersionId) -> Result<Option<CommitId>> {
        self.transact(|tx| tx.checkpoint(version_id))
    }

    pub fn register_schema(&self, schema: SchemaDefinition) -> Result<()> {
        self.transact(|tx| tx.register_schema(schema))
    }

    pub fn dismiss_conflict(&self, conflict_id: ConflictId) -> Result<()> {
        self.transact(|tx| tx.dismiss_conflict(conflict_id))
    }

    // --- Reads ---

    /// Run `f` against a consistent view of the engine.
    pub fn read<T>(&self, f: impl FnOnce(&Engine) -> T) -> T {
        f(&self.engine.read())
    }

    pub fn read_state(&self, version_id: VersionId, key: &EntityKey) -> Result<Option<StateRow>> {
        self.engine.read().read_state(version_id, key)
    }

    pub fn resolve_state(&self, version_id: VersionId, key: &EntityKey) -> Result<Option<StateRow>> {
        self.engine.read().resolve_state(version_id, key)
    }

    pub fn list_state(&self, version_id: VersionId, schema_key: Option<&str>) -> Result<Vec<StateRow>> {
        self.engine.read().list_state(version_id, schema_key)
    }

    pub fn version(&self, version_id: VersionId) -> Result<Version> {
        self.engine.read().version(version_id)
    }

    pub fn version_by_name(&self, name: &str) -> Result<Version> {
        self.engine.read().version_by_name(name)
    }

    pub fn global_version(&self) -> Result<Version> {
        self.engine.read().global_version()
    }

    pub fn versions(&self) -> Vec<Version> {
        self.engine.read().versions()
    }

    pub fn conflicts(&self) -> Vec<ChangeConflict> {
        self.engine.read().conflicts()
    }

    pub fn change(&self, change_id: ChangeId) -> Option<Change> {
        self.engine.read().change(change_id)
    }

    pub fn history(&self, version_id: VersionId) -> Result<Vec<CommitId>> {
        self.engine.read().history(version_id)
    }

    pub fn schemas(&self) -> Vec<SchemaDefinition> {
        self.engine.read().schemas()
    }

    pub fn stats(&self) -> StoreStats {
        self.engine.read().stats()
    }

    // --- Store Operations ---

    /// Add a conflict detector; a detector with the same key is replaced.
    pub fn register_detector(&self, detector: Arc<dyn ConflictDetector>) {
        debug!(plugin = detector.key(), "registered conflict detector");
        self.detectors.write().register(detector);
    }

    pub fn unregister_detector(&self, key: &str) -> bool {
        self.detectors.write().unregister(key)
    }

    /// Accounts recorded as authors of subsequent commits.
    pub fn set_active_accounts(&self, accounts: Vec<AccountId>) {
        *self.accounts.write() = accounts;
    }

    pub fn active_accounts(&self) -> Vec<AccountId> {
        self.accounts.read().clone()
    }

    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        self.subscriptions.subscribe(config)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.subscriptions.unsubscribe(handle.id);
    }

    /// Re-check every version's history and quarantine broken ones.
    pub fn verify_integrity(&self) -> Vec<VersionId> {
        self.engine.write().verify_integrity()
    }

    /// Serialize the change log and its snapshots into a portable bundle.
    pub fn export(&self) -> Result<Vec<u8>> {
        let engine = self.engine.read();
        let changes = engine.changes.all().to_vec();

        let mut seen = HashSet::new();
        let mut snapshots = Vec::new();
        for change in &changes {
            if change.snapshot_id.is_no_content() || !seen.insert(change.snapshot_id) {
                continue;
            }
            snapshots.push((change.snapshot_id, engine.snapshots.raw_bytes(&change.snapshot_id)?));
        }

        let bundle = ExportBundle { changes, snapshots };
        let body = rmp_serde::to_vec(&bundle)?;

        let mut bytes = Vec::with_capacity(body.len() + 9);
        bytes.extend_from_slice(EXPORT_MAGIC);
        bytes.push(EXPORT_VERSION);
        bytes.extend_from_slice(&body);
        bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());

        info!(
            changes = bundle.changes.len(),
            snapshots = bundle.snapshots.len(),
            bytes = bytes.len(),
            "exported store"
        );
        Ok(bytes)
    }

    /// Sync the change log to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.lock().sync()
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Private Helpers ---

    fn prepare_dir(path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        fs::create_dir_all(path.join(SNAPSHOTS_DIR))?;
        Self::write_manifest(path)
    }

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        if !manifest_path.exists() {
            return Err(StoreError::NotInitialized);
        }
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

fn decode_bundle(bytes: &[u8]) -> Result<ExportBundle> {
    if bytes.len() < 9 || &bytes[0..4] != EXPORT_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid export magic".into()));
    }
    if bytes[4] != EXPORT_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported export version: {}",
            bytes[4]
        )));
    }

    let (body, checksum) = bytes[5..].split_at(bytes.len() - 9);
    let mut expected = [0u8; 4];
    expected.copy_from_slice(checksum);
    let expected = u32::from_le_bytes(expected);
    let got = crc32fast::hash(body);
    if expected != got {
        return Err(StoreError::ChecksumMismatch { expected, got });
    }

    Ok(rmp_serde::from_slice(body)?)
}

/// Savepoint inside a transaction.
#[derive(Clone, Debug)]
pub struct TransactionSavepoint {
    engine: Savepoint,
    events: usize,
}

/// Exclusive write access to the store.
///
/// Reads through the transaction (via `Deref` to [`Engine`]) see its own
/// pending changes. Dropping it without [`Transaction::commit`] rolls back.
pub struct Transaction<'a> {
    store: &'a Store,
    engine: RwLockWriteGuard<'a, Engine>,
    start: Savepoint,
    /// Broadcast once the transaction is persisted.
    events: Vec<StoreEvent>,
    done: bool,
}

impl<'a> Transaction<'a> {
    pub fn mutate(&mut self, mutation: Mutation) -> Result<StateRow> {
        self.engine.mutate(mutation, Timestamp::now())
    }

    pub fn create_version(&mut self, options: CreateVersion) -> Result<Version> {
        let version = self.engine.create_version(options, Timestamp::now())?;
        self.events.push(StoreEvent::VersionCreated {
            version: (&version).into(),
        });
        Ok(version)
    }

    pub fn delete_version(&mut self, version_id: VersionId) -> Result<Version> {
        let version = self.engine.delete_version(version_id, Timestamp::now())?;
        self.events.push(StoreEvent::VersionDeleted {
            id: version.id,
            name: version.name.clone(),
        });
        Ok(version)
    }

    /// Merge `source` into `target` using the store's conflict detectors.
    pub fn merge_version(&mut self, source: VersionId, target: VersionId) -> Result<MergeOutcome> {
        let detectors = self.store.detectors.read().clone();
        let outcome = self
            .engine
            .merge_version(source, target, &detectors, Timestamp::now())?;
        if source != target {
            self.events.push(StoreEvent::Merged {
                source,
                target,
                fast_forwarded: outcome.fast_forwarded.len(),
                held_back: outcome.held_back.len(),
                new_conflicts: outcome.new_conflicts,
            });
        }
        Ok(outcome)
    }

    /// Commit the staged elements of a version without other changes.
    pub fn checkpoint(&mut self, version_id: VersionId) -> Result<Option<CommitId>> {
        let authors = self.store.active_accounts();
        let commit_id = self
            .engine
            .checkpoint(version_id, &authors, Timestamp::now())?;
        if let Some(commit_id) = commit_id {
            self.events.push(StoreEvent::Committed {
                commits: vec![(version_id, commit_id)],
                change_count: 0,
            });
        }
        Ok(commit_id)
    }

    pub fn register_schema(&mut self, schema: SchemaDefinition) -> Result<()> {
        self.engine.register_schema(schema, Timestamp::now())
    }

    pub fn dismiss_conflict(&mut self, conflict_id: ConflictId) -> Result<()> {
        self.engine.dismiss_conflict(conflict_id, Timestamp::now())
    }

    pub fn savepoint(&self) -> TransactionSavepoint {
        TransactionSavepoint {
            engine: self.engine.savepoint(),
            events: self.events.len(),
        }
    }

    /// Undo everything done since `savepoint`; the transaction stays open.
    pub fn rollback_to(&mut self, savepoint: &TransactionSavepoint) -> Result<()> {
        self.engine.rollback_to(&savepoint.engine)?;
        self.events.truncate(savepoint.events);
        Ok(())
    }

    /// Commit pending changes and persist the transaction.
    pub fn commit(mut self) -> Result<CommitSummary> {
        let authors = self.store.active_accounts();
        let commits = self.engine.commit(&authors, Timestamp::now())?;

        let change_ids: Vec<ChangeId> = self
            .engine
            .transaction_changes()
            .iter()
            .filter(|change| !is_internal_schema(&change.schema_key))
            .map(|change| change.id)
            .collect();

        self.store
            .persist(&mut self.engine, &self.start, &mut self.done)?;

        for event in self.events.drain(..) {
            self.store.subscriptions.broadcast(event);
        }
        self.store
            .subscriptions
            .broadcast_committed(&commits, change_ids.len());

        Ok(CommitSummary {
            commits,
            change_ids,
        })
    }

    /// Discard everything the transaction wrote.
    pub fn rollback(mut self) -> Result<()> {
        self.done = true;
        self.undo()
    }

    fn undo(&mut self) -> Result<()> {
        let result = self.engine.rollback_to(&self.start);
        self.engine.snapshots.discard_staged();
        self.engine.finish();
        info!(log_len = self.start.log_len(), "transaction rolled back");
        result
    }
}

impl Deref for Transaction<'_> {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        &self.engine
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(e) = self.undo() {
            error!(error = %e, "rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::SubscriptionFilter;
    use serde_json::json;
    use std::time::Duration;
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

    fn key(entity: &str) -> EntityKey {
        EntityKey::new(entity, "kv", "default")
    }

    #[test]
    fn test_create_store() {
        let dir = TempDir::new().unwrap();
        let store = Store::create(test_config(&dir)).unwrap();

        assert!(store.path().join("MANIFEST").exists());
        assert!(store.path().join(CHANGES_FILE).exists());
        assert_eq!(store.global_version().unwrap().name, "global");
    }

    #[test]
    fn test_mutate_commits() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let global = store.global_version().unwrap().id;

        let row = store
            .mutate(Mutation::upsert(global, "kv", json!({"key": "k1", "value": 1})))
            .unwrap();
        assert!(row.commit_id.is_some());
        assert_eq!(store.version(global).unwrap().commit_id, row.commit_id.unwrap());
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let global = store.global_version().unwrap().id;
        let before = store.stats();

        {
            let mut tx = store.begin();
            tx.mutate(Mutation::upsert(global, "kv", json!({"key": "k1"})))
                .unwrap();
            tx.create_version(CreateVersion::named("tmp")).unwrap();
            assert!(tx.read_state(global, &key("k1")).unwrap().is_some());
        }

        assert!(store.read_state(global, &key("k1")).unwrap().is_none());
        assert!(store.version_by_name("tmp").is_err());
        assert_eq!(store.stats().change_count, before.change_count);
    }

    #[test]
    fn test_transaction_savepoint() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let global = store.global_version().unwrap().id;

        let mut tx = store.begin();
        tx.mutate(Mutation::upsert(global, "kv", json!({"key": "keep"})))
            .unwrap();
        let savepoint = tx.savepoint();
        tx.mutate(Mutation::upsert(global, "kv", json!({"key": "drop"})))
            .unwrap();
        tx.rollback_to(&savepoint).unwrap();
        let summary = tx.commit().unwrap();

        assert_eq!(summary.change_ids.len(), 1);
        assert!(store.read_state(global, &key("keep")).unwrap().is_some());
        assert!(store.read_state(global, &key("drop")).unwrap().is_none());
    }

    #[test]
    fn test_failed_commit_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let global;
        let tip;
        {
            let store = test_store(&dir);
            global = store.global_version().unwrap().id;
            tip = store.version(global).unwrap().commit_id;

            let mut tx = store.begin();
            tx.mutate(Mutation::upsert(global, "kv", json!({"key": "k1"})))
                .unwrap();
            tx.engine.fail_after_rows = Some(1);
            assert!(tx.commit().is_err());

            assert_eq!(store.version(global).unwrap().commit_id, tip);
            assert!(store.read_state(global, &key("k1")).unwrap().is_none());
            store.engine.write().fail_after_rows = None;
        }

        let store = Store::open(config).unwrap();
        assert_eq!(store.version(global).unwrap().commit_id, tip);
        assert!(store.read_state(global, &key("k1")).unwrap().is_none());
    }

    #[test]
    fn test_wal_roll_forward() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let global;
        {
            let store = test_store(&dir);
            global = store.global_version().unwrap().id;

            // Log a commit to the WAL but stop before it reaches the change log.
            let mut engine = store.engine.write();
            let start = engine.begin();
            engine
                .mutate(
                    Mutation::upsert(global, "kv", json!({"key": "k1", "value": "v"})),
                    Timestamp::now(),
                )
                .unwrap();
            engine.commit(&[], Timestamp::now()).unwrap();
            assert!(engine.written_since(&start));

            let log_offset = store.log.lock().size();
            store
                .wal
                .log(WalOperation::Commit {
                    log_offset,
                    changes: engine.transaction_changes().to_vec(),
                    snapshots: engine.snapshots.staged_entries().unwrap(),
                    untracked: engine.untracked.to_bytes().unwrap(),
                })
                .unwrap();
        }

        let store = Store::open(config).unwrap();
        let row = store.read_state(global, &key("k1")).unwrap().unwrap();
        assert_eq!(row.snapshot_content, Some(json!({"key": "k1", "value": "v"})));
        assert!(!store.wal.has_pending().unwrap());
    }

    #[test]
    fn test_unapplied_commit_survives_next_commit() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let global;
        {
            let store = test_store(&dir);
            global = store.global_version().unwrap().id;

            // First commit passes its commit point, then applying it fails.
            {
                let mut engine = store.engine.write();
                engine.begin();
                engine
                    .mutate(
                        Mutation::upsert(global, "kv", json!({"key": "k1", "value": "first"})),
                        Timestamp::now(),
                    )
                    .unwrap();
                engine.commit(&[], Timestamp::now()).unwrap();

                let log_offset = store.log.lock().size();
                store
                    .wal
                    .log(WalOperation::Commit {
                        log_offset,
                        changes: engine.transaction_changes().to_vec(),
                        snapshots: engine.snapshots.staged_entries().unwrap(),
                        untracked: engine.untracked.to_bytes().unwrap(),
                    })
                    .unwrap();
                engine.finish();
            }

            store
                .mutate(Mutation::upsert(global, "kv", json!({"key": "k2", "value": "second"})))
                .unwrap();
            assert!(!store.wal.has_pending().unwrap());
        }

        let store = Store::open(config).unwrap();
        assert!(store.read(|engine| engine.quarantined()).is_empty());
        let first = store.read_state(global, &key("k1")).unwrap().unwrap();
        assert_eq!(first.snapshot_content, Some(json!({"key": "k1", "value": "first"})));
        let second = store.read_state(global, &key("k2")).unwrap().unwrap();
        assert_eq!(second.snapshot_content, Some(json!({"key": "k2", "value": "second"})));
    }

    #[test]
    fn test_store_lock() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let _store1 = Store::create(config.clone()).unwrap();

        let result = Store::open(config);
        assert!(matches!(result, Err(StoreError::Locked)));
    }

    #[test]
    fn test_open_missing_store() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            create_if_missing: false,
            ..test_config(&dir)
        };
        assert!(matches!(
            Store::open_or_create(config),
            Err(StoreError::NotInitialized)
        ));
    }

    #[test]
    fn test_events_follow_commit() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let handle = store.subscribe(SubscriptionConfig {
            filter: SubscriptionFilter::all(),
            ..Default::default()
        });

        let version = store.create_version(CreateVersion::named("feature")).unwrap();
        match handle.recv_timeout(Duration::from_millis(100)).unwrap() {
            StoreEvent::VersionCreated { version: summary } => {
                assert_eq!(summary.id, version.id);
                assert_eq!(summary.name, "feature");
            }
            other => panic!("expected VersionCreated, got {:?}", other),
        }

        store
            .mutate(Mutation::upsert(version.id, "kv", json!({"key": "k1"})))
            .unwrap();
        assert!(matches!(
            handle.recv_timeout(Duration::from_millis(100)).unwrap(),
            StoreEvent::Committed { change_count: 1, .. }
        ));

        // Nothing is broadcast for a rolled-back transaction.
        {
            let mut tx = store.begin();
            tx.delete_version(version.id).unwrap();
        }
        assert!(handle.try_recv().is_err());
    }

    #[test]
    fn test_authors_recorded() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.set_active_accounts(vec![AccountId::new("alice"), AccountId::new("bob")]);
        let global = store.global_version().unwrap().id;

        let row = store
            .mutate(Mutation::upsert(global, "kv", json!({"key": "k1"})))
            .unwrap();
        let authors = store.read(|engine| engine.change_authors(row.change_id.unwrap()));
        assert_eq!(authors, vec![AccountId::new("alice"), AccountId::new("bob")]);
    }
}
