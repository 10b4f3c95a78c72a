//! Core types for the change store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Unique identifier for a change (log position order).
    ChangeId
);
id_type!(
    /// Unique identifier for a commit.
    CommitId
);
id_type!(
    /// Identifier of the set of changes visible as of a commit.
    ChangeSetId
);
id_type!(
    /// Unique identifier for a version (branch).
    VersionId
);
id_type!(
    /// Unique identifier for a conflict record.
    ConflictId
);

/// Hands out engine-generated ids from one increasing sequence.
#[derive(Clone, Debug)]
pub struct IdAllocator {
    next: u64,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl IdAllocator {
    fn bump(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn change(&mut self) -> ChangeId {
        ChangeId(self.bump())
    }

    pub fn commit(&mut self) -> CommitId {
        CommitId(self.bump())
    }

    pub fn change_set(&mut self) -> ChangeSetId {
        ChangeSetId(self.bump())
    }

    pub fn version(&mut self) -> VersionId {
        VersionId(self.bump())
    }

    pub fn conflict(&mut self) -> ConflictId {
        ConflictId(self.bump())
    }

    /// Make sure future ids are larger than one already in use.
    pub fn observe(&mut self, id: u64) {
        if id >= self.next {
            self.next = id + 1;
        }
    }
}

/// Content address of a snapshot (SHA-256 of its canonical JSON).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub [u8; 32]);

impl SnapshotId {
    /// Reserved id meaning "no content" (deletions).
    pub const NO_CONTENT: SnapshotId = SnapshotId([0u8; 32]);

    /// Compute id from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        SnapshotId(hasher.finalize().into())
    }

    /// Canonical bytes of a snapshot payload.
    ///
    /// Object keys are sorted because `serde_json::Map` is ordered.
    pub fn canonical_bytes(content: &Value) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(content)
    }

    /// Id for an optional payload; `None` and JSON `null` map to [`SnapshotId::NO_CONTENT`].
    pub fn for_content(content: Option<&Value>) -> Result<Self, serde_json::Error> {
        match content {
            None | Some(Value::Null) => Ok(Self::NO_CONTENT),
            Some(value) => Ok(Self::from_bytes(&Self::canonical_bytes(value)?)),
        }
    }

    pub fn is_no_content(&self) -> bool {
        *self == Self::NO_CONTENT
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(SnapshotId(arr))
    }

    /// First byte as hex (for sharding).
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[0..1])
    }
}

impl fmt::Debug for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_no_content() {
            write!(f, "SnapshotId(no-content)")
        } else {
            write!(f, "SnapshotId({}...)", &self.to_hex()[..8])
        }
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_no_content() {
            write!(f, "no-content")
        } else {
            write!(f, "{}", self.to_hex())
        }
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Account credited as author of a commit.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        AccountId(id.into())
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.0)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Reserved bookkeeping schemas ---

/// Prefix of schema keys reserved for engine bookkeeping.
pub const INTERNAL_SCHEMA_PREFIX: &str = "internal_";
pub const COMMIT_SCHEMA: &str = "internal_commit";
pub const VERSION_TIP_SCHEMA: &str = "internal_version_tip";
pub const VERSION_DESCRIPTOR_SCHEMA: &str = "internal_version_descriptor";
pub const WORKING_COMMIT_SCHEMA: &str = "internal_working_commit";
pub const CONFLICT_SCHEMA: &str = "internal_change_conflict";
pub const STORED_SCHEMA_SCHEMA: &str = "internal_stored_schema";

/// File id used by bookkeeping rows.
pub const INTERNAL_FILE_ID: &str = "internal";
/// Plugin key used by bookkeeping rows.
pub const INTERNAL_PLUGIN_KEY: &str = "internal";
/// Schema version used by bookkeeping rows.
pub const INTERNAL_SCHEMA_VERSION: &str = "1.0";

/// Whether a schema key is reserved for bookkeeping rows.
pub fn is_internal_schema(schema_key: &str) -> bool {
    schema_key.starts_with(INTERNAL_SCHEMA_PREFIX)
}

/// Identity of a logical entity within a version.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub schema_key: String,
    pub file_id: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(
        entity_id: impl Into<String>,
        schema_key: impl Into<String>,
        file_id: impl Into<String>,
    ) -> Self {
        Self {
            schema_key: schema_key.into(),
            file_id: file_id.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Smallest key of a schema (for range scans).
    pub(crate) fn schema_floor(schema_key: &str) -> Self {
        Self {
            schema_key: schema_key.to_string(),
            file_id: String::new(),
            entity_id: String::new(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.schema_key, self.file_id, self.entity_id)
    }
}

/// One observed mutation of a logical entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    pub snapshot_id: SnapshotId,
    pub created_at: Timestamp,
}

impl Change {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }

    /// Whether this change deletes its entity.
    pub fn is_tombstone(&self) -> bool {
        self.snapshot_id.is_no_content()
    }
}

/// Snapshot content of a commit change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: CommitId,
    pub change_set_id: ChangeSetId,
    pub parent_commit_ids: Vec<CommitId>,
    pub meta_change_ids: Vec<ChangeId>,
    pub author_account_ids: Vec<AccountId>,
}

/// Snapshot content of a version-tip change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionTip {
    pub id: VersionId,
    pub commit_id: CommitId,
    pub working_commit_id: CommitId,
}

/// Snapshot content of a version-descriptor change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    pub id: VersionId,
    pub name: String,
    pub inherits_from_version_id: Option<VersionId>,
    #[serde(default)]
    pub hidden: bool,
    /// Commit the version was forked from; older history is seen through inheritance.
    #[serde(default)]
    pub fork_commit_id: Option<CommitId>,
}

/// Staging area of a version: change ids not yet part of a commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingCommit {
    pub id: CommitId,
    /// Tip the staged elements apply on top of.
    pub base_commit_id: CommitId,
    pub change_set_id: ChangeSetId,
    pub meta_change_ids: Vec<ChangeId>,
}

/// A named, mutable pointer into the change graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub name: String,
    pub commit_id: CommitId,
    pub working_commit_id: CommitId,
    pub inherits_from_version_id: Option<VersionId>,
    pub hidden: bool,
    pub fork_commit_id: Option<CommitId>,
}

/// Durable record of changes that could not be reconciled by a merge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeConflict {
    pub id: ConflictId,
    pub key: String,
    pub change_ids: BTreeSet<ChangeId>,
}

/// Last-known value of an entity as seen from a version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateRow {
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    pub version_id: VersionId,
    /// `None` when the entity is deleted in this version.
    pub snapshot_content: Option<Value>,
    /// `None` for untracked rows.
    pub change_id: Option<ChangeId>,
    /// `None` for untracked rows and uncommitted (pending) rows.
    pub commit_id: Option<CommitId>,
    pub inherited_from_version_id: Option<VersionId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub untracked: bool,
}

impl StateRow {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }

    pub fn is_tombstone(&self) -> bool {
        self.snapshot_content.is_none()
    }
}

/// Kind of row-level operation a mutation performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    /// Create an entity; fails if a live entity with the same primary key exists.
    Insert,
    /// Create or replace an entity.
    Upsert,
    /// Delete an entity (tombstone).
    Delete,
}

/// A row-level mutation submitted by the entity view layer.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    pub kind: MutationKind,
    /// Derived from the primary key when `None`.
    pub entity_id: Option<String>,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    pub content: Option<Value>,
    pub version_id: VersionId,
    /// Write to the untracked overlay instead of the change log.
    pub untracked: bool,
}

impl Mutation {
    fn new(
        kind: MutationKind,
        version_id: VersionId,
        schema_key: impl Into<String>,
        content: Option<Value>,
    ) -> Self {
        Self {
            kind,
            entity_id: None,
            schema_key: schema_key.into(),
            schema_version: "1.0".to_string(),
            file_id: "default".to_string(),
            plugin_key: "json".to_string(),
            content,
            version_id,
            untracked: false,
        }
    }

    /// Insert a new entity.
    pub fn insert(version_id: VersionId, schema_key: impl Into<String>, content: Value) -> Self {
        Self::new(MutationKind::Insert, version_id, schema_key, Some(content))
    }

    /// Insert or replace an entity.
    pub fn upsert(version_id: VersionId, schema_key: impl Into<String>, content: Value) -> Self {
        Self::new(MutationKind::Upsert, version_id, schema_key, Some(content))
    }

    /// Delete an entity by id.
    pub fn delete(
        version_id: VersionId,
        schema_key: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self::new(MutationKind::Delete, version_id, schema_key, None).with_entity_id(entity_id)
    }

    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_file_id(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = file_id.into();
        self
    }

    pub fn with_plugin_key(mut self, plugin_key: impl Into<String>) -> Self {
        self.plugin_key = plugin_key.into();
        self
    }

    pub fn with_schema_version(mut self, schema_version: impl Into<String>) -> Self {
        self.schema_version = schema_version.into();
        self
    }

    pub fn untracked(mut self) -> Self {
        self.untracked = true;
        self
    }
}

/// Options for creating a version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateVersion {
    /// Generated when `None`.
    pub name: Option<String>,
    /// Base version; the global version when `None`.
    pub inherits_from: Option<VersionId>,
    /// Start from this commit instead of the base's tip. The full history of
    /// the commit is then native to the new version.
    pub from_commit_id: Option<CommitId>,
    pub hidden: bool,
}

impl CreateVersion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn inheriting_from(mut self, version_id: VersionId) -> Self {
        self.inherits_from = Some(version_id);
        self
    }

    pub fn from_commit(mut self, commit_id: CommitId) -> Self {
        self.from_commit_id = Some(commit_id);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }
}

/// What a transaction commit wrote.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// New commit per touched version.
    pub commits: Vec<(VersionId, CommitId)>,
    /// Every change row appended by the transaction, in log order.
    pub change_ids: Vec<ChangeId>,
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub change_count: u64,
    pub commit_count: u64,
    pub version_count: u64,
    pub snapshot_count: u64,
    pub conflict_count: u64,
    pub materialized_rows: u64,
    pub untracked_rows: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_id_hex_roundtrip() {
        let id = SnapshotId::from_bytes(b"hello world");
        let parsed = SnapshotId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.shard_prefix().len(), 2);
    }

    #[test]
    fn test_null_content_is_no_content() {
        assert_eq!(SnapshotId::for_content(None).unwrap(), SnapshotId::NO_CONTENT);
        assert_eq!(
            SnapshotId::for_content(Some(&Value::Null)).unwrap(),
            SnapshotId::NO_CONTENT
        );
        assert_eq!(SnapshotId::NO_CONTENT.to_string(), "no-content");
    }

    #[test]
    fn test_content_id_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 1}}"#).unwrap();
        let b = json!({"a": {"x": 1, "y": 2}, "b": 1});
        assert_eq!(
            SnapshotId::for_content(Some(&a)).unwrap(),
            SnapshotId::for_content(Some(&b)).unwrap()
        );
    }

    #[test]
    fn test_id_allocator_observe() {
        let mut ids = IdAllocator::default();
        assert_eq!(ids.change(), ChangeId(1));
        ids.observe(10);
        assert_eq!(ids.commit(), CommitId(11));
        ids.observe(3);
        assert_eq!(ids.version(), VersionId(12));
    }

    #[test]
    fn test_entity_key_orders_by_schema_first() {
        let a = EntityKey::new("z", "author", "f");
        let b = EntityKey::new("a", "book", "f");
        assert!(a < b);
        assert!(EntityKey::schema_floor("book") <= b);
    }
}
