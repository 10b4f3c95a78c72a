//! # Branchstore
//!
//! An embedded change-tracking store for structured entities with cheap
//! versions (branches), commits and merges.
//!
//! ## Core Concepts
//!
//! - **Changes**: Immutable rows recording one entity's new content (or its deletion)
//! - **Snapshots**: Content-addressed JSON, deduplicated by SHA-256 of canonical bytes
//! - **Commits**: Groups of changes forming a DAG through parent commits
//! - **Versions**: Named pointers into the DAG that inherit unchanged entities from their base
//! - **Merges**: Fast-forward what the source changed, record conflicts for what both sides changed
//!
//! Everything durable is a change row; versions, commits, conflicts and
//! schemas are folded from the change log when a store is opened.
//!
//! ## Example
//!
//! ```ignore
//! use branchstore::{CreateVersion, EntityKey, Mutation, SchemaDefinition, Store, StoreConfig};
//! use serde_json::json;
//!
//! let store = Store::open_or_create(StoreConfig {
//!     path: "./my-store".into(),
//!     ..Default::default()
//! })?;
//! store.register_schema(SchemaDefinition::new("task").with_primary_key(["/id"]))?;
//!
//! let global = store.global_version()?.id;
//! store.mutate(Mutation::upsert(global, "task", json!({"id": "t1", "done": false})))?;
//!
//! let draft = store.create_version(CreateVersion::named("draft"))?;
//! store.mutate(Mutation::upsert(draft.id, "task", json!({"id": "t1", "done": true})))?;
//!
//! let outcome = store.merge_version(draft.id, global)?;
//! assert_eq!(outcome.fast_forwarded, vec![EntityKey::new("t1", "task", "default")]);
//! ```

pub mod changes;
pub mod commit;
pub mod engine;
pub mod error;
pub mod graph;
pub mod merge;
pub mod snapshots;
pub mod state;
pub mod store;
pub mod subscriptions;
pub mod types;
pub mod validate;
pub mod versions;
pub mod wal;

// Re-exports
pub use engine::{Engine, Savepoint};
pub use error::{Result, StoreError};
pub use merge::{
    ConflictCandidate, ConflictDetector, DetectedConflict, DetectorRegistry, MergeOutcome,
    PluginError, DIVERGING_ENTITY_KEY,
};
pub use store::{Store, StoreConfig, Transaction, TransactionSavepoint};
pub use subscriptions::{
    DropReason, StoreEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId, VersionSummary,
};
pub use types::*;
pub use validate::{ForeignKey, ForeignKeyTarget, SchemaDefinition};
pub use versions::GLOBAL_VERSION_NAME;
