//! Error types for the change store.

use crate::types::{ChangeId, SnapshotId};
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // --- Constraint violations (rejected mutations) ---
    #[error("Primary key violation on {schema_key} entity '{entity_id}' ({properties:?})")]
    PrimaryKeyViolation {
        schema_key: String,
        entity_id: String,
        properties: Vec<String>,
    },

    #[error("Unique constraint violation on {schema_key} entity '{entity_id}' ({properties:?} already used by '{existing_entity_id}')")]
    UniqueViolation {
        schema_key: String,
        entity_id: String,
        properties: Vec<String>,
        existing_entity_id: String,
    },

    #[error("Foreign key violation on {schema_key} entity '{entity_id}': {properties:?} references no live {referenced_schema_key}")]
    ForeignKeyViolation {
        schema_key: String,
        entity_id: String,
        properties: Vec<String>,
        referenced_schema_key: String,
    },

    // --- Graph integrity (corruption, never retried) ---
    #[error("Graph integrity error: {0}")]
    GraphIntegrity(String),

    // --- Merge ---
    #[error("Merge precondition failed: {0}")]
    MergePrecondition(String),

    #[error("Conflict detector '{plugin}' failed: {message}")]
    PluginFailure { plugin: String, message: String },

    // --- Lookups ---
    #[error("Version not found: {0}")]
    VersionNotFound(String),

    #[error("Version already exists: {0}")]
    VersionExists(String),

    #[error("Change not found: {0}")]
    ChangeNotFound(ChangeId),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(SnapshotId),

    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    // --- Storage ---
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Hash mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: SnapshotId, got: SnapshotId },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Subscription dropped")]
    SubscriptionDropped,
}

impl StoreError {
    /// Whether the error is one of the three constraint violations.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            StoreError::PrimaryKeyViolation { .. }
                | StoreError::UniqueViolation { .. }
                | StoreError::ForeignKeyViolation { .. }
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
