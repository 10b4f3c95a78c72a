//! Content-addressed snapshot storage.
//!
//! Snapshots are stored by the SHA-256 of their canonical JSON, sharded
//! into directories by the first byte of the hash. Identical content is
//! stored once; deletions point at the reserved no-content id.

mod storage;

pub use storage::SnapshotStore;
