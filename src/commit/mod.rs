//! Commit builder.
//!
//! Pending changes of a transaction are grouped per version and turned into
//! exactly two bookkeeping rows per touched version: the commit itself and
//! the version tip update.

mod builder;
mod pending;

pub use builder::{CommitBuilder, CommitPlan, PlannedRow, VersionHead};
pub use pending::PendingChanges;
