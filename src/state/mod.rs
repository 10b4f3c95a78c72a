//! State materialization.
//!
//! The materialized cache holds the native rows of every version. Reads
//! combine it with the untracked overlay, the open transaction's pending
//! changes and the inheritance chain. Commit edges, change-set elements and
//! author links are derived here as well.

mod bookkeeping;
mod materializer;
mod reader;
mod rows;
mod untracked;

pub use bookkeeping::Bookkeeping;
pub use materializer::Materializer;
pub use reader::StateReader;
pub use rows::RowTable;
pub use untracked::UntrackedOverlay;
