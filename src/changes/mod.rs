//! Change log implementation.
//!
//! Changes are stored in an append-only framed log on disk and mirrored
//! by an in-memory index that keeps log order and per-entity history.

mod index;
mod log;

pub use index::ChangeIndex;
pub use log::ChangeLog;
