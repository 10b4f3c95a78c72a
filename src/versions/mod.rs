//! Version (branch) registry.
//!
//! Versions are named, mutable pointers into the change graph. The registry
//! is a fold over version descriptor, tip and working-commit rows.

mod registry;

pub use registry::{VersionRegistry, GLOBAL_VERSION_NAME};
