//! In-process subscriptions to store events.
//!
//! Events are broadcast after a transaction has been persisted: commits,
//! merges and version lifecycle changes. Each subscriber gets a bounded
//! buffer; a subscriber that falls behind is dropped and receives a final
//! `Dropped` event when there is room for it.
//!
//! # Example
//!
//! ```ignore
//! let handle = store.subscribe(SubscriptionConfig {
//!     filter: SubscriptionFilter::commits().for_versions(vec![version_id]),
//!     ..Default::default()
//! });
//!
//! while let Ok(event) = handle.recv() {
//!     match event {
//!         StoreEvent::Committed { commits, .. } => println!("new tips: {:?}", commits),
//!         StoreEvent::Dropped { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    DropReason, StoreEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId, VersionSummary,
};
