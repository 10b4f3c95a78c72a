//! Broadcasts store events to subscribers.

use crate::types::{CommitId, VersionId};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::types::{DropReason, StoreEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId};

struct Subscription {
    config: SubscriptionConfig,
    sender: Sender<StoreEvent>,
}

impl Subscription {
    /// False when the buffer is full or the receiver is gone.
    fn try_send(&self, event: StoreEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn wants(&self, event: &StoreEvent) -> bool {
        let filter = &self.config.filter;
        match event {
            StoreEvent::Committed { commits, .. } => {
                filter.include_commits
                    && commits.iter().any(|(version, _)| filter.matches_version(*version))
            }
            StoreEvent::Merged { source, target, .. } => {
                filter.include_merges
                    && (filter.matches_version(*source) || filter.matches_version(*target))
            }
            StoreEvent::VersionCreated { version } => {
                filter.include_version_events && filter.matches_version(version.id)
            }
            StoreEvent::VersionDeleted { id, .. } => {
                filter.include_version_events && filter.matches_version(*id)
            }
            StoreEvent::Dropped { .. } => false,
        }
    }
}

pub struct SubscriptionManager {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size.max(1));

        self.subscriptions
            .write()
            .insert(id, Subscription { config, sender });

        SubscriptionHandle { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(sub) = self.subscriptions.write().remove(&id) {
            let _ = sub.sender.try_send(StoreEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    // --- Broadcasting ---

    pub fn broadcast_committed(&self, commits: &[(VersionId, CommitId)], change_count: usize) {
        if commits.is_empty() {
            return;
        }
        self.broadcast(StoreEvent::Committed {
            commits: commits.to_vec(),
            change_count,
        });
    }

    /// Send to every interested subscriber and drop those that cannot keep up.
    pub fn broadcast(&self, event: StoreEvent) {
        let mut to_remove = Vec::new();

        {
            let subs = self.subscriptions.read();
            for (id, sub) in subs.iter() {
                if sub.wants(&event) && !sub.try_send(event.clone()) {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    debug!(subscription = id.0, "dropping slow subscriber");
                    let _ = sub.sender.try_send(StoreEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}
