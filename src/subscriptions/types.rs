//! Subscription types.

use crate::types::{CommitId, Version, VersionId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before the subscriber is dropped.
    /// Default: 1000
    pub buffer_size: usize,

    pub filter: SubscriptionFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: SubscriptionFilter::all(),
        }
    }
}

/// Which events a subscriber receives.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    /// Only events touching these versions (None = every version).
    pub versions: Option<Vec<VersionId>>,

    pub include_commits: bool,

    pub include_merges: bool,

    /// Version created and deleted events.
    pub include_version_events: bool,
}

impl SubscriptionFilter {
    pub fn commits() -> Self {
        Self {
            include_commits: true,
            ..Default::default()
        }
    }

    pub fn merges() -> Self {
        Self {
            include_merges: true,
            ..Default::default()
        }
    }

    pub fn version_events() -> Self {
        Self {
            include_version_events: true,
            ..Default::default()
        }
    }

    pub fn all() -> Self {
        Self {
            versions: None,
            include_commits: true,
            include_merges: true,
            include_version_events: true,
        }
    }

    /// Restrict an existing filter to the given versions.
    pub fn for_versions(mut self, versions: Vec<VersionId>) -> Self {
        self.versions = Some(versions);
        self
    }

    pub(crate) fn matches_version(&self, version_id: VersionId) -> bool {
        self.versions
            .as_ref()
            .map_or(true, |versions| versions.contains(&version_id))
    }
}

/// Events emitted after a transaction has been persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// A transaction committed pending changes or staged elements.
    Committed {
        /// New tip per touched version.
        commits: Vec<(VersionId, CommitId)>,
        /// Domain changes the transaction wrote.
        change_count: usize,
    },

    Merged {
        source: VersionId,
        target: VersionId,
        fast_forwarded: usize,
        held_back: usize,
        new_conflicts: usize,
    },

    VersionCreated {
        version: VersionSummary,
    },

    VersionDeleted {
        id: VersionId,
        name: String,
    },

    /// The subscription ended; no further events follow.
    Dropped {
        reason: DropReason,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub id: VersionId,
    pub name: String,
    pub commit_id: CommitId,
    pub inherits_from_version_id: Option<VersionId>,
    pub hidden: bool,
}

impl From<&Version> for VersionSummary {
    fn from(version: &Version) -> Self {
        Self {
            id: version.id,
            name: version.name.clone(),
            commit_id: version.commit_id,
            inherits_from_version_id: version.inherits_from_version_id,
            hidden: version.hidden,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub receiver: crossbeam_channel::Receiver<StoreEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<StoreEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<StoreEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<StoreEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
