//! Version registry implementation.

use crate::types::{
    ChangeId, CommitId, Version, VersionDescriptor, VersionId, VersionTip, WorkingCommit,
};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Name of the base version every other version ultimately inherits from.
pub const GLOBAL_VERSION_NAME: &str = "global";

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "dusty", "eager", "fuzzy", "gentle", "hollow", "icy", "jolly",
    "keen", "lucky", "misty", "noble", "odd", "proud", "quiet", "rapid", "shy", "tidy",
    "upbeat", "vivid", "witty", "young", "zesty",
];

const NOUNS: &[&str] = &[
    "otter", "falcon", "maple", "harbor", "comet", "willow", "badger", "canyon", "ember",
    "glacier", "heron", "island", "juniper", "lantern", "meadow", "nebula", "orchard",
    "pebble", "quartz", "river", "summit", "thicket", "valley", "walrus", "yarrow",
];

/// Versions keyed by id, with name lookup and staging areas.
#[derive(Default)]
pub struct VersionRegistry {
    /// Version descriptors by id.
    descriptors: BTreeMap<VersionId, VersionDescriptor>,

    /// Current tip per version.
    tips: HashMap<VersionId, VersionTip>,

    /// Latest record of every working commit, by working commit id.
    working: HashMap<CommitId, WorkingCommit>,

    /// Working commit id to the version whose tip names it.
    working_owners: HashMap<CommitId, VersionId>,

    /// Version name to id.
    names: HashMap<String, VersionId>,

    /// The base version (no `inherits_from_version_id`).
    global: Option<VersionId>,

    /// Versions whose history failed an integrity check, with the reason.
    quarantined: HashMap<VersionId, String>,
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a version descriptor. Returns the previous descriptor.
    pub fn apply_descriptor(&mut self, descriptor: VersionDescriptor) -> Option<VersionDescriptor> {
        let previous = self.descriptors.insert(descriptor.id, descriptor.clone());

        if let Some(old) = &previous {
            if old.name != descriptor.name {
                self.names.remove(&old.name);
            }
        }
        self.names.insert(descriptor.name.clone(), descriptor.id);

        if descriptor.inherits_from_version_id.is_none() && self.global.is_none() {
            self.global = Some(descriptor.id);
        }

        previous
    }

    /// Remove a version and its pointer rows. Returns the removed descriptor.
    pub fn remove(&mut self, id: VersionId) -> Option<VersionDescriptor> {
        let descriptor = self.descriptors.remove(&id)?;
        self.names.remove(&descriptor.name);
        if let Some(tip) = self.tips.remove(&id) {
            self.working.remove(&tip.working_commit_id);
            self.working_owners.remove(&tip.working_commit_id);
        }
        self.quarantined.remove(&id);
        if self.global == Some(id) {
            self.global = None;
        }
        Some(descriptor)
    }

    /// Move a version's tip. Returns the previous tip.
    pub fn apply_tip(&mut self, tip: VersionTip) -> Option<VersionTip> {
        let previous = self.tips.insert(tip.id, tip.clone());
        if let Some(old) = &previous {
            if old.working_commit_id != tip.working_commit_id
                && self.working_owners.get(&old.working_commit_id) == Some(&tip.id)
            {
                self.working_owners.remove(&old.working_commit_id);
            }
        }
        self.working_owners.insert(tip.working_commit_id, tip.id);
        previous
    }

    /// Record the latest content of a working commit.
    pub fn apply_working(&mut self, working: WorkingCommit) -> Option<WorkingCommit> {
        self.working.insert(working.id, working)
    }

    pub fn descriptor(&self, id: VersionId) -> Option<&VersionDescriptor> {
        self.descriptors.get(&id)
    }

    pub fn tip(&self, id: VersionId) -> Option<&VersionTip> {
        self.tips.get(&id)
    }

    pub fn working(&self, id: CommitId) -> Option<&WorkingCommit> {
        self.working.get(&id)
    }

    /// Version owning a working commit.
    pub fn owner_of_working(&self, working_commit_id: CommitId) -> Option<VersionId> {
        self.working_owners.get(&working_commit_id).copied()
    }

    /// Full view of a version. `None` until both descriptor and tip exist.
    pub fn get(&self, id: VersionId) -> Option<Version> {
        let descriptor = self.descriptors.get(&id)?;
        let tip = self.tips.get(&id)?;
        Some(Version {
            id,
            name: descriptor.name.clone(),
            commit_id: tip.commit_id,
            working_commit_id: tip.working_commit_id,
            inherits_from_version_id: descriptor.inherits_from_version_id,
            hidden: descriptor.hidden,
            fork_commit_id: descriptor.fork_commit_id,
        })
    }

    pub fn by_name(&self, name: &str) -> Option<Version> {
        self.names.get(name).and_then(|id| self.get(*id))
    }

    pub fn id_by_name(&self, name: &str) -> Option<VersionId> {
        self.names.get(name).copied()
    }

    pub fn contains(&self, id: VersionId) -> bool {
        self.descriptors.contains_key(&id)
    }

    /// All versions, ordered by id.
    pub fn list(&self) -> Vec<Version> {
        self.descriptors
            .keys()
            .filter_map(|id| self.get(*id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn global(&self) -> Option<VersionId> {
        self.global
    }

    /// The version followed by the versions it inherits from, nearest first.
    ///
    /// Stops at a missing version or at the first repeated id.
    pub fn ancestry(&self, id: VersionId) -> Vec<VersionId> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(id);

        while let Some(version_id) = current {
            let Some(descriptor) = self.descriptors.get(&version_id) else {
                break;
            };
            if !seen.insert(version_id) {
                break;
            }
            chain.push(version_id);
            current = descriptor.inherits_from_version_id;
        }

        chain
    }

    /// Versions inheriting directly from `id`.
    pub fn children_of(&self, id: VersionId) -> Vec<VersionId> {
        self.descriptors
            .values()
            .filter(|d| d.inherits_from_version_id == Some(id))
            .map(|d| d.id)
            .collect()
    }

    /// The working commit of a version when it still applies on top of the tip.
    pub fn active_working(&self, id: VersionId) -> Option<&WorkingCommit> {
        let tip = self.tips.get(&id)?;
        let working = self.working.get(&tip.working_commit_id)?;
        (working.base_commit_id == tip.commit_id).then_some(working)
    }

    /// Staged change ids of a version that apply on top of its tip.
    pub fn active_staged(&self, id: VersionId) -> &[ChangeId] {
        self.active_working(id)
            .map(|working| working.meta_change_ids.as_slice())
            .unwrap_or(&[])
    }

    /// Mark a version as unusable after an integrity failure.
    pub fn quarantine(&mut self, id: VersionId, reason: impl Into<String>) {
        self.quarantined.insert(id, reason.into());
    }

    pub fn quarantine_reason(&self, id: VersionId) -> Option<&str> {
        self.quarantined.get(&id).map(String::as_str)
    }

    pub fn quarantined(&self) -> Vec<VersionId> {
        let mut ids: Vec<VersionId> = self.quarantined.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Human-readable name not used by any version, derived from `seed`.
    pub fn generate_name(&self, seed: u64) -> String {
        let adjective = ADJECTIVES[(seed as usize) % ADJECTIVES.len()];
        let noun = NOUNS[((seed as usize) / ADJECTIVES.len()) % NOUNS.len()];
        let base = format!("{}-{}", adjective, noun);

        if !self.names.contains_key(&base) {
            return base;
        }

        let mut suffix = 2u64;
        loop {
            let candidate = format!("{}-{}", base, suffix);
            if !self.names.contains_key(&candidate) {
                return candidate;
            }
            suffix += 1;
        }
    }
}
