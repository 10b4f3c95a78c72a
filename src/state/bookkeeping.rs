//! Bookkeeping derived from commit records.
//!
//! Change-set elements, change authors and change-to-commit links are
//! never written to the log; they are expanded from commit records here.

use crate::types::{AccountId, ChangeId, ChangeSetId, CommitId, CommitRecord};
use std::collections::{BTreeSet, HashMap};

#[derive(Default)]
pub struct Bookkeeping {
    /// Member change ids per change set.
    change_set_elements: HashMap<ChangeSetId, Vec<ChangeId>>,

    /// Commits listing a change, in log order.
    commits_of_change: HashMap<ChangeId, Vec<CommitId>>,

    /// Authors of the commits that include a change.
    change_authors: HashMap<ChangeId, BTreeSet<AccountId>>,
}

impl Bookkeeping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expand a commit record into derived rows.
    pub fn record_commit(&mut self, record: &CommitRecord) {
        self.change_set_elements
            .insert(record.change_set_id, record.meta_change_ids.clone());

        for change_id in &record.meta_change_ids {
            self.commits_of_change
                .entry(*change_id)
                .or_default()
                .push(record.id);
            self.change_authors
                .entry(*change_id)
                .or_default()
                .extend(record.author_account_ids.iter().cloned());
        }
    }

    pub fn change_set_elements(&self, change_set_id: ChangeSetId) -> &[ChangeId] {
        self.change_set_elements
            .get(&change_set_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn commits_of_change(&self, change_id: ChangeId) -> &[CommitId] {
        self.commits_of_change
            .get(&change_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn change_authors(&self, change_id: ChangeId) -> Vec<AccountId> {
        self.change_authors
            .get(&change_id)
            .map(|authors| authors.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.change_set_elements.clear();
        self.commits_of_change.clear();
        self.change_authors.clear();
    }
}
