//! Change graph: commits and their parent/child edges.
//!
//! Commits form a DAG through `parent_commit_ids`. Every walk here is
//! iterative so deep histories never grow the call stack.

use crate::error::{Result, StoreError};
use crate::types::{ChangeId, CommitId, CommitRecord, Timestamp};
use std::collections::{HashMap, HashSet, VecDeque};

/// A commit known to the graph.
#[derive(Clone, Debug)]
pub struct CommitNode {
    pub record: CommitRecord,
    /// Change row that carried the commit.
    pub change_id: ChangeId,
    pub created_at: Timestamp,
}

/// Parent/child edges between commits.
#[derive(Default)]
pub struct ChangeGraph {
    commits: HashMap<CommitId, CommitNode>,
    children: HashMap<CommitId, Vec<CommitId>>,
}

impl ChangeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a commit. Every parent must already be present.
    pub fn insert(&mut self, node: CommitNode) -> Result<()> {
        let id = node.record.id;
        if self.commits.contains_key(&id) {
            return Err(StoreError::GraphIntegrity(format!(
                "commit {} recorded twice",
                id
            )));
        }

        for parent in &node.record.parent_commit_ids {
            if !self.commits.contains_key(parent) {
                return Err(StoreError::GraphIntegrity(format!(
                    "commit {} references missing parent {}",
                    id, parent
                )));
            }
        }

        for parent in &node.record.parent_commit_ids {
            self.children.entry(*parent).or_default().push(id);
        }
        self.commits.insert(id, node);

        Ok(())
    }

    pub fn get(&self, id: CommitId) -> Option<&CommitNode> {
        self.commits.get(&id)
    }

    pub fn contains(&self, id: CommitId) -> bool {
        self.commits.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Every commit, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &CommitNode> {
        self.commits.values()
    }

    pub fn parents(&self, id: CommitId) -> &[CommitId] {
        self.commits
            .get(&id)
            .map(|node| node.record.parent_commit_ids.as_slice())
            .unwrap_or(&[])
    }

    pub fn children(&self, id: CommitId) -> &[CommitId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every `(parent, child)` edge, sorted.
    pub fn edges(&self) -> Vec<(CommitId, CommitId)> {
        let mut edges: Vec<(CommitId, CommitId)> = self
            .commits
            .values()
            .flat_map(|node| {
                node.record
                    .parent_commit_ids
                    .iter()
                    .map(move |parent| (*parent, node.record.id))
            })
            .collect();
        edges.sort();
        edges
    }

    /// Commits reachable from `tip`, including `tip` itself.
    pub fn ancestors(&self, tip: CommitId) -> HashSet<CommitId> {
        let mut seen = HashSet::new();
        let mut stack = vec![tip];

        while let Some(id) = stack.pop() {
            if !self.commits.contains_key(&id) || !seen.insert(id) {
                continue;
            }
            stack.extend(self.parents(id).iter().copied());
        }

        seen
    }

    /// Breadth-first walk from `tip` returning each commit with its minimum
    /// distance from the tip. Commits in `stop` (and anything only reachable
    /// through them) are skipped.
    pub fn depths(&self, tip: CommitId, stop: &HashSet<CommitId>) -> Vec<(CommitId, usize)> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back((tip, 0usize));

        while let Some((id, depth)) = queue.pop_front() {
            if stop.contains(&id) || !self.commits.contains_key(&id) || !seen.insert(id) {
                continue;
            }
            order.push((id, depth));
            for parent in self.parents(id) {
                queue.push_back((*parent, depth + 1));
            }
        }

        order
    }

    /// Whether `ancestor` is reachable from `descendant` (a commit is its own ancestor).
    pub fn is_ancestor(&self, ancestor: CommitId, descendant: CommitId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![descendant];

        while let Some(id) = stack.pop() {
            if id == ancestor {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            stack.extend(self.parents(id).iter().copied());
        }

        false
    }

    /// Best common ancestors of two commits: common ancestors that are not
    /// ancestors of another common ancestor. Sorted by id.
    pub fn merge_bases(&self, a: CommitId, b: CommitId) -> Vec<CommitId> {
        let from_a = self.ancestors(a);
        let from_b = self.ancestors(b);
        let common: HashSet<CommitId> = from_a.intersection(&from_b).copied().collect();

        let mut bases: Vec<CommitId> = common
            .iter()
            .copied()
            .filter(|candidate| {
                !common.iter().any(|other| {
                    other != candidate && self.parents(*other).iter().any(|p| {
                        *p == *candidate || self.is_ancestor(*candidate, *p)
                    })
                })
            })
            .collect();
        bases.sort();
        bases
    }

    /// Member change ids of every commit reachable from `tip`, minus those
    /// only reachable through `stop`.
    pub fn change_ids_reachable(
        &self,
        tip: CommitId,
        stop: &HashSet<CommitId>,
    ) -> HashSet<ChangeId> {
        let mut ids = HashSet::new();
        for (commit_id, _) in self.depths(tip, stop) {
            if let Some(node) = self.commits.get(&commit_id) {
                ids.extend(node.record.meta_change_ids.iter().copied());
            }
        }
        ids
    }
}
