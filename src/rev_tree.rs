// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Revision tree for a single document.
//!
//! Every revision a store has seen for a document id lives in one forest,
//! kept as flat parent-index arrays:
//!
//! ```text
//! nodes:   [1-a]  [2-b]  [3-c]  [2-x]
//! parent:   -      0      1      0
//!
//!          1-a ─┬─ 2-b ── 3-c     leaves: 3-c, 2-x
//!               └─ 2-x            winner: 3-c
//! ```
//!
//! # Invariants
//!
//! - A revision appears at most once per document, so no two siblings share
//!   (generation, hash).
//! - A child's generation is its parent's generation + 1.
//! - The winner is the greatest leaf under [`Revision`] ordering (highest
//!   generation, then greatest hash). Uniqueness makes this a total order.
//!
//! Ancestors learned only through a replicated history have no body.

use crate::document::Fields;
use crate::error::{ReplicationError, Result};
use crate::revision::Revision;
use std::collections::HashMap;

/// One revision in the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RevNode {
    pub rev: Revision,
    pub parent: Option<usize>,
    pub deleted: bool,
    pub body: Option<Fields>,
}

/// A revision row as persisted by a store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRevision {
    pub rev: Revision,
    pub parent: Option<Revision>,
    pub deleted: bool,
    pub body: Option<Fields>,
}

/// What a merge changed, so callers persist only those nodes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Indices of nodes inserted or updated by the merge.
    pub changed: Vec<usize>,
    /// Whether the path's leaf was new to this tree.
    pub added_leaf: bool,
}

impl MergeOutcome {
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty()
    }
}

/// Revision forest for one document id.
#[derive(Debug, Clone, Default)]
pub struct RevTree {
    doc_id: String,
    nodes: Vec<RevNode>,
    index: HashMap<Revision, usize>,
}

impl RevTree {
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Rebuild a tree from persisted rows.
    ///
    /// Rows may arrive in any order. A row naming a parent that is not
    /// present, or breaking generation continuity, is store corruption.
    pub fn from_rows(doc_id: impl Into<String>, mut rows: Vec<StoredRevision>) -> Result<Self> {
        let mut tree = Self::new(doc_id);
        rows.sort_by(|a, b| a.rev.cmp(&b.rev));

        for row in rows {
            if tree.index.contains_key(&row.rev) {
                return Err(ReplicationError::corruption(
                    &tree.doc_id,
                    format!("duplicate revision {}", row.rev),
                ));
            }
            let parent = match &row.parent {
                None => None,
                Some(parent_rev) => {
                    let idx = tree.find(parent_rev).ok_or_else(|| {
                        ReplicationError::corruption(
                            &tree.doc_id,
                            format!("revision {} has dangling parent {}", row.rev, parent_rev),
                        )
                    })?;
                    if !row.rev.is_child_generation_of(parent_rev) {
                        return Err(ReplicationError::corruption(
                            &tree.doc_id,
                            format!("generation gap between {} and {}", parent_rev, row.rev),
                        ));
                    }
                    Some(idx)
                }
            };
            tree.push(RevNode {
                rev: row.rev,
                parent,
                deleted: row.deleted,
                body: row.body,
            });
        }

        Ok(tree)
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &RevNode {
        &self.nodes[idx]
    }

    pub fn find(&self, rev: &Revision) -> Option<usize> {
        self.index.get(rev).copied()
    }

    pub fn contains(&self, rev: &Revision) -> bool {
        self.index.contains_key(rev)
    }

    pub fn get(&self, rev: &Revision) -> Option<&RevNode> {
        self.find(rev).map(|idx| &self.nodes[idx])
    }

    /// Merge a leaf-first path of revisions into the tree.
    ///
    /// Known revisions are reused; the rest are attached below the last
    /// known ancestor. Only the leaf carries `body` and `deleted`. A known
    /// revision recorded under a different parent is store corruption; a
    /// known root gains the parent the path names (its history was
    /// truncated when it was first stored).
    pub fn merge_path(&mut self, path: &[Revision], deleted: bool, body: Fields) -> Result<MergeOutcome> {
        if path.is_empty() {
            return Err(ReplicationError::InvalidDocument(format!(
                "{}: empty revision path",
                self.doc_id
            )));
        }
        if let Some(pair) = path.windows(2).find(|w| !w[0].is_child_generation_of(&w[1])) {
            return Err(ReplicationError::InvalidDocument(format!(
                "{}: revision path jumps from {} to {}",
                self.doc_id, pair[1], pair[0]
            )));
        }

        let mut outcome = MergeOutcome::default();
        let mut body = Some(body);
        let mut parent: Option<usize> = None;
        let last = path.len() - 1;

        for (i, rev) in path.iter().rev().enumerate() {
            let is_leaf = i == last;

            let idx = match self.find(rev) {
                Some(idx) => {
                    if let Some(expected) = parent {
                        match self.nodes[idx].parent {
                            Some(actual) if actual != expected => {
                                return Err(ReplicationError::corruption(
                                    &self.doc_id,
                                    format!(
                                        "{} is recorded under {}, incoming history puts it under {}",
                                        rev, self.nodes[actual].rev, self.nodes[expected].rev
                                    ),
                                ));
                            }
                            None => {
                                self.nodes[idx].parent = Some(expected);
                                outcome.changed.push(idx);
                            }
                            Some(_) => {}
                        }
                    }
                    if is_leaf && self.nodes[idx].body.is_none() {
                        self.nodes[idx].body = body.take();
                        self.nodes[idx].deleted = deleted;
                        if !outcome.changed.contains(&idx) {
                            outcome.changed.push(idx);
                        }
                    }
                    idx
                }
                None => {
                    let idx = self.push(RevNode {
                        rev: rev.clone(),
                        parent,
                        deleted: is_leaf && deleted,
                        body: if is_leaf { body.take() } else { None },
                    });
                    outcome.changed.push(idx);
                    outcome.added_leaf |= is_leaf;
                    idx
                }
            };
            parent = Some(idx);
        }

        Ok(outcome)
    }

    /// Indices of nodes without children.
    pub fn leaf_indices(&self) -> Vec<usize> {
        let mut has_child = vec![false; self.nodes.len()];
        for node in &self.nodes {
            if let Some(p) = node.parent {
                has_child[p] = true;
            }
        }
        (0..self.nodes.len()).filter(|&i| !has_child[i]).collect()
    }

    /// All open leaves, in revision order.
    pub fn leaves(&self) -> Vec<&RevNode> {
        let mut leaves: Vec<&RevNode> = self.leaf_indices().into_iter().map(|i| &self.nodes[i]).collect();
        leaves.sort_by(|a, b| a.rev.cmp(&b.rev));
        leaves
    }

    pub fn leaf_revs(&self) -> Vec<Revision> {
        self.leaves().into_iter().map(|n| n.rev.clone()).collect()
    }

    pub fn is_leaf(&self, rev: &Revision) -> bool {
        match self.find(rev) {
            Some(idx) => !self.nodes.iter().any(|n| n.parent == Some(idx)),
            None => false,
        }
    }

    /// The winning leaf: highest generation, then greatest hash.
    pub fn winner(&self) -> Option<&RevNode> {
        self.leaves().into_iter().max_by(|a, b| a.rev.cmp(&b.rev))
    }

    /// Live leaves that lost to the winner.
    pub fn conflicts(&self) -> Vec<Revision> {
        let winner = self.winner().map(|w| w.rev.clone());
        self.leaves()
            .into_iter()
            .filter(|n| !n.deleted && Some(&n.rev) != winner.as_ref())
            .map(|n| n.rev.clone())
            .collect()
    }

    /// Leaf-first path from `rev` to its root.
    pub fn ancestry(&self, rev: &Revision) -> Option<Vec<Revision>> {
        let mut idx = self.find(rev)?;
        let mut path = vec![self.nodes[idx].rev.clone()];
        while let Some(parent) = self.nodes[idx].parent {
            path.push(self.nodes[parent].rev.clone());
            idx = parent;
        }
        Some(path)
    }

    /// Row form of a node, for persistence.
    pub fn stored(&self, idx: usize) -> StoredRevision {
        let node = &self.nodes[idx];
        StoredRevision {
            rev: node.rev.clone(),
            parent: node.parent.map(|p| self.nodes[p].rev.clone()),
            deleted: node.deleted,
            body: node.body.clone(),
        }
    }

    fn push(&mut self, node: RevNode) -> usize {
        let idx = self.nodes.len();
        self.index.insert(node.rev.clone(), idx);
        self.nodes.push(node);
        idx
    }
}
