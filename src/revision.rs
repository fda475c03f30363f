// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Revision identifiers.
//!
//! A revision is written `"<generation>-<hash>"`, e.g. `"3-ab12"`. The
//! generation counts edits from the root of the document's history; the hash
//! distinguishes sibling edits of the same generation.
//!
//! # Ordering
//!
//! Revisions order by generation first, then by hash compared as a string.
//! The winning leaf of a revision tree is the maximum under this order, so
//! every store picks the same winner from the same set of leaves.
//!
//! # Deterministic hashes
//!
//! [`Revision::compute`] derives the hash from the parent revision, the
//! tombstone flag and the canonical JSON of the fields. Two stores applying
//! the same edit to the same parent produce the same revision, which lets
//! identical edits converge instead of appearing as conflicts.

use crate::document::Fields;
use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Hex characters kept from the SHA-256 digest.
const HASH_LEN: usize = 32;

/// A single revision of a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision {
    // Field order matters: derived Ord compares generation first.
    pub generation: u64,
    pub hash: String,
}

impl Revision {
    pub fn new(generation: u64, hash: impl Into<String>) -> Self {
        Self {
            generation,
            hash: hash.into(),
        }
    }

    /// Compute the revision produced by editing `parent` into `fields`.
    pub fn compute(parent: Option<&Revision>, fields: &Fields, deleted: bool) -> Result<Self> {
        let body = serde_json::to_vec(fields)
            .map_err(|e| ReplicationError::InvalidDocument(format!("unserializable fields: {}", e)))?;

        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([0u8]);
        hasher.update([deleted as u8]);
        hasher.update(&body);
        let digest = hex::encode(hasher.finalize());

        Ok(Self {
            generation: parent.map_or(1, |p| p.generation + 1),
            hash: digest[..HASH_LEN].to_string(),
        })
    }

    /// Whether this revision's generation directly follows `parent`'s.
    pub fn is_child_generation_of(&self, parent: &Revision) -> bool {
        self.generation == parent.generation + 1
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for Revision {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        let (generation, hash) = s
            .split_once('-')
            .ok_or_else(|| ReplicationError::InvalidDocument(format!("invalid revision {:?}", s)))?;

        let generation: u64 = generation
            .parse()
            .map_err(|_| ReplicationError::InvalidDocument(format!("invalid revision generation {:?}", s)))?;
        if generation == 0 {
            return Err(ReplicationError::InvalidDocument(format!(
                "revision generation must be at least 1: {:?}",
                s
            )));
        }
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ReplicationError::InvalidDocument(format!("invalid revision hash {:?}", s)));
        }

        Ok(Self::new(generation, hash))
    }
}

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Ancestry of a revision as carried on the wire in `_revisions`.
///
/// `ids` holds hashes leaf first; the generation of `ids[i]` is `start - i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionHistory {
    pub start: u64,
    pub ids: Vec<String>,
}

impl RevisionHistory {
    /// Build from a leaf-first path of revisions.
    ///
    /// Returns `None` for an empty path.
    pub fn from_path(path: &[Revision]) -> Option<Self> {
        let leaf = path.first()?;
        Some(Self {
            start: leaf.generation,
            ids: path.iter().map(|r| r.hash.clone()).collect(),
        })
    }

    /// Expand into leaf-first revisions, validating generation bounds.
    pub fn to_path(&self) -> Result<Vec<Revision>> {
        if self.ids.is_empty() {
            return Err(ReplicationError::InvalidDocument("empty _revisions".to_string()));
        }
        if (self.ids.len() as u64) > self.start {
            return Err(ReplicationError::InvalidDocument(format!(
                "_revisions lists {} ids but starts at generation {}",
                self.ids.len(),
                self.start
            )));
        }

        self.ids
            .iter()
            .enumerate()
            .map(|(i, hash)| format!("{}-{}", self.start - i as u64, hash).parse())
            .collect()
    }

    /// The leaf revision this history describes.
    pub fn leaf(&self) -> Option<Revision> {
        self.ids.first().map(|h| Revision::new(self.start, h.clone()))
    }
}
