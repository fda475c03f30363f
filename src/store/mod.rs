// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document store capability.
//!
//! [`DocumentStore`] is the seam between the replication engine and the
//! stores it moves documents between. The engine only ever talks to this
//! trait, so the same run loop replicates local-to-remote, remote-to-local,
//! or between two local stores in tests.
//!
//! Implementations:
//! - [`LocalStore`](local::LocalStore): SQLite-backed store with revision
//!   trees and a change log
//! - [`HttpStore`](crate::transport::HttpStore): a remote store reached over HTTP
//!
//! # Example
//!
//! ```rust,no_run
//! use revsync::store::{DocumentStore, local::LocalStore};
//! use revsync::Document;
//! use serde_json::json;
//!
//! # async fn example() -> revsync::Result<()> {
//! let store = LocalStore::open_in_memory("scratch").await?;
//! let put = store.put(Document::from_json("teams/alpha", json!({"name": "Alpha"}))).await?;
//! let doc = store.get("teams/alpha").await?;
//! assert_eq!(doc.rev, Some(put.rev));
//! # Ok(())
//! # }
//! ```

pub mod local;
pub(crate) mod sqlite;

use crate::document::Document;
use crate::error::{ReplicationError, Result};
use crate::revision::Revision;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

pub use local::LocalStore;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Map of document id to revisions, used by `revs_diff` in both directions.
pub type RevsDiff = BTreeMap<String, Vec<Revision>>;

/// Store identity and position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub name: String,
    /// Identifies one incarnation of the store's database.
    ///
    /// Regenerated when the store is destroyed and recreated, so checkpoints
    /// recorded against the old incarnation no longer apply.
    pub instance_id: String,
    /// Highest sequence number in the change log.
    pub update_seq: u64,
    /// Documents whose winning revision is not a tombstone.
    pub doc_count: u64,
}

/// One entry of the change log: the newest change of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub seq: u64,
    pub id: String,
    /// Winning revision after the change.
    pub rev: Revision,
    #[serde(default)]
    pub deleted: bool,
    /// All open leaves, including conflicting branches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revs: Vec<Revision>,
}

impl Change {
    /// Leaves a replicator should offer to the target.
    pub fn open_revs(&self) -> Vec<Revision> {
        if self.revs.is_empty() {
            vec![self.rev.clone()]
        } else {
            self.revs.clone()
        }
    }
}

/// A page of the change log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesPage {
    pub results: Vec<Change>,
    /// Sequence of the last result, or the requested `since` when empty.
    pub last_seq: u64,
}

/// Result of a single-document edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResult {
    pub ok: bool,
    pub id: String,
    pub rev: Revision,
}

/// Per-document outcome of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocWriteResult {
    pub id: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DocWriteResult {
    pub fn success(id: impl Into<String>, rev: Revision) -> Self {
        Self {
            id: id.into(),
            ok: true,
            rev: Some(rev),
            error: None,
            reason: None,
        }
    }

    pub fn failure(id: impl Into<String>, err: &ReplicationError) -> Self {
        Self {
            id: id.into(),
            ok: false,
            rev: None,
            error: Some(err.kind().to_string()),
            reason: Some(err.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok && self.error.is_none()
    }
}

/// Row of an `all_docs` lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllDocsRow {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AllDocsRow {
    pub fn found(doc: Document) -> Option<Self> {
        let rev = doc.rev.clone()?;
        Some(Self {
            key: doc.id.clone(),
            id: Some(doc.id.clone()),
            rev: Some(rev),
            doc: Some(doc),
            error: None,
        })
    }

    pub fn missing(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            id: None,
            rev: None,
            doc: None,
            error: Some("not_found".to_string()),
        }
    }
}

/// Capability set the replication engine needs from a store.
///
/// All methods are object safe so engines hold `Arc<dyn DocumentStore>`.
pub trait DocumentStore: Send + Sync + 'static {
    /// Store name, instance id and current sequence.
    fn info(&self) -> BoxFuture<'_, StoreInfo>;

    /// Winning revision of a document.
    ///
    /// Returns `NotFound` when the id is unknown or the winner is a tombstone.
    fn get(&self, id: &str) -> BoxFuture<'_, Document>;

    /// A specific revision with its `_revisions` ancestry.
    fn fetch_revision(&self, id: &str, rev: &Revision) -> BoxFuture<'_, Document>;

    /// Apply an edit. `doc.rev` names the parent revision.
    fn put(&self, doc: Document) -> BoxFuture<'_, PutResult>;

    /// Apply several documents with per-document outcomes.
    ///
    /// With `new_edits = false` each document is a replicated revision
    /// carrying its own `_rev` and `_revisions`, merged into the tree as is.
    fn bulk_put(&self, docs: Vec<Document>, new_edits: bool) -> BoxFuture<'_, Vec<DocWriteResult>>;

    /// Newest change per document with `seq > since`, ascending, at most `limit`.
    fn changes_since(&self, since: u64, limit: usize) -> BoxFuture<'_, ChangesPage>;

    /// Of the given revisions, those this store does not have.
    fn revs_diff(&self, revs: RevsDiff) -> BoxFuture<'_, RevsDiff>;

    /// Winners for the given ids, `not_found` rows for the rest.
    fn all_docs(&self, keys: Vec<String>) -> BoxFuture<'_, Vec<AllDocsRow>>;

    /// Write a tombstone on top of `rev`.
    fn delete(&self, id: &str, rev: Revision) -> BoxFuture<'_, PutResult> {
        self.put(Document::tombstone(id, rev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_open_revs_falls_back_to_rev() {
        let change = Change {
            seq: 4,
            id: "d".to_string(),
            rev: "2-b".parse().unwrap(),
            deleted: false,
            revs: vec![],
        };
        assert_eq!(change.open_revs(), vec!["2-b".parse::<Revision>().unwrap()]);
    }

    #[test]
    fn test_change_wire_format() {
        let change: Change = serde_json::from_value(json!({
            "seq": 7, "id": "teams/a", "rev": "3-c", "revs": ["2-x", "3-c"]
        }))
        .unwrap();
        assert!(!change.deleted);
        assert_eq!(change.open_revs().len(), 2);
    }

    #[test]
    fn test_doc_write_result_wire_format() {
        let ok = DocWriteResult::success("a", "1-x".parse().unwrap());
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"id": "a", "ok": true, "rev": "1-x"})
        );
        assert!(ok.is_ok());

        let err = DocWriteResult::failure("b", &ReplicationError::InvalidDocument("bad".to_string()));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["error"], "bad_request");
        assert!(value.get("ok").is_none());
        assert!(!err.is_ok());
    }

    #[test]
    fn test_all_docs_rows() {
        let doc = Document::from_json("a", json!({"n": 1})).with_rev("1-x".parse().unwrap());
        let row = AllDocsRow::found(doc).unwrap();
        assert_eq!(row.key, "a");
        assert_eq!(row.rev, Some("1-x".parse().unwrap()));

        assert!(AllDocsRow::found(Document::from_json("b", json!({}))).is_none());
        assert_eq!(AllDocsRow::missing("c").error.as_deref(), Some("not_found"));
    }
}
