// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Documents as they cross store and wire boundaries.
//!
//! The JSON form keeps the store-managed metadata in `_`-prefixed members
//! next to the user's fields:
//!
//! ```json
//! {
//!   "_id": "teams/alpha",
//!   "_rev": "2-9f1c...",
//!   "_revisions": {"start": 2, "ids": ["9f1c...", "41ab..."]},
//!   "name": "Alpha"
//! }
//! ```
//!
//! Fields are an opaque JSON object. `serde_json` keeps object keys sorted,
//! so a body serializes to the same bytes on every store it passes through.

use crate::error::{ReplicationError, Result};
use crate::revision::{Revision, RevisionHistory};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// User-supplied document content.
pub type Fields = serde_json::Map<String, Value>;

/// Characters allowed in a document id besides ASCII alphanumerics.
///
/// Restricting ids keeps them safe to place in URL paths without escaping.
const ID_PUNCTUATION: &[char] = &['.', '_', '~', ':', '@', '+', '/', '-'];

/// A document revision plus its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id", default)]
    pub id: String,

    /// Current revision. For an edit, this is the parent the edit applies to.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,

    #[serde(rename = "_deleted", default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,

    /// Ancestry of `rev`, present when the document was fetched for replication.
    #[serde(rename = "_revisions", default, skip_serializing_if = "Option::is_none")]
    pub revisions: Option<RevisionHistory>,

    #[serde(flatten)]
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            rev: None,
            deleted: false,
            revisions: None,
            fields,
        }
    }

    /// Build a document from a JSON object literal.
    ///
    /// Non-object values produce an empty body.
    pub fn from_json(id: impl Into<String>, value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map,
            _ => Fields::new(),
        };
        Self::new(id, fields)
    }

    /// Tombstone edit on top of `rev`.
    pub fn tombstone(id: impl Into<String>, rev: Revision) -> Self {
        Self {
            id: id.into(),
            rev: Some(rev),
            deleted: true,
            revisions: None,
            fields: Fields::new(),
        }
    }

    pub fn with_rev(mut self, rev: Revision) -> Self {
        self.rev = Some(rev);
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Validate id and fields for storage.
    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id)?;
        if let Some(key) = self.fields.keys().find(|k| k.starts_with('_')) {
            return Err(ReplicationError::InvalidDocument(format!(
                "{}: reserved field name {:?}",
                self.id, key
            )));
        }
        Ok(())
    }

    /// Leaf-first ancestry of a replicated revision.
    ///
    /// Requires `_rev`. When `_revisions` is present its leaf must be `_rev`.
    pub fn history(&self) -> Result<Vec<Revision>> {
        let rev = self.rev.clone().ok_or_else(|| {
            ReplicationError::InvalidDocument(format!("{}: replicated document without _rev", self.id))
        })?;

        match &self.revisions {
            None => Ok(vec![rev]),
            Some(history) => {
                let path = history.to_path()?;
                if path.first() != Some(&rev) {
                    return Err(ReplicationError::InvalidDocument(format!(
                        "{}: _revisions does not start at {}",
                        self.id, rev
                    )));
                }
                Ok(path)
            }
        }
    }
}

/// Check that a document id is usable as a store key and URL path.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ReplicationError::InvalidDocument("empty document id".to_string()));
    }
    if id.starts_with('_') {
        return Err(ReplicationError::InvalidDocument(format!(
            "document id {:?} uses the reserved '_' prefix",
            id
        )));
    }
    if id.starts_with('/') || id.ends_with('/') || id.contains("//") {
        return Err(ReplicationError::InvalidDocument(format!(
            "document id {:?} has an empty path segment",
            id
        )));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !ID_PUNCTUATION.contains(c))
    {
        return Err(ReplicationError::InvalidDocument(format!(
            "document id {:?} contains {:?}",
            id, c
        )));
    }
    Ok(())
}
