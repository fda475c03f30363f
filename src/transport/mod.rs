// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP transport for document stores.
//!
//! Both halves speak the same small CouchDB-style protocol rooted at
//! `/{db}`:
//!
//! | Method | Path | Body / Query | Response |
//! |--------|------|--------------|----------|
//! | `GET` | `/{db}` | | [`StoreInfo`](crate::store::StoreInfo) |
//! | `GET` | `/{db}/_changes` | `since`, `limit` | [`ChangesPage`](crate::store::ChangesPage) |
//! | `POST` | `/{db}/_revs_diff` | `{id: [rev]}` | `{id: [missing rev]}` |
//! | `GET` | `/{db}/_all_docs` | `keys` (JSON array) | `{rows: [...]}` |
//! | `POST` | `/{db}/_bulk_docs` | `{docs, new_edits}` | `[{ok, id, rev} \| {id, error, reason}]` |
//! | `GET` | `/{db}/{id}` | `rev` (optional) | document |
//! | `PUT` | `/{db}/{id}` | document | `{ok, id, rev}` |
//!
//! Failures carry an [`ErrorBody`] with 404 `not_found`, 409 `conflict`,
//! 400 `bad_request` or 500 for everything else.

pub mod http;
pub mod server;

use crate::document::Document;
use crate::error::ReplicationError;
use crate::store::AllDocsRow;
use serde::{Deserialize, Serialize};

pub use http::HttpStore;
pub use server::StoreServer;

/// JSON error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub reason: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            reason: reason.into(),
        }
    }
}

impl From<&ReplicationError> for ErrorBody {
    fn from(err: &ReplicationError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

/// Request body of `POST /{db}/_bulk_docs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkDocsRequest {
    pub docs: Vec<Document>,
    #[serde(default = "default_new_edits")]
    pub new_edits: bool,
}

fn default_new_edits() -> bool {
    true
}

/// Response body of `GET /{db}/_all_docs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllDocsResponse {
    pub rows: Vec<AllDocsRow>,
}
