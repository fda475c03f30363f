// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for document replication.
//!
//! Errors are split by what the caller can do about them: per-document
//! problems are reported and counted, transport problems abort the current
//! run (the saved checkpoint stays valid), and store corruption is fatal.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Network failure, HTTP 5xx, circuit open |
//! | `Timeout` | Yes | An operation exceeded its deadline |
//! | `NotFound` | No | Document or revision absent (nothing to fetch) |
//! | `Conflict` | No | Edit against an unknown or missing parent revision |
//! | `InvalidDocument` | No | Malformed document or revision |
//! | `StoreCorruption` | No | Revision tree invariant violated on disk |
//! | `Store` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `AlreadyRunning` | No | Same (source, target, direction) already in flight |
//! | `PushFailed` | As its cause | Push half of a sync failed; carries the pull result |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether an operation
//! may be retried with backoff. [`ReplicationError::is_transport()`] groups
//! the errors that fail a whole replication run.

use crate::coordinator::ReplicationResult;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while storing or replicating documents.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Document, or the requested revision of it, does not exist.
    ///
    /// During replication this means "nothing to fetch" and is skipped.
    #[error("Not found: {id}{}", rev_suffix(.rev))]
    NotFound { id: String, rev: Option<String> },

    /// An edit named a parent revision the store does not have, or named no
    /// parent for a document that is still live.
    ///
    /// Edits against a known but stale parent are not errors: they are
    /// recorded as a conflicting branch of the revision tree.
    #[error("Document update conflict ({id}): {reason}")]
    Conflict { id: String, reason: String },

    /// The document or revision string is malformed.
    ///
    /// Reported per document during bulk writes and counted as a write failure.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// Network or remote-side failure while talking to a store.
    ///
    /// Retryable with backoff. Aborts a replication run.
    #[error("Transport error ({operation}): {message}")]
    Transport {
        operation: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// An operation exceeded its deadline.
    ///
    /// Transport class: fails the current replication run.
    #[error("Timed out after {after:?} ({operation})")]
    Timeout { operation: String, after: Duration },

    /// A persisted revision tree violates its invariants.
    ///
    /// Never swallowed: the store needs operator attention.
    #[error("Store corruption ({id}): {detail}")]
    StoreCorruption { id: String, detail: String },

    /// SQLite error in the local store or checkpoint table.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A replication for the same (source, target, direction) is in flight.
    #[error("Replication already running: {source_name} -> {target_name} ({direction})")]
    AlreadyRunning {
        source_name: String,
        target_name: String,
        direction: String,
    },

    /// The push half of a sync failed after the pull completed.
    ///
    /// Classified like the push error it wraps.
    #[error("Push failed after pull wrote {} revisions: {source}", .pull.docs_written)]
    PushFailed {
        pull: Box<ReplicationResult>,
        #[source]
        source: Box<ReplicationError>,
    },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn rev_suffix(rev: &Option<String>) -> String {
    rev.as_ref().map(|r| format!(" (rev {})", r)).unwrap_or_default()
}

impl ReplicationError {
    /// Create a transport error from a reqwest error.
    ///
    /// Client-side timeouts become [`ReplicationError::Timeout`].
    pub fn transport(operation: impl Into<String>, source: reqwest::Error, after: Duration) -> Self {
        if source.is_timeout() {
            return Self::Timeout {
                operation: operation.into(),
                after,
            };
        }
        Self::Transport {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a transport error without source.
    pub fn transport_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            id: id.into(),
            rev: None,
        }
    }

    pub fn conflict(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn corruption(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::StoreCorruption {
            id: id.into(),
            detail: detail.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Timeout { .. } => true,
            Self::NotFound { .. } => false,
            Self::Conflict { .. } => false,
            Self::InvalidDocument(_) => false,
            Self::StoreCorruption { .. } => false, // Needs operator attention
            Self::Store(_) => false,
            Self::Config(_) => false,
            Self::AlreadyRunning { .. } => false,
            Self::PushFailed { source, .. } => source.is_retryable(),
            Self::Internal(_) => false,
        }
    }

    /// Transport-class errors abort a replication run.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::PushFailed { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    /// The completed pull of a sync whose push failed.
    pub fn pulled(&self) -> Option<&ReplicationResult> {
        match self {
            Self::PushFailed { pull, .. } => Some(&**pull),
            _ => None,
        }
    }

    /// Short machine-readable kind, used on the HTTP surface and in
    /// per-document write outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::InvalidDocument(_) => "bad_request",
            Self::Transport { .. } => "transport",
            Self::Timeout { .. } => "timeout",
            Self::StoreCorruption { .. } => "corruption",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
            Self::AlreadyRunning { .. } => "already_running",
            Self::PushFailed { source, .. } => source.kind(),
            Self::Internal(_) => "internal",
        }
    }
}
