// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Run state and result types.
//!
//! # State Transitions
//!
//! ```text
//!          replicate()
//! Idle ─────────────────→ ReadingChanges ←────────────────┐
//!                               │                          │
//!                   (batch read)│ (feed exhausted          │ (more
//!                               ↓  or cancelled)           │  changes)
//!                            Diffing ──────────→ Done      │
//!                               │                          │
//!                               ↓                          │
//!                            Fetching                      │
//!                               │                          │
//!                               ↓                          │
//!                            Writing                       │
//!                               │                          │
//!                               ↓                          │
//!                          Checkpointing ──────────────────┘
//!
//! any transport error / timeout ──→ Failed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

/// Which way documents flow relative to the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Remote → local.
    Pull,
    /// Local → remote.
    Push,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a single replication run.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Not started.
    Idle,
    /// Reading the next batch from the source's change feed.
    ReadingChanges,
    /// Asking the target which revisions it lacks.
    Diffing,
    /// Fetching missing revisions from the source.
    Fetching,
    /// Writing fetched revisions to the target.
    Writing,
    /// Persisting the checkpoint for the batch.
    Checkpointing,
    /// Finished, including cancelled runs.
    Done,
    /// Aborted by a transport error or timeout. The saved checkpoint is intact.
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "Idle"),
            RunState::ReadingChanges => write!(f, "ReadingChanges"),
            RunState::Diffing => write!(f, "Diffing"),
            RunState::Fetching => write!(f, "Fetching"),
            RunState::Writing => write!(f, "Writing"),
            RunState::Checkpointing => write!(f, "Checkpointing"),
            RunState::Done => write!(f, "Done"),
            RunState::Failed => write!(f, "Failed"),
        }
    }
}

/// Per-run knobs supplied by the caller.
#[derive(Debug, Default)]
pub struct ReplicationOptions {
    /// Set to `true` to stop the run before its next batch.
    pub cancel: Option<watch::Receiver<bool>>,
    /// Receives every state transition of the run.
    pub state: Option<watch::Sender<RunState>>,
    /// Overrides the configured per-call deadline.
    pub operation_timeout: Option<Duration>,
    /// Overrides the configured batch size.
    pub batch_size: Option<usize>,
}

impl ReplicationOptions {
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_state(mut self, state: watch::Sender<RunState>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, |rx| *rx.borrow())
    }
}

/// Summary of one replication run.
///
/// Serializes to
/// `{ok, docs_read, docs_written, doc_write_failures, last_seq, cancelled, start_time, end_time}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationResult {
    /// No document failed to write.
    pub ok: bool,
    /// Revisions fetched from the source.
    pub docs_read: u64,
    /// Revisions the target accepted.
    pub docs_written: u64,
    /// Revisions the target rejected.
    pub doc_write_failures: u64,
    /// The persisted checkpoint after the run.
    pub last_seq: u64,
    /// The run stopped early on request.
    #[serde(default)]
    pub cancelled: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ReplicationResult {
    pub fn duration(&self) -> Duration {
        (self.end_time - self.start_time).to_std().unwrap_or_default()
    }

    /// Metric label for the run outcome.
    pub fn outcome(&self) -> &'static str {
        if self.cancelled {
            "cancelled"
        } else if self.ok {
            "ok"
        } else {
            "partial"
        }
    }
}

/// Results of a pull followed by a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub pull: ReplicationResult,
    pub push: ReplicationResult,
}

impl SyncResult {
    pub fn ok(&self) -> bool {
        self.pull.ok && self.push.ok
    }
}
