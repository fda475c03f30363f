// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Replication runs (outcome, state, documents read/written/failed)
//! - Batch processing stats
//! - Checkpoint saves
//! - Local store writes and conflict branches
//! - Remote HTTP requests and circuit breaker state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `revsync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed here; the embedding application chooses one.
//!
//! # Usage
//!
//! ```rust,no_run
//! use revsync::metrics;
//! use std::time::Duration;
//!
//! // After a batch has been written to the target
//! metrics::record_batch("pull", 100, 97, 3, Duration::from_millis(50));
//!
//! // After the checkpoint was persisted
//! metrics::record_checkpoint_saved("pull", 1_234);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Run Metrics
// =============================================================================

/// Record the outcome of a replication run.
///
/// `outcome` is one of `ok`, `partial` (write failures), `cancelled`, `failed`.
pub fn record_run_outcome(direction: &str, outcome: &str, duration: Duration) {
    counter!(
        "revsync_runs_total",
        "direction" => direction.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("revsync_run_duration_seconds", "direction" => direction.to_string())
        .record(duration.as_secs_f64());
}

/// Gauge for run state, encoded as numeric for alerting.
pub fn set_run_state(direction: &str, state: &str) {
    let value = match state {
        "Idle" => 0.0,
        "ReadingChanges" => 1.0,
        "Diffing" => 2.0,
        "Fetching" => 3.0,
        "Writing" => 4.0,
        "Checkpointing" => 5.0,
        "Done" => 6.0,
        "Failed" => 7.0,
        _ => -1.0,
    };
    gauge!("revsync_run_state", "direction" => direction.to_string()).set(value);
}

/// Record changes read from a source's change feed.
pub fn record_changes_read(direction: &str, count: usize) {
    counter!("revsync_changes_read_total", "direction" => direction.to_string()).increment(count as u64);
}

/// Record a run rejected because the same pair was already replicating.
pub fn record_run_rejected(direction: &str) {
    counter!("revsync_runs_rejected_total", "direction" => direction.to_string()).increment(1);
}

/// Record a failure by error kind.
pub fn record_error(direction: &str, kind: &str) {
    counter!(
        "revsync_errors_total",
        "direction" => direction.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

// =============================================================================
// Batch Processing Metrics
// =============================================================================

/// Record a processed batch.
///
/// `read` counts revisions fetched from the source, `written` and `failed`
/// the per-document outcomes of the target write.
pub fn record_batch(direction: &str, read: usize, written: usize, failed: usize, duration: Duration) {
    let dir = direction.to_string();

    counter!("revsync_docs_read_total", "direction" => dir.clone()).increment(read as u64);
    counter!("revsync_docs_written_total", "direction" => dir.clone()).increment(written as u64);
    if failed > 0 {
        counter!("revsync_doc_write_failures_total", "direction" => dir.clone()).increment(failed as u64);
    }

    histogram!("revsync_batch_duration_seconds", "direction" => dir.clone()).record(duration.as_secs_f64());
    histogram!("revsync_batch_size", "direction" => dir).record(read as f64);
}

/// Record revisions the target already had (skipped by revs_diff).
pub fn record_revs_skipped(direction: &str, count: usize) {
    if count > 0 {
        counter!("revsync_revs_skipped_total", "direction" => direction.to_string()).increment(count as u64);
    }
}

// =============================================================================
// Checkpoint Metrics
// =============================================================================

/// Record a persisted checkpoint.
pub fn record_checkpoint_saved(direction: &str, seq: u64) {
    counter!("revsync_checkpoint_saves_total", "direction" => direction.to_string()).increment(1);
    gauge!("revsync_checkpoint_seq", "direction" => direction.to_string()).set(seq as f64);
}

/// Record a SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_sqlite_retry(operation: &str) {
    counter!("revsync_sqlite_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Local Store Metrics
// =============================================================================

/// Record a document write to the local store.
pub fn record_store_write(store: &str, kind: &str) {
    counter!(
        "revsync_store_writes_total",
        "store" => store.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record an edit that opened a conflicting branch.
pub fn record_conflict_branch(store: &str) {
    counter!("revsync_conflict_branches_total", "store" => store.to_string()).increment(1);
}

// =============================================================================
// Remote Metrics
// =============================================================================

/// Record a remote HTTP request.
pub fn record_http_request(remote: &str, operation: &str, status: &str, duration: Duration) {
    counter!(
        "revsync_http_requests_total",
        "remote" => remote.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "revsync_http_request_duration_seconds",
        "remote" => remote.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a retried remote request.
pub fn record_http_retry(remote: &str, operation: &str) {
    counter!(
        "revsync_http_retries_total",
        "remote" => remote.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "revsync_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("revsync_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!("revsync_circuit_rejections_total", "circuit" => circuit_name.to_string()).increment(1);
}

// =============================================================================
// SLO Metrics
// =============================================================================

/// Record an SLO violation (latency threshold exceeded).
///
/// Labels:
/// - `scope`: direction for batches, remote name for requests
/// - `slo_type`: `batch` or `remote_op`
pub fn record_slo_violation(scope: &str, slo_type: &str, latency_ms: u64) {
    counter!(
        "revsync_slo_violations_total",
        "scope" => scope.to_string(),
        "slo_type" => slo_type.to_string()
    )
    .increment(1);

    histogram!(
        "revsync_slo_violation_latency_ms",
        "scope" => scope.to_string(),
        "slo_type" => slo_type.to_string()
    )
    .record(latency_ms as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The metrics crate uses global state and no recorder is installed in
    // unit tests; these only check the functions accept edge-case inputs.

    #[test]
    fn test_record_run_outcome() {
        record_run_outcome("pull", "ok", Duration::from_millis(20));
        record_run_outcome("push", "partial", Duration::ZERO);
        record_run_outcome("push", "failed", Duration::from_secs(30));
    }

    #[test]
    fn test_set_run_state_all_states() {
        for state in [
            "Idle",
            "ReadingChanges",
            "Diffing",
            "Fetching",
            "Writing",
            "Checkpointing",
            "Done",
            "Failed",
        ] {
            set_run_state("pull", state);
        }
        // Unknown state maps to -1
        set_run_state("pull", "Sleeping");
    }

    #[test]
    fn test_record_batch() {
        record_batch("pull", 100, 97, 3, Duration::from_millis(50));
        record_batch("push", 0, 0, 0, Duration::ZERO);
        record_revs_skipped("push", 0);
        record_revs_skipped("push", 12);
    }

    #[test]
    fn test_record_checkpoint_and_store() {
        record_checkpoint_saved("pull", 0);
        record_checkpoint_saved("pull", u64::MAX);
        record_sqlite_retry("checkpoint_save");
        record_store_write("local", "edit");
        record_conflict_branch("local");
    }

    #[test]
    fn test_record_http_and_circuit() {
        record_http_request("hq", "changes", "200", Duration::from_millis(3));
        record_http_request("hq", "bulk_docs", "error", Duration::ZERO);
        record_http_retry("hq", "changes");
        record_circuit_call("hq-reads", "success");
        record_circuit_call("hq-reads", "rejected");
        set_circuit_state("hq-reads", "half_open");
        set_circuit_state("hq-reads", "bogus");
        record_circuit_rejection("hq-writes");
    }

    #[test]
    fn test_record_misc() {
        record_changes_read("pull", 5);
        record_run_rejected("push");
        record_error("pull", "timeout");
        record_slo_violation("pull", "batch", 2_500);
    }
}
