// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One replication run: change feed → batches → checkpoint.
//!
//! Each run:
//! 1. Loads the checkpoint for its key
//! 2. Reads the source change feed in batches, up to the source's
//!    `update_seq` at the start of the run
//! 3. Hands each batch to the [`BatchProcessor`]
//! 4. Saves the checkpoint after each batch
//!
//! # Checkpoint Rule
//!
//! While every write has succeeded the checkpoint follows the last sequence
//! of each batch. The first batch with a rejected revision moves it to just
//! before the earliest failed change and freezes it there for the rest of
//! the run, so the next run retries the failed document:
//!
//! ```text
//! batch 1..=10  ok         → checkpoint 10
//! batch 11..=20 fail at 14 → checkpoint 13 (frozen)
//! batch 21..=30 ok         → checkpoint 13
//! ```
//!
//! # Errors
//!
//! Transport errors and timeouts end the run with [`RunState::Failed`]. The
//! last saved checkpoint stays valid because it is only saved after the
//! target acknowledged the batch.

use super::{Direction, ReplicationOptions, ReplicationResult, RunState};
use crate::batch::{BatchConfig, BatchProcessor};
use crate::changes::ChangeFeed;
use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::error::Result;
use crate::metrics;
use crate::resilience::with_timeout;
use crate::store::{DocumentStore, StoreInfo};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Everything a run needs, resolved by the engine.
pub(super) struct RunPlan<'a> {
    pub source: Arc<dyn DocumentStore>,
    pub target: Arc<dyn DocumentStore>,
    pub source_info: StoreInfo,
    pub key: CheckpointKey,
    pub checkpoints: &'a CheckpointStore,
    pub batch_size: usize,
    pub batch: BatchConfig,
}

/// Publish a state transition to the caller and to metrics.
pub(super) fn set_state(options: &ReplicationOptions, direction: Direction, state: RunState) {
    if let Some(tx) = &options.state {
        tx.send_replace(state);
    }
    metrics::set_run_state(direction.as_str(), &state.to_string());
}

/// Run the batch loop. The caller has already registered the run.
pub(super) async fn run(plan: RunPlan<'_>, options: &ReplicationOptions) -> Result<ReplicationResult> {
    let direction = plan.key.direction;
    let start_time = Utc::now();
    let started = Instant::now();
    let timeout: Duration = plan.batch.operation_timeout;

    let since = plan.checkpoints.load(&plan.key).await?;
    info!(
        since,
        update_seq = plan.source_info.update_seq,
        batch_size = plan.batch_size,
        "Starting replication"
    );

    let processor = BatchProcessor::new(
        Arc::clone(&plan.source),
        Arc::clone(&plan.target),
        direction,
        plan.batch.clone(),
    );
    let mut feed = ChangeFeed::with_snapshot(
        Arc::clone(&plan.source),
        since,
        plan.source_info.update_seq,
        plan.batch_size,
    );

    let mut checkpoint = since;
    let mut frozen = false;
    let mut cancelled = false;
    let mut docs_read = 0u64;
    let mut docs_written = 0u64;
    let mut doc_write_failures = 0u64;

    loop {
        if options.is_cancelled() {
            info!(checkpoint, "Replication cancelled");
            cancelled = true;
            break;
        }

        set_state(options, direction, RunState::ReadingChanges);
        let batch = match with_timeout("changes", timeout, feed.next_batch()).await? {
            Some(batch) => batch,
            None => break,
        };
        metrics::record_changes_read(direction.as_str(), batch.len());

        let result = processor
            .process(&batch, |phase| set_state(options, direction, phase))
            .await?;
        docs_read += result.docs_read;
        docs_written += result.docs_written;
        doc_write_failures += result.failures;

        if frozen {
            debug!(last_seq = batch.last_seq, checkpoint, "Checkpoint frozen after earlier failure");
            continue;
        }

        let next = match result.min_failed_seq {
            None => batch.last_seq,
            Some(failed_seq) => {
                frozen = true;
                warn!(
                    failed_seq,
                    checkpoint,
                    "Write failure, holding checkpoint before the failed change"
                );
                failed_seq.saturating_sub(1)
            }
        };

        if next > checkpoint {
            set_state(options, direction, RunState::Checkpointing);
            checkpoint = plan.checkpoints.save(&plan.key, next).await?;
            metrics::record_checkpoint_saved(direction.as_str(), checkpoint);
        }
    }

    set_state(options, direction, RunState::Done);
    let result = ReplicationResult {
        ok: doc_write_failures == 0,
        docs_read,
        docs_written,
        doc_write_failures,
        last_seq: checkpoint,
        cancelled,
        start_time,
        end_time: Utc::now(),
    };
    metrics::record_run_outcome(direction.as_str(), result.outcome(), started.elapsed());

    info!(
        ok = result.ok,
        docs_read,
        docs_written,
        doc_write_failures,
        last_seq = checkpoint,
        cancelled,
        duration_ms = started.elapsed().as_millis() as u64,
        "Replication finished"
    );
    Ok(result)
}
