// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch processor for replication.
//!
//! Moves one [`ChangeBatch`] from a source store to a target store.
//!
//! # Design
//!
//! ```text
//! ChangeBatch ──▶ revs_diff(open leaves) ──▶ missing revisions
//!                        (target)                  │
//!                                                  ▼
//!                                   JoinSet + Bulkhead fetch_revision()
//!                                        (source, NotFound skipped)
//!                                                  │
//!                                                  ▼
//!                                   bulk_put(docs, new_edits = false)
//!                                        (target, per-doc outcomes)
//! ```
//!
//! Per-document write failures are counted and reported with the sequence
//! of the change they came from. Transport errors and timeouts abort the
//! batch; the caller decides what happens to the checkpoint.

use crate::changes::ChangeBatch;
use crate::config::SloConfig;
use crate::coordinator::{Direction, RunState};
use crate::document::Document;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::{with_timeout, Bulkhead};
use crate::revision::Revision;
use crate::store::{DocumentStore, RevsDiff};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Configuration for batch processing.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum concurrent revision fetches.
    pub max_concurrent_fetches: usize,
    /// Deadline for each store call.
    pub operation_timeout: Duration,
    /// Latency thresholds for SLO warnings.
    pub slo: SloConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 8,
            operation_timeout: Duration::from_secs(30),
            slo: SloConfig::default(),
        }
    }
}

impl BatchConfig {
    /// Small, fast settings for testing.
    pub fn testing() -> Self {
        Self {
            max_concurrent_fetches: 4,
            operation_timeout: Duration::from_secs(5),
            slo: SloConfig::default(),
        }
    }
}

/// Result of processing a batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchResult {
    /// Changes in the batch.
    pub changes: usize,
    /// Revisions offered to the target.
    pub offered: usize,
    /// Revisions the target reported missing.
    pub missing: usize,
    /// Revisions fetched from the source.
    pub docs_read: u64,
    /// Revisions the target accepted.
    pub docs_written: u64,
    /// Revisions the target rejected.
    pub failures: u64,
    /// Sequence of the earliest change with a rejected revision.
    pub min_failed_seq: Option<u64>,
    /// Highest sequence covered by the batch.
    pub last_seq: u64,
}

impl BatchResult {
    /// Check if all writes succeeded.
    pub fn is_success(&self) -> bool {
        self.failures == 0
    }
}

/// A missing revision together with the change it came from.
#[derive(Debug, Clone)]
struct Wanted {
    seq: u64,
    id: String,
    rev: Revision,
}

/// Replicates change batches from `source` into `target`.
pub struct BatchProcessor {
    source: Arc<dyn DocumentStore>,
    target: Arc<dyn DocumentStore>,
    direction: Direction,
    bulkhead: Bulkhead,
    config: BatchConfig,
}

impl BatchProcessor {
    pub fn new(
        source: Arc<dyn DocumentStore>,
        target: Arc<dyn DocumentStore>,
        direction: Direction,
        config: BatchConfig,
    ) -> Self {
        Self {
            source,
            target,
            direction,
            bulkhead: Bulkhead::new(config.max_concurrent_fetches),
            config,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Diff, fetch and write one batch.
    ///
    /// `on_phase` is called as the batch enters [`RunState::Diffing`],
    /// [`RunState::Fetching`] and [`RunState::Writing`].
    #[instrument(skip(self, batch, on_phase), fields(direction = %self.direction, changes = batch.len(), last_seq = batch.last_seq))]
    pub async fn process<F>(&self, batch: &ChangeBatch, mut on_phase: F) -> Result<BatchResult>
    where
        F: FnMut(RunState),
    {
        let started = Instant::now();
        let mut result = BatchResult {
            changes: batch.len(),
            last_seq: batch.last_seq,
            ..Default::default()
        };
        if batch.is_empty() {
            return Ok(result);
        }

        // Phase 1: which open leaves does the target lack?
        on_phase(RunState::Diffing);
        let (offered, seq_of) = offered_revisions(batch);
        result.offered = offered.values().map(Vec::len).sum();
        let missing = with_timeout(
            "revs_diff",
            self.config.operation_timeout,
            self.target.revs_diff(offered),
        )
        .await?;

        let wanted = wanted_revisions(missing, &seq_of);
        result.missing = wanted.len();
        metrics::record_revs_skipped(self.direction.as_str(), result.offered.saturating_sub(result.missing));

        if wanted.is_empty() {
            debug!(offered = result.offered, "Target already has every revision");
            self.finish(&result, started);
            return Ok(result);
        }

        // Phase 2: fetch them from the source.
        on_phase(RunState::Fetching);
        let fetched = self.fetch(wanted).await?;
        result.docs_read = fetched.len() as u64;

        // Phase 3: write them as replicated revisions.
        on_phase(RunState::Writing);
        self.write(fetched, &mut result).await?;

        self.finish(&result, started);
        Ok(result)
    }

    /// Fetch wanted revisions concurrently, bounded by the bulkhead.
    ///
    /// Returns documents ordered by change sequence.
    async fn fetch(&self, wanted: Vec<Wanted>) -> Result<Vec<(u64, Document)>> {
        let mut join_set: JoinSet<(Wanted, Result<Document>)> = JoinSet::new();

        for item in wanted {
            let source = Arc::clone(&self.source);
            let bulkhead = self.bulkhead.clone();
            let timeout = self.config.operation_timeout;

            join_set.spawn(async move {
                let _permit = match bulkhead.acquire().await {
                    Ok(permit) => permit,
                    Err(e) => return (item, Err(e)),
                };
                let result = with_timeout("fetch_revision", timeout, source.fetch_revision(&item.id, &item.rev)).await;
                (item, result)
            });
        }

        let mut docs = Vec::with_capacity(join_set.len());
        while let Some(joined) = join_set.join_next().await {
            let (item, result) = joined.map_err(|e| ReplicationError::Internal(format!("fetch task failed: {}", e)))?;
            match result {
                Ok(doc) => docs.push((item.seq, doc)),
                Err(ReplicationError::NotFound { .. }) => {
                    // Compacted or purged on the source since the diff.
                    debug!(id = %item.id, rev = %item.rev, "Revision vanished from source, skipping");
                }
                // Dropping the JoinSet aborts the remaining fetches.
                Err(e) => return Err(e),
            }
        }

        docs.sort_by(|(a_seq, a), (b_seq, b)| a_seq.cmp(b_seq).then_with(|| a.rev.cmp(&b.rev)));
        Ok(docs)
    }

    /// Write fetched revisions, tallying per-document outcomes into `result`.
    async fn write(&self, fetched: Vec<(u64, Document)>, result: &mut BatchResult) -> Result<()> {
        let seqs: Vec<(u64, String)> = fetched.iter().map(|(seq, doc)| (*seq, doc.id.clone())).collect();
        let docs: Vec<Document> = fetched.into_iter().map(|(_, doc)| doc).collect();

        let outcomes = with_timeout(
            "bulk_docs",
            self.config.operation_timeout,
            self.target.bulk_put(docs, false),
        )
        .await?;

        for (i, (seq, id)) in seqs.iter().enumerate() {
            match outcomes.get(i) {
                Some(outcome) if outcome.is_ok() => result.docs_written += 1,
                outcome => {
                    let (error, reason) = outcome
                        .map(|o| (o.error.clone(), o.reason.clone()))
                        .unwrap_or((Some("missing_result".to_string()), None));
                    warn!(
                        direction = %self.direction,
                        id = %id,
                        seq,
                        error = error.as_deref().unwrap_or("unknown"),
                        reason = reason.as_deref().unwrap_or(""),
                        "Target rejected replicated revision"
                    );
                    metrics::record_error(self.direction.as_str(), error.as_deref().unwrap_or("unknown"));
                    result.failures += 1;
                    result.min_failed_seq = Some(result.min_failed_seq.map_or(*seq, |s| s.min(*seq)));
                }
            }
        }
        Ok(())
    }

    fn finish(&self, result: &BatchResult, started: Instant) {
        let elapsed = started.elapsed();
        metrics::record_batch(
            self.direction.as_str(),
            result.docs_read as usize,
            result.docs_written as usize,
            result.failures as usize,
            elapsed,
        );
        if self.config.slo.is_batch_violation(elapsed) {
            let latency_ms = elapsed.as_millis() as u64;
            metrics::record_slo_violation(self.direction.as_str(), "batch", latency_ms);
            warn!(
                direction = %self.direction,
                latency_ms,
                threshold_ms = self.config.slo.max_batch_latency_ms,
                "Batch exceeded latency SLO"
            );
        }

        info!(
            direction = %self.direction,
            changes = result.changes,
            missing = result.missing,
            read = result.docs_read,
            written = result.docs_written,
            failures = result.failures,
            last_seq = result.last_seq,
            "Batch complete"
        );
    }
}

/// Open leaves of every change, plus the sequence each id was seen at.
fn offered_revisions(batch: &ChangeBatch) -> (RevsDiff, HashMap<String, u64>) {
    let mut offered = RevsDiff::new();
    let mut seq_of = HashMap::new();
    for change in &batch.changes {
        let revs = offered.entry(change.id.clone()).or_insert_with(Vec::new);
        for rev in change.open_revs() {
            if !revs.contains(&rev) {
                revs.push(rev);
            }
        }
        seq_of.insert(change.id.clone(), change.seq);
    }
    (offered, seq_of)
}

/// Flatten the target's answer, dropping anything that was never offered.
fn wanted_revisions(missing: RevsDiff, seq_of: &HashMap<String, u64>) -> Vec<Wanted> {
    let mut wanted = Vec::new();
    for (id, revs) in missing {
        let Some(&seq) = seq_of.get(&id) else {
            warn!(id = %id, "Target reported a revision that was not offered");
            continue;
        };
        for rev in revs {
            wanted.push(Wanted {
                seq,
                id: id.clone(),
                rev,
            });
        }
    }
    wanted.sort_by(|a, b| a.seq.cmp(&b.seq).then_with(|| a.rev.cmp(&b.rev)));
    wanted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::ChangeFeed;
    use crate::store::LocalStore;
    use serde_json::json;
    use std::sync::Mutex;

    async fn pair() -> (Arc<LocalStore>, Arc<LocalStore>) {
        (
            Arc::new(LocalStore::open_in_memory("source").await.unwrap()),
            Arc::new(LocalStore::open_in_memory("target").await.unwrap()),
        )
    }

    async fn only_batch(source: Arc<LocalStore>) -> ChangeBatch {
        let mut feed = ChangeFeed::open(source, 0, 100).await.unwrap();
        feed.next_batch().await.unwrap().unwrap_or_default()
    }

    fn processor(source: Arc<LocalStore>, target: Arc<LocalStore>) -> BatchProcessor {
        BatchProcessor::new(source, target, Direction::Push, BatchConfig::testing())
    }

    #[tokio::test]
    async fn test_copies_missing_documents() {
        let (source, target) = pair().await;
        for id in ["a", "b", "c"] {
            source.put(Document::from_json(id, json!({"id": id}))).await.unwrap();
        }

        let batch = only_batch(source.clone()).await;
        let phases = Mutex::new(Vec::new());
        let result = processor(source.clone(), target.clone())
            .process(&batch, |phase| phases.lock().unwrap().push(phase))
            .await
            .unwrap();

        assert_eq!(result.changes, 3);
        assert_eq!(result.missing, 3);
        assert_eq!(result.docs_read, 3);
        assert_eq!(result.docs_written, 3);
        assert!(result.is_success());
        assert_eq!(result.last_seq, 3);
        assert_eq!(
            phases.into_inner().unwrap(),
            vec![RunState::Diffing, RunState::Fetching, RunState::Writing]
        );

        for id in ["a", "b", "c"] {
            assert_eq!(target.get(id).await.unwrap(), source.get(id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_second_pass_has_nothing_to_fetch() {
        let (source, target) = pair().await;
        source.put(Document::from_json("a", json!({"n": 1}))).await.unwrap();

        let batch = only_batch(source.clone()).await;
        let processor = processor(source, target);
        processor.process(&batch, |_| {}).await.unwrap();

        let again = processor.process(&batch, |_| {}).await.unwrap();
        assert_eq!(again.missing, 0);
        assert_eq!(again.docs_read, 0);
        assert_eq!(again.docs_written, 0);
    }

    #[tokio::test]
    async fn test_conflicting_leaves_are_all_replicated() {
        let (source, target) = pair().await;
        let root = source.put(Document::from_json("m", json!({"score": "0-0"}))).await.unwrap();
        source
            .put(Document::from_json("m", json!({"score": "1-0"})).with_rev(root.rev.clone()))
            .await
            .unwrap();
        source
            .put(Document::from_json("m", json!({"score": "0-1"})).with_rev(root.rev))
            .await
            .unwrap();
        assert_eq!(source.conflicts("m").await.unwrap().len(), 1);

        let batch = only_batch(source.clone()).await;
        let result = processor(source.clone(), target.clone())
            .process(&batch, |_| {})
            .await
            .unwrap();

        assert_eq!(result.docs_written, 2);
        assert_eq!(target.get("m").await.unwrap(), source.get("m").await.unwrap());
        assert_eq!(target.conflicts("m").await.unwrap(), source.conflicts("m").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let (source, target) = pair().await;
        let result = processor(source, target)
            .process(&ChangeBatch::default(), |_| panic!("no phases for an empty batch"))
            .await
            .unwrap();
        assert_eq!(result, BatchResult::default());
    }

    #[test]
    fn test_wanted_revisions_ignores_unoffered_ids() {
        let mut missing = RevsDiff::new();
        missing.insert("a".to_string(), vec!["2-x".parse().unwrap(), "1-y".parse().unwrap()]);
        missing.insert("ghost".to_string(), vec!["1-z".parse().unwrap()]);
        let seq_of = HashMap::from([("a".to_string(), 5u64)]);

        let wanted = wanted_revisions(missing, &seq_of);
        assert_eq!(wanted.len(), 2);
        assert!(wanted.iter().all(|w| w.id == "a" && w.seq == 5));
        assert_eq!(wanted[0].rev.generation, 1);
    }
}
