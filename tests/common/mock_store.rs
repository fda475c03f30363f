// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Recording, failure-injecting DocumentStore wrapper.
//!
//! Wraps a real store and forwards every call, while:
//! - counting calls per operation
//! - failing `fetch_revision` with a transport error after N calls
//! - rejecting replicated writes for chosen document ids
//! - failing every `bulk_put` with a transport error
//! - delaying `changes_since` to provoke timeouts

use revsync::document::Document;
use revsync::error::ReplicationError;
use revsync::revision::Revision;
use revsync::store::{
    AllDocsRow, BoxFuture, ChangesPage, DocWriteResult, DocumentStore, PutResult, RevsDiff, StoreInfo,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mock store that records calls and injects faults.
///
/// # Example
/// ```rust,ignore
/// let mock = MockStore::wrap(local.clone());
/// mock.reject_writes_for(["m3"]);
/// let result = engine.replicate_to(mock.clone()).await?;
/// assert_eq!(result.doc_write_failures, 1);
/// ```
pub struct MockStore {
    inner: Arc<dyn DocumentStore>,
    calls: Mutex<HashMap<&'static str, usize>>,
    /// `fetch_revision` fails once this many calls have succeeded
    fail_fetch_after: AtomicUsize,
    fetch_count: AtomicUsize,
    rejected_ids: Mutex<HashSet<String>>,
    writes_down: AtomicBool,
    changes_delay: Mutex<Option<Duration>>,
}

impl MockStore {
    pub fn wrap(inner: Arc<dyn DocumentStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(HashMap::new()),
            fail_fetch_after: AtomicUsize::new(usize::MAX),
            fetch_count: AtomicUsize::new(0),
            rejected_ids: Mutex::new(HashSet::new()),
            writes_down: AtomicBool::new(false),
            changes_delay: Mutex::new(None),
        })
    }

    /// Fail `fetch_revision` with a transport error after `n` successful calls.
    pub fn fail_fetch_after(&self, n: usize) {
        self.fetch_count.store(0, Ordering::SeqCst);
        self.fail_fetch_after.store(n, Ordering::SeqCst);
    }

    /// Stop injecting fetch failures.
    pub fn heal(&self) {
        self.fail_fetch_after.store(usize::MAX, Ordering::SeqCst);
        self.rejected_ids.lock().unwrap().clear();
        self.writes_down.store(false, Ordering::SeqCst);
        *self.changes_delay.lock().unwrap() = None;
    }

    /// Report a write failure for these ids in `bulk_put`.
    pub fn reject_writes_for<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut rejected = self.rejected_ids.lock().unwrap();
        rejected.extend(ids.into_iter().map(Into::into));
    }

    /// Sleep this long before answering `changes_since`.
    /// Fail every `bulk_put` as if the connection dropped.
    pub fn fail_writes(&self) {
        self.writes_down.store(true, Ordering::SeqCst);
    }

    pub fn delay_changes(&self, delay: Duration) {
        *self.changes_delay.lock().unwrap() = Some(delay);
    }

    /// Number of calls made to `operation`.
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().unwrap().get(operation).copied().unwrap_or(0)
    }

    fn record(&self, operation: &'static str) {
        *self.calls.lock().unwrap().entry(operation).or_insert(0) += 1;
    }
}

impl DocumentStore for MockStore {
    fn info(&self) -> BoxFuture<'_, StoreInfo> {
        self.record("info");
        self.inner.info()
    }

    fn get(&self, id: &str) -> BoxFuture<'_, Document> {
        self.record("get");
        self.inner.get(id)
    }

    fn fetch_revision(&self, id: &str, rev: &Revision) -> BoxFuture<'_, Document> {
        self.record("fetch_revision");
        let count = self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if count >= self.fail_fetch_after.load(Ordering::SeqCst) {
            let id = id.to_string();
            return Box::pin(async move {
                Err(ReplicationError::transport_msg(
                    "fetch_revision",
                    format!("simulated connection reset fetching {}", id),
                ))
            });
        }
        self.inner.fetch_revision(id, rev)
    }

    fn put(&self, doc: Document) -> BoxFuture<'_, PutResult> {
        self.record("put");
        self.inner.put(doc)
    }

    fn bulk_put(&self, docs: Vec<Document>, new_edits: bool) -> BoxFuture<'_, Vec<DocWriteResult>> {
        self.record("bulk_put");
        if self.writes_down.load(Ordering::SeqCst) {
            return Box::pin(async {
                Err(ReplicationError::transport_msg("bulk_docs", "simulated connection reset"))
            });
        }
        let rejected = self.rejected_ids.lock().unwrap().clone();
        Box::pin(async move {
            let refused: Vec<bool> = docs.iter().map(|d| rejected.contains(&d.id)).collect();
            let (bad, good): (Vec<Document>, Vec<Document>) =
                docs.into_iter().partition(|d| rejected.contains(&d.id));

            let mut good_outcomes = self.inner.bulk_put(good, new_edits).await?.into_iter();
            let mut bad = bad.into_iter();

            // Outcomes follow request order.
            let mut results = Vec::with_capacity(refused.len());
            for is_refused in refused {
                if is_refused {
                    if let Some(doc) = bad.next() {
                        let err = ReplicationError::InvalidDocument(format!("{}: simulated validation failure", doc.id));
                        results.push(DocWriteResult::failure(doc.id, &err));
                    }
                } else if let Some(outcome) = good_outcomes.next() {
                    results.push(outcome);
                }
            }
            Ok(results)
        })
    }

    fn changes_since(&self, since: u64, limit: usize) -> BoxFuture<'_, ChangesPage> {
        self.record("changes_since");
        let delay = *self.changes_delay.lock().unwrap();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.inner.changes_since(since, limit).await
        })
    }

    fn revs_diff(&self, revs: RevsDiff) -> BoxFuture<'_, RevsDiff> {
        self.record("revs_diff");
        self.inner.revs_diff(revs)
    }

    fn all_docs(&self, keys: Vec<String>) -> BoxFuture<'_, Vec<AllDocsRow>> {
        self.record("all_docs");
        self.inner.all_docs(keys)
    }
}
