// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change feed reader.
//!
//! Pages through a source store's change log in batches. The feed is
//! finite: it snapshots the source's `update_seq` when opened and stops once
//! it has read that far, so a replication run terminates even while the
//! source keeps taking writes. Later writes are picked up by the next run.
//!
//! ```text
//! open(since = 40)  update_seq = 95, batch_size = 25
//!
//! next_batch → seq 41..=66   (25 changes)
//! next_batch → seq 67..=95   (≤ 25 changes, reaches snapshot)
//! next_batch → None
//! ```

use crate::error::Result;
use crate::store::{Change, DocumentStore};
use std::sync::Arc;
use tracing::debug;

/// One page of changes, ascending by sequence.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub changes: Vec<Change>,
    /// Highest sequence covered by this batch.
    pub last_seq: u64,
}

impl ChangeBatch {
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Lazily pages `changes_since` on a source store.
pub struct ChangeFeed {
    source: Arc<dyn DocumentStore>,
    position: u64,
    until: u64,
    batch_size: usize,
    exhausted: bool,
}

impl ChangeFeed {
    /// Open a feed reading changes after `since`.
    pub async fn open(source: Arc<dyn DocumentStore>, since: u64, batch_size: usize) -> Result<Self> {
        let info = source.info().await?;
        debug!(
            source = %info.name,
            since,
            update_seq = info.update_seq,
            "Opened change feed"
        );
        Ok(Self::with_snapshot(source, since, info.update_seq, batch_size))
    }

    /// Open a feed against an already-known `update_seq`.
    pub fn with_snapshot(source: Arc<dyn DocumentStore>, since: u64, until: u64, batch_size: usize) -> Self {
        Self {
            source,
            position: since,
            until,
            batch_size: batch_size.max(1),
            exhausted: since >= until,
        }
    }

    /// Sequence of the last change yielded (or the starting point).
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The source's `update_seq` when the feed was opened.
    pub fn snapshot_seq(&self) -> u64 {
        self.until
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Read the next batch, or `None` once the feed is exhausted.
    ///
    /// Sequences are strictly increasing across batches. On error the
    /// position is unchanged, so the call may be repeated.
    pub async fn next_batch(&mut self) -> Result<Option<ChangeBatch>> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self.source.changes_since(self.position, self.batch_size).await?;
        let short_page = page.results.len() < self.batch_size;

        // Changes past the snapshot belong to the next run.
        let (position, until) = (self.position, self.until);
        let mut changes: Vec<Change> = page
            .results
            .into_iter()
            .filter(|c| c.seq > position && c.seq <= until)
            .collect();
        changes.sort_by_key(|c| c.seq);
        changes.dedup_by_key(|c| c.seq);

        if changes.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }

        let last_seq = changes.last().map_or(self.position, |c| c.seq);
        self.position = last_seq;
        if short_page || last_seq >= self.until {
            self.exhausted = true;
        }

        debug!(count = changes.len(), last_seq, "Read change batch");
        Ok(Some(ChangeBatch { changes, last_seq }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::store::LocalStore;
    use serde_json::json;

    async fn store_with_docs(n: usize) -> Arc<LocalStore> {
        let store = LocalStore::open_in_memory("feed").await.unwrap();
        for i in 0..n {
            store
                .put(Document::from_json(format!("doc-{:03}", i), json!({"i": i})))
                .await
                .unwrap();
        }
        Arc::new(store)
    }

    async fn drain(feed: &mut ChangeFeed) -> Vec<Change> {
        let mut all = Vec::new();
        while let Some(batch) = feed.next_batch().await.unwrap() {
            all.extend(batch.changes);
        }
        all
    }

    #[tokio::test]
    async fn test_pages_in_batches() {
        let store = store_with_docs(7).await;
        let mut feed = ChangeFeed::open(store, 0, 3).await.unwrap();

        let first = feed.next_batch().await.unwrap().unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first.last_seq, 3);
        assert_eq!(feed.position(), 3);

        let second = feed.next_batch().await.unwrap().unwrap();
        assert_eq!(second.len(), 3);

        let third = feed.next_batch().await.unwrap().unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third.last_seq, 7);
        assert!(feed.is_exhausted());
        assert!(feed.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sequences_strictly_increase() {
        let store = store_with_docs(10).await;
        let mut feed = ChangeFeed::open(store, 0, 4).await.unwrap();
        let all = drain(&mut feed).await;
        assert_eq!(all.len(), 10);
        assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn test_reopen_from_earlier_seq_is_repeatable() {
        let store = store_with_docs(5).await;
        let source: Arc<dyn DocumentStore> = store;

        let first = drain(&mut ChangeFeed::open(source.clone(), 0, 2).await.unwrap()).await;
        let again = drain(&mut ChangeFeed::open(source.clone(), 0, 2).await.unwrap()).await;
        assert_eq!(first, again);

        let tail = drain(&mut ChangeFeed::open(source, 3, 2).await.unwrap()).await;
        assert_eq!(tail, first[3..].to_vec());
    }

    #[tokio::test]
    async fn test_stops_at_snapshot() {
        let store = store_with_docs(3).await;
        let mut feed = ChangeFeed::open(store.clone(), 0, 2).await.unwrap();
        assert_eq!(feed.snapshot_seq(), 3);

        // Writes after open are left for the next run.
        store.put(Document::from_json("late", json!({}))).await.unwrap();

        let all = drain(&mut feed).await;
        assert!(all.iter().all(|c| c.seq <= 3));
    }

    #[tokio::test]
    async fn test_empty_source() {
        let store = store_with_docs(0).await;
        let mut feed = ChangeFeed::open(store, 0, 10).await.unwrap();
        assert!(feed.is_exhausted());
        assert!(feed.next_batch().await.unwrap().is_none());
        assert_eq!(feed.position(), 0);
    }
}
