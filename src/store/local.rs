// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed document store.
//!
//! Each document's revision tree is persisted as one row per revision; the
//! change log gets one row per write that changed a tree's leaves. Reads
//! rebuild the tree for the ids they touch.
//!
//! # Writes
//!
//! SQLite admits one writer at a time, so every write takes the store's
//! writer lock before opening its transaction. Checkpoint saves share the
//! lock. One document write is one
//! transaction: load tree, merge, upsert the changed revision rows, append
//! a change row, commit. A failed merge rolls back and leaves the tree as
//! it was.
//!
//! # Edits
//!
//! | Declared parent (`_rev`) | Outcome |
//! |---|---|
//! | none, id unknown | new document, generation 1 |
//! | none, winner is a tombstone | recreate on top of the tombstone |
//! | none, winner is live | `Conflict` |
//! | unknown revision | `Conflict` |
//! | the winning leaf | ordinary update |
//! | any other known revision | new conflicting branch, winner recomputed |
//!
//! Revisions are computed from the parent and content, so submitting the
//! same edit twice yields the same revision and the second write changes
//! nothing.

use crate::checkpoint::CheckpointStore;
use crate::config::StoreConfig;
use crate::document::{Document, Fields};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::rev_tree::{MergeOutcome, RevTree, StoredRevision};
use crate::revision::{Revision, RevisionHistory};
use crate::store::sqlite;
use crate::store::{
    AllDocsRow, BoxFuture, Change, ChangesPage, DocWriteResult, DocumentStore, PutResult, RevsDiff, StoreInfo,
};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A revision written by an edit, and whether the edit opened a branch.
#[derive(Debug)]
struct EditPlan {
    rev: Revision,
    outcome: MergeOutcome,
    branched: bool,
}

/// SQLite document store.
pub struct LocalStore {
    name: String,
    instance_id: String,
    pool: SqlitePool,
    /// Database file, `None` for in-memory stores.
    path: Option<PathBuf>,
    /// Shared with the checkpoint store: one writer per database.
    writer: Arc<Mutex<()>>,
    checkpoints: CheckpointStore,
}

impl LocalStore {
    /// Open (or create) the store described by `config`.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        validate_name(&config.name)?;
        if config.is_in_memory() {
            return Self::open_in_memory(&config.name).await;
        }

        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            ReplicationError::Config(format!("Cannot create data dir {}: {}", config.data_dir, e))
        })?;
        let path = config.database_path();
        info!(store = %config.name, path = %path.display(), "Opening document store");

        let pool = sqlite::open_file(&path, config.wal_mode, config.max_connections).await?;
        Self::from_pool(&config.name, pool, Some(path)).await
    }

    /// Open a private in-memory store. Its contents vanish on close.
    pub async fn open_in_memory(name: &str) -> Result<Self> {
        validate_name(name)?;
        let pool = sqlite::open_memory().await?;
        Self::from_pool(name, pool, None).await
    }

    async fn from_pool(name: &str, pool: SqlitePool, path: Option<PathBuf>) -> Result<Self> {
        sqlx::query("INSERT OR IGNORE INTO meta (key, value) VALUES ('instance_id', ?)")
            .bind(Uuid::new_v4().to_string())
            .execute(&pool)
            .await?;
        let (instance_id,): (String,) = sqlx::query_as("SELECT value FROM meta WHERE key = 'instance_id'")
            .fetch_one(&pool)
            .await?;

        debug!(store = %name, instance_id = %instance_id, "Document store ready");

        let writer = Arc::new(Mutex::new(()));
        Ok(Self {
            name: name.to_string(),
            instance_id,
            checkpoints: CheckpointStore::with_writer(pool.clone(), writer.clone()),
            pool,
            path,
            writer,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Database file (for diagnostics). `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Checkpoints of replications this store takes part in.
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Close the connection pool gracefully, checkpointing the WAL first.
    pub async fn close(&self) {
        if self.path.is_some() {
            let pool = &self.pool;
            let result = sqlite::execute_with_retry("wal_checkpoint", || async {
                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
            })
            .await;
            if let Err(e) = result {
                warn!(store = %self.name, error = %e, "Failed to checkpoint WAL on close");
            }
        }
        self.pool.close().await;
        info!(store = %self.name, "Document store closed");
    }

    /// Close the store and delete its database.
    ///
    /// Documents, revision trees, the change log and checkpoints are all
    /// removed. Opening the same name again yields an empty store with a new
    /// instance id. Any further use of this handle fails.
    pub async fn destroy(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.pool.close().await;

        if let Some(path) = &self.path {
            for file in database_files(path) {
                match std::fs::remove_file(&file) {
                    Ok(()) => debug!(path = %file.display(), "Removed database file"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(ReplicationError::Internal(format!(
                            "Failed to remove {}: {}",
                            file.display(),
                            e
                        )))
                    }
                }
            }
        }

        info!(store = %self.name, "Document store destroyed");
        Ok(())
    }

    /// Live leaves that lost to the winner.
    pub async fn conflicts(&self, id: &str) -> Result<Vec<Revision>> {
        Ok(self.revision_tree(id).await?.conflicts())
    }

    /// The full revision tree of a document (empty for unknown ids).
    pub async fn revision_tree(&self, id: &str) -> Result<RevTree> {
        let mut conn = self.pool.acquire().await?;
        load_tree(&mut conn, id).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    async fn read_info(&self) -> Result<StoreInfo> {
        let (update_seq,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM changes")
            .fetch_one(&self.pool)
            .await?;
        let (doc_count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM changes c
            WHERE c.deleted = 0
              AND c.seq = (SELECT MAX(seq) FROM changes WHERE doc_id = c.doc_id)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreInfo {
            name: self.name.clone(),
            instance_id: self.instance_id.clone(),
            update_seq: update_seq.max(0) as u64,
            doc_count: doc_count.max(0) as u64,
        })
    }

    async fn read_winner(&self, id: &str) -> Result<Document> {
        let tree = self.revision_tree(id).await?;
        let winner = tree
            .winner()
            .filter(|w| !w.deleted)
            .ok_or_else(|| ReplicationError::not_found(id))?;
        let body = winner.body.clone().ok_or_else(|| ReplicationError::NotFound {
            id: id.to_string(),
            rev: Some(winner.rev.to_string()),
        })?;

        Ok(Document {
            id: id.to_string(),
            rev: Some(winner.rev.clone()),
            deleted: false,
            revisions: None,
            fields: body,
        })
    }

    async fn read_revision(&self, id: &str, rev: &Revision) -> Result<Document> {
        let tree = self.revision_tree(id).await?;
        let missing = || ReplicationError::NotFound {
            id: id.to_string(),
            rev: Some(rev.to_string()),
        };
        let node = tree.get(rev).ok_or_else(missing)?;
        let body = node.body.clone().ok_or_else(missing)?;
        let ancestry = tree.ancestry(rev).unwrap_or_default();

        Ok(Document {
            id: id.to_string(),
            rev: Some(rev.clone()),
            deleted: node.deleted,
            revisions: RevisionHistory::from_path(&ancestry),
            fields: body,
        })
    }

    async fn read_changes(&self, since: u64, limit: usize) -> Result<ChangesPage> {
        let mut conn = self.pool.acquire().await?;
        let rows: Vec<(i64, String, String, bool)> = sqlx::query_as(
            r#"
            SELECT c.seq, c.doc_id, c.rev, c.deleted FROM changes c
            WHERE c.seq > ?
              AND c.seq = (SELECT MAX(seq) FROM changes WHERE doc_id = c.doc_id)
            ORDER BY c.seq
            LIMIT ?
            "#,
        )
        .bind(i64::try_from(since).unwrap_or(i64::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *conn)
        .await?;

        let mut results = Vec::with_capacity(rows.len());
        for (seq, id, rev, deleted) in rows {
            let rev = parse_stored_rev(&id, &rev)?;
            let tree = load_tree(&mut conn, &id).await?;
            results.push(Change {
                seq: seq.max(0) as u64,
                revs: tree.leaf_revs(),
                id,
                rev,
                deleted,
            });
        }

        let last_seq = results.last().map_or(since, |c| c.seq);
        Ok(ChangesPage { results, last_seq })
    }

    async fn read_revs_diff(&self, revs: RevsDiff) -> Result<RevsDiff> {
        let mut conn = self.pool.acquire().await?;
        let mut missing = RevsDiff::new();
        for (id, wanted) in revs {
            let tree = load_tree(&mut conn, &id).await?;
            let absent: Vec<Revision> = wanted.into_iter().filter(|r| !tree.contains(r)).collect();
            if !absent.is_empty() {
                missing.insert(id, absent);
            }
        }
        Ok(missing)
    }

    async fn read_all_docs(&self, keys: Vec<String>) -> Result<Vec<AllDocsRow>> {
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            let row = match self.read_winner(&key).await {
                Ok(doc) => AllDocsRow::found(doc).unwrap_or_else(|| AllDocsRow::missing(&key)),
                Err(ReplicationError::NotFound { .. }) => AllDocsRow::missing(&key),
                Err(e) => return Err(e),
            };
            rows.push(row);
        }
        Ok(rows)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════

    async fn write_edit(&self, doc: Document) -> Result<PutResult> {
        doc.validate()?;
        let _writer = self.writer.lock().await;
        let rev = self.apply_edit(&doc).await?;
        Ok(PutResult {
            ok: true,
            id: doc.id,
            rev,
        })
    }

    async fn write_bulk(&self, docs: Vec<Document>, new_edits: bool) -> Result<Vec<DocWriteResult>> {
        let _writer = self.writer.lock().await;
        let mut results = Vec::with_capacity(docs.len());

        for doc in docs {
            let written = match doc.validate() {
                Err(e) => Err(e),
                Ok(()) if new_edits => self.apply_edit(&doc).await,
                Ok(()) => self.apply_replicated(&doc).await,
            };
            match written {
                Ok(rev) => results.push(DocWriteResult::success(&doc.id, rev)),
                Err(e @ (ReplicationError::InvalidDocument(_) | ReplicationError::Conflict { .. })) => {
                    debug!(store = %self.name, doc_id = %doc.id, error = %e, "Document rejected");
                    results.push(DocWriteResult::failure(&doc.id, &e));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(results)
    }

    /// Apply a user edit. Caller holds the writer lock.
    async fn apply_edit(&self, doc: &Document) -> Result<Revision> {
        let mut tx = self.pool.begin().await?;
        let mut tree = load_tree(&mut tx, &doc.id).await?;

        let plan = plan_edit(&mut tree, doc)?;
        persist(&mut tx, &tree, &plan.outcome).await?;
        tx.commit().await?;

        if plan.branched {
            warn!(store = %self.name, doc_id = %doc.id, rev = %plan.rev, "Edit created a conflicting branch");
            metrics::record_conflict_branch(&self.name);
        }
        if !plan.outcome.is_noop() {
            metrics::record_store_write(&self.name, "edit");
            debug!(store = %self.name, doc_id = %doc.id, rev = %plan.rev, deleted = doc.deleted, "Stored edit");
        }
        Ok(plan.rev)
    }

    /// Merge a replicated revision with its history. Caller holds the writer lock.
    async fn apply_replicated(&self, doc: &Document) -> Result<Revision> {
        let path = doc.history()?;
        let mut tx = self.pool.begin().await?;
        let mut tree = load_tree(&mut tx, &doc.id).await?;

        let outcome = tree.merge_path(&path, doc.deleted, doc.fields.clone())?;
        persist(&mut tx, &tree, &outcome).await?;
        tx.commit().await?;

        if !outcome.is_noop() {
            metrics::record_store_write(&self.name, "replicated");
            debug!(
                store = %self.name,
                doc_id = %doc.id,
                rev = %path[0],
                new_revisions = outcome.changed.len(),
                "Stored replicated revision"
            );
        }
        Ok(path[0].clone())
    }
}

impl DocumentStore for LocalStore {
    fn info(&self) -> BoxFuture<'_, StoreInfo> {
        Box::pin(self.read_info())
    }

    fn get(&self, id: &str) -> BoxFuture<'_, Document> {
        let id = id.to_string();
        Box::pin(async move { self.read_winner(&id).await })
    }

    fn fetch_revision(&self, id: &str, rev: &Revision) -> BoxFuture<'_, Document> {
        let id = id.to_string();
        let rev = rev.clone();
        Box::pin(async move { self.read_revision(&id, &rev).await })
    }

    fn put(&self, doc: Document) -> BoxFuture<'_, PutResult> {
        Box::pin(self.write_edit(doc))
    }

    fn bulk_put(&self, docs: Vec<Document>, new_edits: bool) -> BoxFuture<'_, Vec<DocWriteResult>> {
        Box::pin(self.write_bulk(docs, new_edits))
    }

    fn changes_since(&self, since: u64, limit: usize) -> BoxFuture<'_, ChangesPage> {
        Box::pin(self.read_changes(since, limit))
    }

    fn revs_diff(&self, revs: RevsDiff) -> BoxFuture<'_, RevsDiff> {
        Box::pin(self.read_revs_diff(revs))
    }

    fn all_docs(&self, keys: Vec<String>) -> BoxFuture<'_, Vec<AllDocsRow>> {
        Box::pin(self.read_all_docs(keys))
    }
}

/// Decide the parent of an edit and merge the resulting revision into `tree`.
fn plan_edit(tree: &mut RevTree, doc: &Document) -> Result<EditPlan> {
    let winner = tree.winner().map(|w| (w.rev.clone(), w.deleted));

    let parent = match (&doc.rev, &winner) {
        (None, None) => None,
        (None, Some((rev, true))) => Some(rev.clone()),
        (None, Some((rev, false))) => {
            return Err(ReplicationError::conflict(
                &doc.id,
                format!("document exists at {}; edit must name its parent revision", rev),
            ))
        }
        (Some(rev), _) if !tree.contains(rev) => {
            return Err(ReplicationError::conflict(&doc.id, format!("unknown parent revision {}", rev)))
        }
        (Some(rev), _) => Some(rev.clone()),
    };

    let rev = Revision::compute(parent.as_ref(), &doc.fields, doc.deleted)?;
    let is_new = !tree.contains(&rev);
    let branched = is_new && parent.is_some() && parent.as_ref() != winner.as_ref().map(|(r, _)| r);

    let mut path = vec![rev.clone()];
    if let Some(ancestry) = parent.as_ref().and_then(|p| tree.ancestry(p)) {
        path.extend(ancestry);
    }
    let outcome = tree.merge_path(&path, doc.deleted, doc.fields.clone())?;

    Ok(EditPlan { rev, outcome, branched })
}

async fn load_tree(conn: &mut SqliteConnection, id: &str) -> Result<RevTree> {
    let rows: Vec<(String, Option<String>, bool, Option<String>)> =
        sqlx::query_as("SELECT rev, parent_rev, deleted, body FROM revisions WHERE doc_id = ?")
            .bind(id)
            .fetch_all(&mut *conn)
            .await?;

    let mut stored = Vec::with_capacity(rows.len());
    for (rev, parent, deleted, body) in rows {
        let rev = parse_stored_rev(id, &rev)?;
        let parent = parent.map(|p| parse_stored_rev(id, &p)).transpose()?;
        let body = body
            .map(|b| serde_json::from_str::<Fields>(&b))
            .transpose()
            .map_err(|e| ReplicationError::corruption(id, format!("unreadable body of {}: {}", rev, e)))?;
        stored.push(StoredRevision {
            rev,
            parent,
            deleted,
            body,
        });
    }

    RevTree::from_rows(id, stored)
}

/// Write the nodes a merge touched, plus a change row if the leaves changed.
async fn persist(conn: &mut SqliteConnection, tree: &RevTree, outcome: &MergeOutcome) -> Result<()> {
    for &idx in &outcome.changed {
        let row = tree.stored(idx);
        let body = row
            .body
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| ReplicationError::InvalidDocument(format!("{}: unserializable body: {}", tree.doc_id(), e)))?;

        sqlx::query(
            r#"
            INSERT INTO revisions (doc_id, rev, generation, parent_rev, deleted, body)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(doc_id, rev) DO UPDATE SET
                parent_rev = excluded.parent_rev,
                deleted = excluded.deleted,
                body = excluded.body
            "#,
        )
        .bind(tree.doc_id())
        .bind(row.rev.to_string())
        .bind(i64::try_from(row.rev.generation).unwrap_or(i64::MAX))
        .bind(row.parent.as_ref().map(|p| p.to_string()))
        .bind(row.deleted)
        .bind(body)
        .execute(&mut *conn)
        .await?;
    }

    if outcome.added_leaf {
        if let Some(winner) = tree.winner() {
            sqlx::query("INSERT INTO changes (doc_id, rev, deleted) VALUES (?, ?, ?)")
                .bind(tree.doc_id())
                .bind(winner.rev.to_string())
                .bind(winner.deleted)
                .execute(&mut *conn)
                .await?;
        }
    }

    Ok(())
}

fn parse_stored_rev(id: &str, rev: &str) -> Result<Revision> {
    rev.parse()
        .map_err(|_| ReplicationError::corruption(id, format!("unparseable stored revision {:?}", rev)))
}

/// Store names become file names.
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(ReplicationError::Config(format!("Invalid store name {:?}", name)))
    }
}

/// The database file and its WAL/SHM companions.
fn database_files(path: &Path) -> Vec<PathBuf> {
    let base = path.as_os_str().to_os_string();
    let mut files = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut name = base.clone();
        name.push(suffix);
        files.push(PathBuf::from(name));
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn rev(s: &str) -> Revision {
        s.parse().unwrap()
    }

    async fn store() -> LocalStore {
        LocalStore::open_in_memory("test").await.unwrap()
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = store().await;
        let put = store
            .put(Document::from_json("teams/alpha", json!({"name": "Alpha"})))
            .await
            .unwrap();
        assert!(put.ok);
        assert_eq!(put.rev.generation, 1);

        let doc = store.get("teams/alpha").await.unwrap();
        assert_eq!(doc.rev, Some(put.rev));
        assert_eq!(doc.get("name"), Some(&json!("Alpha")));
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let store = store().await;
        assert!(matches!(store.get("nope").await, Err(ReplicationError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_update_requires_parent() {
        let store = store().await;
        store.put(Document::from_json("m", json!({"score": "0-0"}))).await.unwrap();

        let err = store
            .put(Document::from_json("m", json!({"score": "1-0"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Conflict { .. }));

        let err = store
            .put(Document::from_json("m", json!({})).with_rev(rev("1-ffff")))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_update_chain() {
        let store = store().await;
        let first = store.put(Document::from_json("m", json!({"score": "0-0"}))).await.unwrap();
        let second = store
            .put(Document::from_json("m", json!({"score": "0-1"})).with_rev(first.rev.clone()))
            .await
            .unwrap();
        assert_eq!(second.rev.generation, 2);

        let doc = store.fetch_revision("m", &second.rev).await.unwrap();
        assert_eq!(
            doc.revisions.unwrap().to_path().unwrap(),
            vec![second.rev.clone(), first.rev.clone()]
        );
        assert_eq!(store.info().await.unwrap().update_seq, 2);
    }

    #[tokio::test]
    async fn test_identical_edit_is_idempotent() {
        let store = store().await;
        let first = store.put(Document::from_json("m", json!({"v": 1}))).await.unwrap();
        let edit = Document::from_json("m", json!({"v": 2})).with_rev(first.rev.clone());

        let a = store.put(edit.clone()).await.unwrap();
        let seq_after_first = store.info().await.unwrap().update_seq;
        let b = store.put(edit).await.unwrap();

        assert_eq!(a.rev, b.rev);
        assert_eq!(store.info().await.unwrap().update_seq, seq_after_first);
        assert!(store.conflicts("m").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_parent_creates_branch() {
        let store = store().await;
        let root = store.put(Document::from_json("m", json!({"v": 0}))).await.unwrap();
        let a = store
            .put(Document::from_json("m", json!({"v": "a"})).with_rev(root.rev.clone()))
            .await
            .unwrap();
        let b = store
            .put(Document::from_json("m", json!({"v": "b"})).with_rev(root.rev.clone()))
            .await
            .unwrap();

        let tree = store.revision_tree("m").await.unwrap();
        assert_eq!(tree.leaf_revs().len(), 2);

        let winner = std::cmp::max(a.rev.clone(), b.rev.clone());
        let loser = std::cmp::min(a.rev, b.rev);
        assert_eq!(store.get("m").await.unwrap().rev, Some(winner));
        assert_eq!(store.conflicts("m").await.unwrap(), vec![loser]);
    }

    #[tokio::test]
    async fn test_delete_and_recreate() {
        let store = store().await;
        let put = store.put(Document::from_json("m", json!({"v": 1}))).await.unwrap();
        let deleted = store.delete("m", put.rev).await.unwrap();
        assert_eq!(deleted.rev.generation, 2);

        assert!(matches!(store.get("m").await, Err(ReplicationError::NotFound { .. })));
        let tombstone = store.fetch_revision("m", &deleted.rev).await.unwrap();
        assert!(tombstone.deleted);
        assert_eq!(store.info().await.unwrap().doc_count, 0);

        // No parent needed on top of a tombstone.
        let again = store.put(Document::from_json("m", json!({"v": 2}))).await.unwrap();
        assert_eq!(again.rev.generation, 3);
        assert_eq!(store.info().await.unwrap().doc_count, 1);
    }

    #[tokio::test]
    async fn test_changes_newest_per_document() {
        let store = store().await;
        let a = store.put(Document::from_json("a", json!({"v": 1}))).await.unwrap();
        store.put(Document::from_json("b", json!({"v": 1}))).await.unwrap();
        store
            .put(Document::from_json("a", json!({"v": 2})).with_rev(a.rev))
            .await
            .unwrap();

        let page = store.changes_since(0, 10).await.unwrap();
        let ids: Vec<&str> = page.results.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(page.results[1].seq, 3);
        assert_eq!(page.last_seq, 3);

        let empty = store.changes_since(3, 10).await.unwrap();
        assert!(empty.results.is_empty());
        assert_eq!(empty.last_seq, 3);
    }

    #[tokio::test]
    async fn test_changes_limit() {
        let store = store().await;
        for i in 0..5 {
            store.put(Document::from_json(format!("d{}", i), json!({}))).await.unwrap();
        }
        let page = store.changes_since(1, 2).await.unwrap();
        assert_eq!(page.results.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_replicated_write_with_history() {
        let store = store().await;
        let mut doc = Document::from_json("m", json!({"v": 3})).with_rev(rev("3-cc"));
        doc.revisions = RevisionHistory::from_path(&[rev("3-cc"), rev("2-bb"), rev("1-aa")]);

        let results = store.bulk_put(vec![doc.clone()], false).await.unwrap();
        assert!(results[0].is_ok());
        assert_eq!(results[0].rev, Some(rev("3-cc")));

        let tree = store.revision_tree("m").await.unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(store.get("m").await.unwrap().get("v"), Some(&json!(3)));

        // Ancestors without bodies cannot be fetched.
        assert!(matches!(
            store.fetch_revision("m", &rev("2-bb")).await,
            Err(ReplicationError::NotFound { .. })
        ));

        // Replaying is a no-op that still reports success.
        let seq = store.info().await.unwrap().update_seq;
        let again = store.bulk_put(vec![doc], false).await.unwrap();
        assert!(again[0].is_ok());
        assert_eq!(store.info().await.unwrap().update_seq, seq);
    }

    #[tokio::test]
    async fn test_bulk_put_reports_per_document_failures() {
        let store = store().await;
        let good = Document::from_json("good", json!({"v": 1})).with_rev(rev("1-aa"));
        let no_rev = Document::from_json("no-rev", json!({"v": 1}));
        let bad_id = Document::from_json("_bad", json!({})).with_rev(rev("1-aa"));

        let results = store.bulk_put(vec![good, no_rev, bad_id], false).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert_eq!(results[1].error.as_deref(), Some("bad_request"));
        assert_eq!(results[2].error.as_deref(), Some("bad_request"));
        assert_eq!(store.info().await.unwrap().update_seq, 1);
    }

    #[tokio::test]
    async fn test_bulk_put_new_edits() {
        let store = store().await;
        let results = store
            .bulk_put(
                vec![
                    Document::from_json("a", json!({"v": 1})),
                    Document::from_json("b", json!({"v": 1})),
                ],
                true,
            )
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.is_ok()));

        // Second round without parents conflicts.
        let results = store
            .bulk_put(vec![Document::from_json("a", json!({"v": 2}))], true)
            .await
            .unwrap();
        assert_eq!(results[0].error.as_deref(), Some("conflict"));
    }

    #[tokio::test]
    async fn test_revs_diff() {
        let store = store().await;
        let put = store.put(Document::from_json("a", json!({}))).await.unwrap();

        let mut query = RevsDiff::new();
        query.insert("a".to_string(), vec![put.rev.clone(), rev("2-zz")]);
        query.insert("unknown".to_string(), vec![rev("1-aa")]);

        let missing = store.revs_diff(query).await.unwrap();
        assert_eq!(missing.get("a"), Some(&vec![rev("2-zz")]));
        assert_eq!(missing.get("unknown"), Some(&vec![rev("1-aa")]));

        let mut known = RevsDiff::new();
        known.insert("a".to_string(), vec![put.rev]);
        assert!(store.revs_diff(known).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_all_docs() {
        let store = store().await;
        store.put(Document::from_json("a", json!({"v": 1}))).await.unwrap();

        let rows = store
            .all_docs(vec!["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(rows[0].doc.as_ref().unwrap().get("v"), Some(&json!(1)));
        assert_eq!(rows[1].error.as_deref(), Some("not_found"));
    }

    #[tokio::test]
    async fn test_invalid_documents_rejected() {
        let store = store().await;
        let err = store.put(Document::from_json("", json!({}))).await.unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidDocument(_)));

        let mut doc = Document::from_json("ok", json!({}));
        doc.fields.insert("_secret".to_string(), json!(1));
        assert!(matches!(store.put(doc).await, Err(ReplicationError::InvalidDocument(_))));
    }

    #[tokio::test]
    async fn test_corrupt_tree_surfaces() {
        let store = store().await;
        sqlx::query(
            "INSERT INTO revisions (doc_id, rev, generation, parent_rev, deleted, body) VALUES ('x', '2-bb', 2, '1-aa', 0, '{}')",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        assert!(matches!(store.get("x").await, Err(ReplicationError::StoreCorruption { .. })));
        let doc = Document::from_json("x", json!({})).with_rev(rev("2-bb"));
        assert!(matches!(
            store.bulk_put(vec![doc], false).await,
            Err(ReplicationError::StoreCorruption { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_store_persists_and_destroys() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new("league", dir.path().to_string_lossy().to_string());

        let instance_id = {
            let store = LocalStore::open(&config).await.unwrap();
            store.put(Document::from_json("a", json!({"v": 1}))).await.unwrap();
            let id = store.instance_id().to_string();
            store.close().await;
            id
        };

        let store = LocalStore::open(&config).await.unwrap();
        assert_eq!(store.instance_id(), instance_id);
        assert_eq!(store.info().await.unwrap().doc_count, 1);

        store.destroy().await.unwrap();
        assert!(!config.database_path().exists());

        let fresh = LocalStore::open(&config).await.unwrap();
        assert_ne!(fresh.instance_id(), instance_id);
        assert_eq!(fresh.info().await.unwrap().update_seq, 0);
        fresh.destroy().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_checkpoint_saves_do_not_break_concurrent_writes() {
        use crate::checkpoint::CheckpointKey;
        use crate::coordinator::Direction;

        let dir = tempdir().unwrap();
        let mut config = StoreConfig::new("league", dir.path().to_string_lossy().to_string());
        config.max_connections = 4;
        let store = Arc::new(LocalStore::open(&config).await.unwrap());

        let info = store.info().await.unwrap();
        let mut remote = info.clone();
        remote.name = "hq".to_string();
        remote.instance_id = "hq-instance".to_string();
        let key = CheckpointKey::new(&info, &remote, Direction::Push);

        let saver = {
            let store = store.clone();
            tokio::spawn(async move {
                for seq in 1..=1000u64 {
                    store.checkpoints().save(&key, seq).await?;
                }
                Ok::<_, ReplicationError>(())
            })
        };

        for i in 0..250 {
            store
                .put(Document::from_json(format!("m{:03}", i), json!({"i": i})))
                .await
                .unwrap_or_else(|e| panic!("put m{:03} failed: {}", i, e));
        }
        saver.await.unwrap().unwrap();

        assert_eq!(store.info().await.unwrap().doc_count, 250);
        store.close().await;
    }

    #[tokio::test]
    async fn test_invalid_store_name() {
        assert!(matches!(
            LocalStore::open_in_memory("../etc").await,
            Err(ReplicationError::Config(_))
        ));
        assert!(LocalStore::open_in_memory("").await.is_err());
    }

    #[test]
    fn test_database_files() {
        let files = database_files(Path::new("/tmp/x.sqlite3"));
        assert_eq!(files[0], PathBuf::from("/tmp/x.sqlite3"));
        assert!(files.contains(&PathBuf::from("/tmp/x.sqlite3-wal")));
        assert!(files.contains(&PathBuf::from("/tmp/x.sqlite3-shm")));
    }
}
