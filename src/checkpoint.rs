// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for replication runs.
//!
//! Stores the last replicated source sequence for each
//! (source instance, target instance, direction) in the local store's
//! SQLite database, so an interrupted run resumes where the previous one
//! left off.
//!
//! # Write-Through
//!
//! A checkpoint is only saved after a batch has been durably written to
//! the target, and `save()` returns only once the row is on disk. A crash after the target write but before the save
//! re-sends that batch on the next run, which is harmless: revisions the
//! target already has are filtered out by `revs_diff`.
//!
//! ```text
//! write batch to target → save checkpoint 1234
//!                         (crash here = re-diff from previous checkpoint)
//! ```
//!
//! # Monotonicity
//!
//! `save()` never lowers a stored sequence (the upsert keeps the
//! `MAX` of old and new). Only [`CheckpointStore::reset`] moves one back.
//!
//! # Keys
//!
//! Keys use store instance ids, not names. A store that is destroyed and
//! recreated under the same name gets a new instance id, so replication
//! against it starts again from sequence 0.

use crate::coordinator::Direction;
use crate::error::Result;
use crate::store::sqlite::execute_with_retry;
use crate::store::StoreInfo;
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Identifies one replication relationship.
///
/// Equality and hashing use the instance ids and direction only; the names
/// are carried for logs and diagnostics.
#[derive(Debug, Clone)]
pub struct CheckpointKey {
    pub source_id: String,
    pub target_id: String,
    pub direction: Direction,
    pub source_name: String,
    pub target_name: String,
}

impl CheckpointKey {
    pub fn new(source: &StoreInfo, target: &StoreInfo, direction: Direction) -> Self {
        Self {
            source_id: source.instance_id.clone(),
            target_id: target.instance_id.clone(),
            direction,
            source_name: source.name.clone(),
            target_name: target.name.clone(),
        }
    }
}

impl PartialEq for CheckpointKey {
    fn eq(&self, other: &Self) -> bool {
        self.source_id == other.source_id
            && self.target_id == other.target_id
            && self.direction == other.direction
    }
}

impl Eq for CheckpointKey {}

impl Hash for CheckpointKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source_id.hash(state);
        self.target_id.hash(state);
        self.direction.hash(state);
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.source_name, self.target_name, self.direction)
    }
}

/// A stored checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub source_id: String,
    pub target_id: String,
    pub direction: String,
    pub source_name: String,
    pub target_name: String,
    /// Last replicated source sequence.
    pub seq: u64,
    /// Unix millis of the last save.
    pub updated_at: i64,
}

/// Persistent checkpoint storage backed by the local store's SQLite pool.
///
/// Reads are served from an in-memory cache filled lazily per key. Saves
/// and resets take the same writer lock as document writes, so a checkpoint
/// commit never lands inside a document transaction.
pub struct CheckpointStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
    cache: Arc<RwLock<HashMap<CheckpointKey, u64>>>,
}

impl CheckpointStore {
    #[cfg(test)]
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self::with_writer(pool, Arc::new(Mutex::new(())))
    }

    pub(crate) fn with_writer(pool: SqlitePool, writer: Arc<Mutex<()>>) -> Self {
        Self {
            pool,
            writer,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Last replicated sequence for `key`, or 0 when none was saved.
    pub async fn load(&self, key: &CheckpointKey) -> Result<u64> {
        if let Some(seq) = self.cache.read().await.get(key) {
            return Ok(*seq);
        }

        let pool = &self.pool;
        let row: Option<(i64,)> = execute_with_retry("checkpoint_load", || async {
            sqlx::query_as(
                "SELECT seq FROM checkpoints WHERE source_id = ? AND target_id = ? AND direction = ?",
            )
            .bind(&key.source_id)
            .bind(&key.target_id)
            .bind(key.direction.as_str())
            .fetch_optional(pool)
            .await
        })
        .await?;

        let seq = row.map(|(s,)| s.max(0) as u64).unwrap_or(0);
        if row.is_some() {
            debug!(checkpoint = %key, seq, "Loaded checkpoint from disk");
        }
        self.cache.write().await.insert(key.clone(), seq);
        Ok(seq)
    }

    /// Persist `seq` for `key`.
    ///
    /// Returns once the row is written. A lower `seq` than the stored one
    /// leaves the stored value unchanged. Returns the value now stored.
    /// Retries on SQLITE_BUSY/SQLITE_LOCKED with exponential backoff.
    pub async fn save(&self, key: &CheckpointKey, seq: u64) -> Result<u64> {
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        let seq_i64 = i64::try_from(seq).unwrap_or(i64::MAX);

        let _writer = self.writer.lock().await;
        let (stored,): (i64,) = execute_with_retry("checkpoint_save", || async {
            sqlx::query_as(
                r#"
                INSERT INTO checkpoints
                    (source_id, target_id, direction, source_name, target_name, seq, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(source_id, target_id, direction) DO UPDATE SET
                    seq = MAX(checkpoints.seq, excluded.seq),
                    source_name = excluded.source_name,
                    target_name = excluded.target_name,
                    updated_at = excluded.updated_at
                RETURNING seq
                "#,
            )
            .bind(&key.source_id)
            .bind(&key.target_id)
            .bind(key.direction.as_str())
            .bind(&key.source_name)
            .bind(&key.target_name)
            .bind(seq_i64)
            .bind(now)
            .fetch_one(pool)
            .await
        })
        .await?;

        let stored = stored.max(0) as u64;
        self.cache.write().await.insert(key.clone(), stored);
        debug!(checkpoint = %key, seq = stored, "Checkpoint saved");
        Ok(stored)
    }

    /// Forget the checkpoint for `key`; the next run starts from 0.
    pub async fn reset(&self, key: &CheckpointKey) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.cache.write().await.remove(key);

        let pool = &self.pool;
        execute_with_retry("checkpoint_reset", || async {
            sqlx::query("DELETE FROM checkpoints WHERE source_id = ? AND target_id = ? AND direction = ?")
                .bind(&key.source_id)
                .bind(&key.target_id)
                .bind(key.direction.as_str())
                .execute(pool)
                .await
        })
        .await?;

        info!(checkpoint = %key, "Checkpoint reset");
        Ok(())
    }

    /// All stored checkpoints (for diagnostics).
    pub async fn get_all(&self) -> Result<Vec<CheckpointEntry>> {
        let pool = &self.pool;
        let rows: Vec<(String, String, String, String, String, i64, i64)> =
            execute_with_retry("checkpoint_get_all", || async {
                sqlx::query_as(
                    r#"
                    SELECT source_id, target_id, direction, source_name, target_name, seq, updated_at
                    FROM checkpoints
                    ORDER BY source_name, target_name, direction
                    "#,
                )
                .fetch_all(pool)
                .await
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(source_id, target_id, direction, source_name, target_name, seq, updated_at)| CheckpointEntry {
                    source_id,
                    target_id,
                    direction,
                    source_name,
                    target_name,
                    seq: seq.max(0) as u64,
                    updated_at,
                },
            )
            .collect())
    }
}
