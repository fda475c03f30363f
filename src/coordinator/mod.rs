// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The orchestrator that ties together:
//! - The local store via [`crate::store::LocalStore`]
//! - Remote stores via [`crate::store::DocumentStore`] (usually
//!   [`crate::transport::HttpStore`])
//! - Change feeds via [`crate::changes::ChangeFeed`]
//! - Checkpoints via [`crate::checkpoint::CheckpointStore`]
//!
//! # Directions
//!
//! | Call | Source | Target |
//! |------|--------|--------|
//! | [`replicate_from`](ReplicationEngine::replicate_from) | remote | local |
//! | [`replicate_to`](ReplicationEngine::replicate_to) | local | remote |
//! | [`sync`](ReplicationEngine::sync) | pull, then push | |
//!
//! # Concurrency
//!
//! At most one run per (source instance, target instance, direction) is in
//! flight. A second concurrent request for the same pair fails fast with
//! [`ReplicationError::AlreadyRunning`]; runs for different pairs proceed
//! independently.

mod run;
mod types;

pub use types::{Direction, ReplicationOptions, ReplicationResult, RunState, SyncResult};

use crate::batch::BatchConfig;
use crate::checkpoint::CheckpointKey;
use crate::config::{RemoteConfig, ReplicationConfig, ReplicationSettings};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::with_timeout;
use crate::store::{DocumentStore, LocalStore};
use crate::transport::HttpStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, Instrument};

/// Registration of an in-flight run. Dropping it frees the pair.
struct InFlightGuard {
    registry: Arc<DashMap<CheckpointKey, ()>>,
    key: CheckpointKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.key);
    }
}

/// The replication engine.
///
/// Owns the local store and replicates it with remotes on request. Runs
/// are driven by the caller; the engine keeps no background tasks.
pub struct ReplicationEngine {
    /// Local store (documents and checkpoints)
    local: Arc<LocalStore>,

    /// Batch sizes, timeouts, SLOs
    settings: ReplicationSettings,

    /// Configured remotes, looked up by [`remote`](Self::remote)
    remotes: Vec<RemoteConfig>,

    /// Runs currently in flight
    in_flight: Arc<DashMap<CheckpointKey, ()>>,
}

impl ReplicationEngine {
    /// Create an engine around an open local store.
    pub fn new(local: Arc<LocalStore>, settings: ReplicationSettings) -> Self {
        Self {
            local,
            settings,
            remotes: Vec::new(),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Open the configured local store and build an engine for it.
    pub async fn from_config(config: &ReplicationConfig) -> Result<Self> {
        let local = Arc::new(LocalStore::open(&config.local).await?);
        let mut engine = Self::new(local, config.settings.clone());
        engine.remotes = config.remotes.clone();
        info!(
            local = %config.local.name,
            remotes = engine.remotes.len(),
            "Replication engine ready"
        );
        Ok(engine)
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    pub fn settings(&self) -> &ReplicationSettings {
        &self.settings
    }

    /// Number of runs currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// An HTTP store for the named remote from the configuration.
    pub fn remote(&self, name: &str) -> Result<Arc<dyn DocumentStore>> {
        let config = self
            .remotes
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| ReplicationError::Config(format!("unknown remote {:?}", name)))?;
        let store = HttpStore::new(config)?.with_slo(self.settings.slo.clone());
        Ok(Arc::new(store))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entry points
    // ─────────────────────────────────────────────────────────────────────────

    /// Pull: replicate `remote` into the local store.
    pub async fn replicate_from(&self, remote: Arc<dyn DocumentStore>) -> Result<ReplicationResult> {
        self.replicate_from_with(remote, ReplicationOptions::default()).await
    }

    pub async fn replicate_from_with(
        &self,
        remote: Arc<dyn DocumentStore>,
        options: ReplicationOptions,
    ) -> Result<ReplicationResult> {
        let local: Arc<dyn DocumentStore> = self.local.clone();
        self.replicate(remote, local, Direction::Pull, options).await
    }

    /// Push: replicate the local store into `remote`.
    pub async fn replicate_to(&self, remote: Arc<dyn DocumentStore>) -> Result<ReplicationResult> {
        self.replicate_to_with(remote, ReplicationOptions::default()).await
    }

    pub async fn replicate_to_with(
        &self,
        remote: Arc<dyn DocumentStore>,
        options: ReplicationOptions,
    ) -> Result<ReplicationResult> {
        let local: Arc<dyn DocumentStore> = self.local.clone();
        self.replicate(local, remote, Direction::Push, options).await
    }

    /// Pull then push. A failed pull skips the push; a failed push comes
    /// back as [`ReplicationError::PushFailed`] carrying the pull's result.
    pub async fn sync(&self, remote: Arc<dyn DocumentStore>) -> Result<SyncResult> {
        let pull = self.replicate_from(Arc::clone(&remote)).await?;
        match self.replicate_to(remote).await {
            Ok(push) => Ok(SyncResult { pull, push }),
            Err(e) => Err(ReplicationError::PushFailed {
                pull: Box::new(pull),
                source: Box::new(e),
            }),
        }
    }

    /// Replicate `source` into `target`.
    ///
    /// Checkpoints are kept in the local store whichever way documents flow.
    pub async fn replicate(
        &self,
        source: Arc<dyn DocumentStore>,
        target: Arc<dyn DocumentStore>,
        direction: Direction,
        options: ReplicationOptions,
    ) -> Result<ReplicationResult> {
        let timeout = options
            .operation_timeout
            .unwrap_or_else(|| self.settings.operation_timeout_duration());

        let started = Instant::now();
        run::set_state(&options, direction, RunState::Idle);
        let infos = async {
            let source_info = with_timeout("info", timeout, source.info()).await?;
            let target_info = with_timeout("info", timeout, target.info()).await?;
            Ok::<_, ReplicationError>((source_info, target_info))
        }
        .await;
        let (source_info, target_info) = match infos {
            Ok(infos) => infos,
            Err(e) => return Err(self.fail(&options, direction, started, e)),
        };

        let key = CheckpointKey::new(&source_info, &target_info, direction);
        let _guard = self.register(&key)?;

        let span = info_span!(
            "replication",
            direction = %direction,
            source = %source_info.name,
            target = %target_info.name
        );

        let plan = run::RunPlan {
            source,
            target,
            source_info,
            key,
            checkpoints: self.local.checkpoints(),
            batch_size: options.batch_size.unwrap_or(self.settings.batch.batch_size).max(1),
            batch: BatchConfig {
                max_concurrent_fetches: self.settings.batch.max_concurrent_fetches,
                operation_timeout: timeout,
                slo: self.settings.slo.clone(),
            },
        };

        match run::run(plan, &options).instrument(span).await {
            Ok(result) => Ok(result),
            Err(e) => Err(self.fail(&options, direction, started, e)),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Checkpoints
    // ─────────────────────────────────────────────────────────────────────────

    /// Persisted checkpoint for replicating `source` into `target`.
    pub async fn checkpoint(
        &self,
        source: &dyn DocumentStore,
        target: &dyn DocumentStore,
        direction: Direction,
    ) -> Result<u64> {
        let key = CheckpointKey::new(&source.info().await?, &target.info().await?, direction);
        self.local.checkpoints().load(&key).await
    }

    /// Forget the checkpoint so the next run starts from sequence 0.
    pub async fn reset_checkpoint(
        &self,
        source: &dyn DocumentStore,
        target: &dyn DocumentStore,
        direction: Direction,
    ) -> Result<()> {
        let key = CheckpointKey::new(&source.info().await?, &target.info().await?, direction);
        self.local.checkpoints().reset(&key).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    fn register(&self, key: &CheckpointKey) -> Result<InFlightGuard> {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => {
                metrics::record_run_rejected(key.direction.as_str());
                Err(ReplicationError::AlreadyRunning {
                    source_name: key.source_name.clone(),
                    target_name: key.target_name.clone(),
                    direction: key.direction.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(InFlightGuard {
                    registry: Arc::clone(&self.in_flight),
                    key: key.clone(),
                })
            }
        }
    }

    /// Record a failed run and hand the error back.
    fn fail(
        &self,
        options: &ReplicationOptions,
        direction: Direction,
        started: Instant,
        err: ReplicationError,
    ) -> ReplicationError {
        run::set_state(options, direction, RunState::Failed);
        metrics::record_error(direction.as_str(), err.kind());
        metrics::record_run_outcome(direction.as_str(), "failed", started.elapsed());
        error!(direction = %direction, error = %err, "Replication failed");
        err
    }
}
