// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # revsync
//!
//! Revision-tree document replication between a local SQLite store and
//! remote stores reached over HTTP.
//!
//! ## Architecture
//!
//! Every document keeps a tree of revisions. Replication copies revisions,
//! not documents, so concurrent edits on both ends survive as conflicting
//! branches and every replica picks the same winner:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              revsync                                      │
//! │                                                                           │
//! │  ┌─────────────┐    ┌──────────────┐    ┌──────────────────────────────┐  │
//! │  │ ChangeFeed  │───►│ revs_diff    │───►│ fetch (bulkhead) → bulk_put  │  │
//! │  │ (source)    │    │ (target)     │    │ (new_edits = false)          │  │
//! │  └─────────────┘    └──────────────┘    └──────────────────────────────┘  │
//! │         ▲                                            │                    │
//! │         │                                            ▼                    │
//! │  ┌─────────────────┐                      ┌─────────────────────────┐     │
//! │  │ CheckpointStore │◄─────────────────────│ checkpoint per batch    │     │
//! │  │ (SQLite)        │                      │                         │     │
//! │  └─────────────────┘                      └─────────────────────────┘     │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stores implement [`DocumentStore`]: [`LocalStore`] is SQLite-backed,
//! [`HttpStore`] talks to a remote, and [`StoreServer`] exposes any store
//! over HTTP.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use revsync::{Document, LocalStore, ReplicationEngine, ReplicationSettings};
//! use revsync::store::DocumentStore;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> revsync::Result<()> {
//! let local = Arc::new(LocalStore::open_in_memory("league").await?);
//! let remote = Arc::new(LocalStore::open_in_memory("league-backup").await?);
//! remote.put(Document::from_json("teams/alpha", json!({"name": "Alpha"}))).await?;
//!
//! let engine = ReplicationEngine::new(local, ReplicationSettings::default());
//! let result = engine.replicate_from(remote).await?;
//! assert_eq!(result.docs_written, 1);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod changes;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod metrics;
pub mod resilience;
pub mod rev_tree;
pub mod revision;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, RemoteCircuit};
pub use config::{RemoteConfig, ReplicationConfig, ReplicationSettings, ServerConfig, StoreConfig};
pub use coordinator::{Direction, ReplicationEngine, ReplicationOptions, ReplicationResult, RunState, SyncResult};
pub use document::Document;
pub use error::{ReplicationError, Result};
pub use rev_tree::RevTree;
pub use revision::Revision;
pub use store::{DocumentStore, LocalStore};
pub use transport::{HttpStore, StoreServer};
