// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - In-memory and on-disk store helpers
//! - A recording, failure-injecting store wrapper
//! - In-process HTTP servers on ephemeral ports

#![allow(dead_code)]

pub mod mock_store;

pub use mock_store::*;

use revsync::config::{RemoteConfig, ReplicationSettings, ServerConfig};
use revsync::resilience::RetryConfig;
use revsync::store::{DocumentStore, LocalStore};
use revsync::transport::{HttpStore, StoreServer};
use revsync::ReplicationEngine;
use std::sync::Arc;

/// Install a test subscriber once. `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn memory_store(name: &str) -> Arc<LocalStore> {
    Arc::new(LocalStore::open_in_memory(name).await.expect("open in-memory store"))
}

/// Engine over a fresh in-memory local store.
pub async fn engine(local_name: &str) -> ReplicationEngine {
    ReplicationEngine::new(memory_store(local_name).await, ReplicationSettings::for_testing())
}

/// Serve `store` as database `db` and return the server plus a client for it.
pub async fn serve(db: &str, store: Arc<dyn DocumentStore>) -> (StoreServer, Arc<HttpStore>) {
    let server = StoreServer::start(db, store, &ServerConfig::for_testing())
        .await
        .expect("start store server");
    let client = HttpStore::new(&RemoteConfig::for_testing(db, &server.url()))
        .expect("http store")
        .with_retry(RetryConfig::testing());
    (server, Arc::new(client))
}
