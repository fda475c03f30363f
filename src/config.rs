// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for stores, remotes and replication runs.
//!
//! Configuration can be constructed programmatically or deserialized from
//! YAML/JSON. Every field has a serde default, so a config file only needs
//! the values it changes.
//!
//! # Quick Start
//!
//! ```rust
//! use revsync::config::{ReplicationConfig, RemoteConfig};
//!
//! let config = ReplicationConfig {
//!     remotes: vec![RemoteConfig::for_testing("league", "http://127.0.0.1:5984/league")],
//!     ..Default::default()
//! };
//! assert_eq!(config.settings.batch.batch_size, 100);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── local: StoreConfig            # SQLite document store
//! ├── settings: ReplicationSettings
//! │   ├── batch: BatchSettings      # batch size, fetch concurrency
//! │   ├── operation_timeout         # per store call
//! │   └── slo: SloConfig            # latency thresholds
//! ├── remotes: Vec<RemoteConfig>    # HTTP stores
//! └── server: ServerConfig          # HTTP exposure of the local store
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! local:
//!   name: "league"
//!   data_dir: "/var/lib/revsync"
//!
//! settings:
//!   batch:
//!     batch_size: 200
//!     max_concurrent_fetches: 16
//!   operation_timeout: "10s"
//!
//! remotes:
//!   - name: "hq"
//!     url: "https://hq.example.com/league"
//!     timeout: "15s"
//! ```

use crate::resilience::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// The local document store.
    #[serde(default)]
    pub local: StoreConfig,

    /// Tunables for replication runs.
    #[serde(default)]
    pub settings: ReplicationSettings,

    /// Remote stores this node replicates with.
    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,

    /// HTTP exposure of the local store.
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            local: StoreConfig::default(),
            settings: ReplicationSettings::default(),
            remotes: Vec::new(),
            server: ServerConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(local_name: &str) -> Self {
        Self {
            local: StoreConfig::in_memory(local_name),
            settings: ReplicationSettings::for_testing(),
            remotes: Vec::new(),
            server: ServerConfig::for_testing(),
        }
    }

    /// Look up a remote by name.
    pub fn remote(&self, name: &str) -> Option<&RemoteConfig> {
        self.remotes.iter().find(|r| r.name == name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings applied to every replication run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub batch: BatchSettings,

    /// Deadline for any single store call, as a duration string (e.g. "30s").
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout: String,

    #[serde(default)]
    pub slo: SloConfig,
}

fn default_operation_timeout() -> String {
    "30s".to_string()
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            batch: BatchSettings::default(),
            operation_timeout: default_operation_timeout(),
            slo: SloConfig::default(),
        }
    }
}

impl ReplicationSettings {
    /// Small batches and short deadlines for tests.
    pub fn for_testing() -> Self {
        Self {
            batch: BatchSettings {
                batch_size: 10,
                max_concurrent_fetches: 4,
            },
            operation_timeout: "5s".to_string(),
            slo: SloConfig::default(),
        }
    }

    /// Parse the operation_timeout string to a Duration.
    pub fn operation_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.operation_timeout).unwrap_or(Duration::from_secs(30))
    }
}

/// Batch sizing for the change feed and fetch fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Changes read per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum revisions fetched from the source at once.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
}

fn default_batch_size() -> usize {
    100
}

fn default_max_concurrent_fetches() -> usize {
    8
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SloConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Latency thresholds. Violations are logged and counted, never enforced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloConfig {
    /// Maximum acceptable time to diff, fetch and write one batch (ms).
    #[serde(default = "default_max_batch_latency_ms")]
    pub max_batch_latency_ms: u64,

    /// Maximum acceptable single remote request latency (ms).
    #[serde(default = "default_max_remote_op_latency_ms")]
    pub max_remote_op_latency_ms: u64,
}

fn default_max_batch_latency_ms() -> u64 {
    2_000
}

fn default_max_remote_op_latency_ms() -> u64 {
    500
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            max_batch_latency_ms: default_max_batch_latency_ms(),
            max_remote_op_latency_ms: default_max_remote_op_latency_ms(),
        }
    }
}

impl SloConfig {
    pub fn is_batch_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_batch_latency_ms
    }

    pub fn is_remote_op_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_remote_op_latency_ms
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: the local SQLite store
// ═══════════════════════════════════════════════════════════════════════════════

/// Local document store configuration.
///
/// The database lives at `<data_dir>/<name>.sqlite3`. A `data_dir` of
/// `":memory:"` keeps the store in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub name: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_data_dir() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    4
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            data_dir: default_data_dir(),
            wal_mode: true,
            max_connections: default_max_connections(),
        }
    }
}

impl StoreConfig {
    pub const MEMORY: &'static str = ":memory:";

    /// File-backed store under `data_dir`.
    pub fn new(name: &str, data_dir: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Create an in-memory config for testing.
    pub fn in_memory(name: &str) -> Self {
        Self {
            name: name.to_string(),
            data_dir: Self::MEMORY.to_string(),
            wal_mode: false,
            max_connections: 1,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.data_dir == Self::MEMORY
    }

    /// Path of the database file (meaningless for in-memory stores).
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(format!("{}.sqlite3", self.name))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RemoteConfig: one entry per HTTP store
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a remote store reached over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Name used in logs and metrics.
    pub name: String,

    /// Database URL, e.g. `"http://host:5984/league"`.
    pub url: String,

    /// Per-request timeout as a duration string.
    #[serde(default = "default_remote_timeout")]
    pub timeout: String,

    /// Attempts for retryable requests (1 = no retry).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Number of consecutive failures before circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long to wait before trying again after circuit opens (seconds).
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout_sec: u64,

    /// Enable client-side request rate limiting.
    #[serde(default)]
    pub rate_limit_enabled: bool,

    /// Maximum requests per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Maximum burst size for rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_remote_timeout() -> String {
    "30s".to_string()
}

fn default_max_attempts() -> usize {
    3
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> u64 {
    30
}

fn default_rate_limit_per_sec() -> u32 {
    200
}

fn default_rate_limit_burst() -> u32 {
    50
}

impl RemoteConfig {
    /// Create a remote config for testing.
    pub fn for_testing(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            timeout: "2s".to_string(),
            max_attempts: 2,
            circuit_failure_threshold: 5,
            circuit_reset_timeout_sec: 1,
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }

    /// Parse the timeout string to a Duration.
    pub fn timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn circuit_reset_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_reset_timeout_sec)
    }

    /// Create rate limit configuration.
    ///
    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ServerConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// HTTP exposure of the local store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind, e.g. `"0.0.0.0:5984"`. Port 0 picks a free port.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Largest accepted request body, in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:5984".to_string()
}

fn default_max_body_bytes() -> u64 {
    16 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
