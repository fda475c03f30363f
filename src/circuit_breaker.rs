// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breakers in front of a remote store.
//!
//! A remote that refuses connections or keeps answering 5xx would otherwise
//! eat the whole retry budget of every request in a run. Each remote gets two
//! `recloser` circuits, one for reads and one for writes:
//!
//! ```text
//!            window full, ≥50% failed
//!   Closed ───────────────────────────► Open ──┐
//!     ▲                                   ▲     │ recovery_timeout
//!     │ probes succeed                    │     ▼
//!     └────────────────────────────── HalfOpen
//!                         probe fails ───┘
//! ```
//!
//! Only transport-class errors ([`ReplicationError::is_transport`]) count as
//! failures. A 404, 409 or 400 is a healthy remote giving a domain answer
//! and passes straight through. A call rejected by an open circuit comes
//! back as a `Transport` error naming the circuit, so the engine treats it
//! like a dead connection.

use crate::config::RemoteConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Calls in the window that decides whether to trip.
    pub failure_threshold: u32,
    /// Probe calls let through while half-open.
    pub success_threshold: u32,
    /// Time spent open before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    pub fn from_remote(remote: &RemoteConfig) -> Self {
        Self {
            failure_threshold: remote.circuit_failure_threshold.max(1),
            success_threshold: 2,
            recovery_timeout: remote.circuit_reset_timeout(),
        }
    }

    #[cfg(test)]
    fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// One named circuit with call counters.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// The circuit opens once at least half of the last `failure_threshold`
    /// calls failed.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(0.5)
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run one store request through the circuit.
    pub async fn protect<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        // Domain errors are successes as far as the circuit is concerned.
        let guarded = async move {
            match f().await {
                Err(e) if e.is_transport() => Err(e),
                other => Ok(other),
            }
        };

        match self.inner.call(guarded).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "success");
                metrics::set_circuit_state(&self.name, "closed");
                result
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_rejection(&self.name);
                metrics::set_circuit_state(&self.name, "open");
                warn!(circuit = %self.name, operation, "Circuit open, request not sent");
                Err(ReplicationError::transport_msg(
                    operation,
                    format!("circuit {} is open", self.name),
                ))
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, operation, error = %e, "Request failed");
                Err(e)
            }
        }
    }

    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Calls that reached the remote and got an answer, including domain errors.
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Calls that reached the remote and failed at the transport level.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Calls refused without being sent.
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// More rejections than successes so far.
    pub fn is_likely_open(&self) -> bool {
        self.rejections() > 0 && self.rejections() > self.successes()
    }
}

/// Circuits guarding one remote store.
///
/// Reads (`GET /{db}`, `_changes`, `_revs_diff`, `_all_docs`, document
/// fetches) and writes (`_bulk_docs`, `PUT`) trip independently.
pub struct RemoteCircuit {
    pub writes: CircuitBreaker,
    pub reads: CircuitBreaker,
}

impl RemoteCircuit {
    pub fn for_remote(remote: &RemoteConfig) -> Self {
        let config = CircuitConfig::from_remote(remote);
        Self {
            writes: CircuitBreaker::new(format!("{}-writes", remote.name), config.clone()),
            reads: CircuitBreaker::new(format!("{}-reads", remote.name), config),
        }
    }
}
