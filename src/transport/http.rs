// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote document store over HTTP.
//!
//! [`HttpStore`] implements [`DocumentStore`] against a database URL such as
//! `http://host:5984/league`. Every request goes through:
//!
//! ```text
//! circuit (reads | writes) → retry (idempotent calls only) → rate limiter → reqwest
//! ```
//!
//! Status mapping: 404 → `NotFound`, 409 → `Conflict`, 400 → `InvalidDocument`,
//! anything else non-2xx → `Transport`. Only `Transport` and `Timeout` count
//! against the circuit, so a burst of missing documents never opens it.
//!
//! Retries cover reads, `_revs_diff` and replicated writes
//! (`_bulk_docs` with `new_edits = false`), which are idempotent. Edits
//! (`PUT`, `_bulk_docs` with `new_edits = true`) are sent once.

use super::{AllDocsResponse, BulkDocsRequest, ErrorBody};
use crate::circuit_breaker::{CircuitBreaker, RemoteCircuit};
use crate::config::{RemoteConfig, SloConfig};
use crate::document::{validate_id, Document};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::{retry, RateLimiter, RetryConfig};
use crate::revision::Revision;
use crate::store::{
    AllDocsRow, BoxFuture, ChangesPage, DocWriteResult, DocumentStore, PutResult, RevsDiff, StoreInfo,
};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A remote store reached over HTTP.
pub struct HttpStore {
    config: RemoteConfig,
    base: Url,
    client: reqwest::Client,
    circuit: RemoteCircuit,
    retry: RetryConfig,
    limiter: Option<RateLimiter>,
    slo: SloConfig,
    timeout: Duration,
}

impl HttpStore {
    /// Create a client for a configured remote. No request is made.
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let base = Url::parse(&config.url)
            .map_err(|e| ReplicationError::Config(format!("remote {}: invalid url {:?}: {}", config.name, config.url, e)))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(ReplicationError::Config(format!(
                "remote {}: {:?} is not an http(s) database url",
                config.name, config.url
            )));
        }

        let timeout = config.timeout_duration();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReplicationError::Config(format!("remote {}: {}", config.name, e)))?;

        let limiter = config.rate_limit_config().map(RateLimiter::new);

        info!(
            remote = %config.name,
            url = %base,
            timeout_ms = timeout.as_millis() as u64,
            rate_limited = limiter.is_some(),
            "Created HTTP store"
        );

        Ok(Self {
            config: config.clone(),
            base,
            client,
            circuit: RemoteCircuit::for_remote(config),
            retry: RetryConfig::for_remote(config.max_attempts),
            limiter,
            slo: SloConfig::default(),
            timeout,
        })
    }

    /// Replace the retry policy for idempotent requests.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the latency thresholds used for SLO warnings.
    pub fn with_slo(mut self, slo: SloConfig) -> Self {
        self.slo = slo;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn url(&self) -> &Url {
        &self.base
    }

    pub fn circuit(&self) -> &RemoteCircuit {
        &self.circuit
    }

    // ─────────────────────────────────────────────────────────────────────────
    // URLs
    // ─────────────────────────────────────────────────────────────────────────

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ReplicationError::Config(format!("{} cannot be a base url", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Document ids may contain `/`; each part becomes its own path segment.
    fn doc_url(&self, id: &str) -> Result<Url> {
        validate_id(id)?;
        let segments: Vec<&str> = id.split('/').collect();
        self.endpoint(&segments)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Requests
    // ─────────────────────────────────────────────────────────────────────────

    /// One attempt of one request.
    async fn send<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        subject: &str,
        method: Method,
        url: &Url,
        body: Option<&Value>,
    ) -> Result<T> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let started = Instant::now();
        let mut request = self.client.request(method, url.clone());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                metrics::record_http_request(&self.config.name, operation, "error", started.elapsed());
                return Err(ReplicationError::transport(operation, e, self.timeout));
            }
        };

        let status = response.status();
        let elapsed = started.elapsed();
        metrics::record_http_request(&self.config.name, operation, status.as_str(), elapsed);
        if self.slo.is_remote_op_violation(elapsed) {
            let latency_ms = elapsed.as_millis() as u64;
            metrics::record_slo_violation(&self.config.name, "remote_op", latency_ms);
            warn!(
                remote = %self.config.name,
                operation,
                latency_ms,
                threshold_ms = self.slo.max_remote_op_latency_ms,
                "Remote request exceeded latency SLO"
            );
        }

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ReplicationError::transport(operation, e, self.timeout));
        }

        let body = response
            .json::<ErrorBody>()
            .await
            .unwrap_or_else(|_| ErrorBody::new(status.as_str(), status.canonical_reason().unwrap_or("unknown")));
        debug!(
            remote = %self.config.name,
            operation,
            status = status.as_u16(),
            error = %body.error,
            "Remote returned error"
        );
        Err(status_error(operation, subject, status, body))
    }

    /// A request through the given circuit, retried per `retry`.
    #[allow(clippy::too_many_arguments)]
    async fn call<T: DeserializeOwned>(
        &self,
        circuit: &CircuitBreaker,
        retry_config: &RetryConfig,
        operation: &'static str,
        subject: &str,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<T> {
        let attempts = AtomicUsize::new(0);
        circuit
            .protect(operation, || async {
                retry(retry_config, operation, || {
                    if attempts.fetch_add(1, Ordering::Relaxed) > 0 {
                        metrics::record_http_retry(&self.config.name, operation);
                    }
                    self.send(operation, subject, method.clone(), &url, body.as_ref())
                })
                .await
            })
            .await
    }

    async fn read<T: DeserializeOwned>(&self, operation: &'static str, subject: &str, url: Url) -> Result<T> {
        self.call(&self.circuit.reads, &self.retry, operation, subject, Method::GET, url, None)
            .await
    }

    async fn fetch_doc(&self, id: &str, rev: Option<&Revision>) -> Result<Document> {
        let mut url = self.doc_url(id)?;
        if let Some(rev) = rev {
            url.query_pairs_mut().append_pair("rev", &rev.to_string());
        }
        let operation = if rev.is_some() { "fetch_revision" } else { "get" };
        self.read::<Document>(operation, id, url)
            .await
            .map_err(|e| match e {
                ReplicationError::NotFound { .. } => ReplicationError::NotFound {
                    id: id.to_string(),
                    rev: rev.map(|r| r.to_string()),
                },
                other => other,
            })
    }
}

fn to_body<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| ReplicationError::InvalidDocument(e.to_string()))
}

/// Map a non-2xx response to the error class the engine acts on.
fn status_error(operation: &str, subject: &str, status: StatusCode, body: ErrorBody) -> ReplicationError {
    match status {
        StatusCode::NOT_FOUND => ReplicationError::not_found(subject),
        StatusCode::CONFLICT => ReplicationError::conflict(subject, body.reason),
        StatusCode::BAD_REQUEST => ReplicationError::InvalidDocument(body.reason),
        // A corrupt remote answers the same way on every attempt.
        StatusCode::INTERNAL_SERVER_ERROR if body.error == "corruption" => {
            ReplicationError::corruption(subject, body.reason)
        }
        _ => ReplicationError::transport_msg(
            operation,
            format!("HTTP {}: {}: {}", status.as_u16(), body.error, body.reason),
        ),
    }
}

impl DocumentStore for HttpStore {
    fn info(&self) -> BoxFuture<'_, StoreInfo> {
        Box::pin(async move {
            let url = self.base.clone();
            self.read("info", &self.config.name, url).await
        })
    }

    fn get(&self, id: &str) -> BoxFuture<'_, Document> {
        let id = id.to_string();
        Box::pin(async move { self.fetch_doc(&id, None).await })
    }

    fn fetch_revision(&self, id: &str, rev: &Revision) -> BoxFuture<'_, Document> {
        let id = id.to_string();
        let rev = rev.clone();
        Box::pin(async move { self.fetch_doc(&id, Some(&rev)).await })
    }

    fn put(&self, doc: Document) -> BoxFuture<'_, PutResult> {
        Box::pin(async move {
            let url = self.doc_url(&doc.id)?;
            let body = to_body(&doc)?;
            self.call(
                &self.circuit.writes,
                &RetryConfig::none(),
                "put",
                &doc.id,
                Method::PUT,
                url,
                Some(body),
            )
            .await
        })
    }

    fn bulk_put(&self, docs: Vec<Document>, new_edits: bool) -> BoxFuture<'_, Vec<DocWriteResult>> {
        Box::pin(async move {
            if docs.is_empty() {
                return Ok(Vec::new());
            }
            let url = self.endpoint(&["_bulk_docs"])?;
            let body = to_body(&BulkDocsRequest { docs, new_edits })?;
            let retry_config = if new_edits { RetryConfig::none() } else { self.retry.clone() };
            self.call(
                &self.circuit.writes,
                &retry_config,
                "bulk_docs",
                &self.config.name,
                Method::POST,
                url,
                Some(body),
            )
            .await
        })
    }

    fn changes_since(&self, since: u64, limit: usize) -> BoxFuture<'_, ChangesPage> {
        Box::pin(async move {
            let mut url = self.endpoint(&["_changes"])?;
            url.query_pairs_mut()
                .append_pair("since", &since.to_string())
                .append_pair("limit", &limit.to_string());
            self.read("changes", &self.config.name, url).await
        })
    }

    fn revs_diff(&self, revs: RevsDiff) -> BoxFuture<'_, RevsDiff> {
        Box::pin(async move {
            if revs.is_empty() {
                return Ok(RevsDiff::new());
            }
            let url = self.endpoint(&["_revs_diff"])?;
            let body = to_body(&revs)?;
            self.call(
                &self.circuit.reads,
                &self.retry,
                "revs_diff",
                &self.config.name,
                Method::POST,
                url,
                Some(body),
            )
            .await
        })
    }

    fn all_docs(&self, keys: Vec<String>) -> BoxFuture<'_, Vec<AllDocsRow>> {
        Box::pin(async move {
            let mut url = self.endpoint(&["_all_docs"])?;
            let keys = serde_json::to_string(&keys).map_err(|e| ReplicationError::Internal(e.to_string()))?;
            url.query_pairs_mut().append_pair("keys", &keys);
            let response: AllDocsResponse = self.read("all_docs", &self.config.name, url).await?;
            Ok(response.rows)
        })
    }
}
