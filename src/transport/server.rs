// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP exposure of a document store.
//!
//! [`routes`] serves any [`DocumentStore`] under `/{db}` with warp, so a
//! [`LocalStore`](crate::store::LocalStore) on one machine becomes an
//! [`HttpStore`](super::HttpStore) remote on another. [`StoreServer`] binds
//! the routes to a socket and shuts them down gracefully.
//!
//! # Example
//!
//! ```rust,no_run
//! use revsync::config::ServerConfig;
//! use revsync::store::LocalStore;
//! use revsync::transport::StoreServer;
//! use std::sync::Arc;
//!
//! # async fn example() -> revsync::Result<()> {
//! let store = Arc::new(LocalStore::open_in_memory("league").await?);
//! let server = StoreServer::start("league", store, &ServerConfig::for_testing()).await?;
//! println!("serving {}", server.url());
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

use super::{AllDocsResponse, BulkDocsRequest, ErrorBody};
use crate::config::ServerConfig;
use crate::document::{validate_id, Document};
use crate::error::{ReplicationError, Result};
use crate::revision::Revision;
use crate::store::{DocumentStore, RevsDiff};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use warp::http::StatusCode;
use warp::path::Tail;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

/// Page size when `_changes` is called without `limit`.
const DEFAULT_CHANGES_LIMIT: usize = 1_000;

#[derive(Debug, Deserialize)]
struct ChangesQuery {
    #[serde(default)]
    since: u64,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct AllDocsQuery {
    keys: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RevQuery {
    rev: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Routes
// ═══════════════════════════════════════════════════════════════════════════════

/// All endpoints for one database. Combine with [`handle_rejection`] via
/// `.recover()` before serving.
pub fn routes(
    db_name: &str,
    store: Arc<dyn DocumentStore>,
    max_body_bytes: u64,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let db = database(db_name.to_string());

    let info = db
        .clone()
        .and(warp::path::end())
        .and(warp::get())
        .and(with_store(Arc::clone(&store)))
        .and_then(handle_info);

    let changes = db
        .clone()
        .and(warp::path("_changes"))
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<ChangesQuery>())
        .and(with_store(Arc::clone(&store)))
        .and_then(handle_changes);

    let revs_diff = db
        .clone()
        .and(warp::path("_revs_diff"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(max_body_bytes))
        .and(warp::body::json())
        .and(with_store(Arc::clone(&store)))
        .and_then(handle_revs_diff);

    let all_docs = db
        .clone()
        .and(warp::path("_all_docs"))
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<AllDocsQuery>())
        .and(with_store(Arc::clone(&store)))
        .and_then(handle_all_docs);

    let bulk_docs = db
        .clone()
        .and(warp::path("_bulk_docs"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(max_body_bytes))
        .and(warp::body::json())
        .and(with_store(Arc::clone(&store)))
        .and_then(handle_bulk_docs);

    let get_doc = db
        .clone()
        .and(warp::path::tail())
        .and(warp::get())
        .and(warp::query::<RevQuery>())
        .and(with_store(Arc::clone(&store)))
        .and_then(handle_get_doc);

    let put_doc = db
        .and(warp::path::tail())
        .and(warp::put())
        .and(warp::body::content_length_limit(max_body_bytes))
        .and(warp::body::json())
        .and(with_store(store))
        .and_then(handle_put_doc);

    info.or(changes)
        .or(revs_diff)
        .or(all_docs)
        .or(bulk_docs)
        .or(get_doc)
        .or(put_doc)
}

/// Matches the first path segment against the database name.
fn database(name: String) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::path::param::<String>()
        .and_then(move |segment: String| {
            let matches = segment == name;
            async move {
                if matches {
                    Ok(())
                } else {
                    Err(warp::reject::not_found())
                }
            }
        })
        .untuple_one()
}

fn with_store(
    store: Arc<dyn DocumentStore>,
) -> impl Filter<Extract = (Arc<dyn DocumentStore>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&store))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handlers
// ═══════════════════════════════════════════════════════════════════════════════

async fn handle_info(store: Arc<dyn DocumentStore>) -> std::result::Result<Response, Infallible> {
    Ok(respond(store.info().await, StatusCode::OK))
}

async fn handle_changes(
    query: ChangesQuery,
    store: Arc<dyn DocumentStore>,
) -> std::result::Result<Response, Infallible> {
    let limit = query.limit.unwrap_or(DEFAULT_CHANGES_LIMIT).max(1);
    Ok(respond(store.changes_since(query.since, limit).await, StatusCode::OK))
}

async fn handle_revs_diff(
    revs: RevsDiff,
    store: Arc<dyn DocumentStore>,
) -> std::result::Result<Response, Infallible> {
    Ok(respond(store.revs_diff(revs).await, StatusCode::OK))
}

async fn handle_all_docs(
    query: AllDocsQuery,
    store: Arc<dyn DocumentStore>,
) -> std::result::Result<Response, Infallible> {
    let keys = match query.keys.as_deref().map(serde_json::from_str::<Vec<String>>) {
        Some(Ok(keys)) => keys,
        Some(Err(e)) => {
            return Ok(error_reply(&ReplicationError::InvalidDocument(format!(
                "keys must be a JSON array of strings: {}",
                e
            ))))
        }
        None => {
            return Ok(error_reply(&ReplicationError::InvalidDocument(
                "keys query parameter is required".to_string(),
            )))
        }
    };
    let result = store.all_docs(keys).await.map(|rows| AllDocsResponse { rows });
    Ok(respond(result, StatusCode::OK))
}

async fn handle_bulk_docs(
    request: BulkDocsRequest,
    store: Arc<dyn DocumentStore>,
) -> std::result::Result<Response, Infallible> {
    debug!(docs = request.docs.len(), new_edits = request.new_edits, "bulk_docs");
    Ok(respond(
        store.bulk_put(request.docs, request.new_edits).await,
        StatusCode::CREATED,
    ))
}

async fn handle_get_doc(
    tail: Tail,
    query: RevQuery,
    store: Arc<dyn DocumentStore>,
) -> std::result::Result<Response, Infallible> {
    let id = tail.as_str();
    let result = async {
        validate_id(id)?;
        match query.rev.as_deref() {
            Some(rev) => {
                let rev: Revision = rev.parse()?;
                store.fetch_revision(id, &rev).await
            }
            None => store.get(id).await,
        }
    }
    .await;
    Ok(respond(result, StatusCode::OK))
}

async fn handle_put_doc(
    tail: Tail,
    body: Value,
    store: Arc<dyn DocumentStore>,
) -> std::result::Result<Response, Infallible> {
    let id = tail.as_str();
    let result = async {
        let doc = document_for_path(id, body)?;
        store.put(doc).await
    }
    .await;
    Ok(respond(result, StatusCode::CREATED))
}

/// The request body with `_id` taken from the path.
fn document_for_path(id: &str, body: Value) -> Result<Document> {
    validate_id(id)?;
    let mut doc: Document =
        serde_json::from_value(body).map_err(|e| ReplicationError::InvalidDocument(format!("{}: {}", id, e)))?;
    if !doc.id.is_empty() && doc.id != id {
        return Err(ReplicationError::InvalidDocument(format!(
            "body _id {:?} does not match path {:?}",
            doc.id, id
        )));
    }
    doc.id = id.to_string();
    Ok(doc)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Replies
// ═══════════════════════════════════════════════════════════════════════════════

fn respond<T: Serialize>(result: Result<T>, status: StatusCode) -> Response {
    match result {
        Ok(value) => warp::reply::with_status(warp::reply::json(&value), status).into_response(),
        Err(e) => error_reply(&e),
    }
}

fn status_for(err: &ReplicationError) -> StatusCode {
    match err {
        ReplicationError::NotFound { .. } => StatusCode::NOT_FOUND,
        ReplicationError::Conflict { .. } => StatusCode::CONFLICT,
        ReplicationError::InvalidDocument(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(err: &ReplicationError) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        error!(error = %err, kind = err.kind(), "Request failed");
    }
    warp::reply::with_status(warp::reply::json(&ErrorBody::from(err)), status).into_response()
}

/// Turn warp rejections into the same `{error, reason}` bodies handlers use.
pub async fn handle_rejection(rejection: Rejection) -> std::result::Result<Response, Infallible> {
    let (status, body) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, ErrorBody::new("not_found", "missing"))
    } else if let Some(e) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, ErrorBody::new("bad_request", e.to_string()))
    } else if let Some(e) = rejection.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, ErrorBody::new("bad_request", e.to_string()))
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorBody::new("too_large", "request body exceeds the configured limit"),
        )
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            ErrorBody::new("method_not_allowed", "method not allowed"),
        )
    } else {
        error!(rejection = ?rejection, "Unhandled rejection");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorBody::new("internal", format!("{:?}", rejection)),
        )
    };
    Ok(warp::reply::with_status(warp::reply::json(&body), status).into_response())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Server
// ═══════════════════════════════════════════════════════════════════════════════

/// A running HTTP server for one store.
pub struct StoreServer {
    addr: SocketAddr,
    db_name: String,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl StoreServer {
    /// Bind and start serving in a background task.
    ///
    /// A port of 0 in `bind_addr` picks a free port; see [`addr`](Self::addr).
    pub async fn start(db_name: &str, store: Arc<dyn DocumentStore>, config: &ServerConfig) -> Result<Self> {
        let bind: SocketAddr = config
            .bind_addr
            .parse()
            .map_err(|e| ReplicationError::Config(format!("invalid bind_addr {:?}: {}", config.bind_addr, e)))?;

        let api = routes(db_name, store, config.max_body_bytes).recover(handle_rejection);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (addr, server) = warp::serve(api)
            .try_bind_with_graceful_shutdown(bind, async move {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| ReplicationError::Config(format!("cannot bind {}: {}", bind, e)))?;

        let handle = tokio::spawn(server);
        info!(db = %db_name, addr = %addr, "Store server listening");

        Ok(Self {
            addr,
            db_name: db_name.to_string(),
            shutdown_tx,
            handle: Some(handle),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Database URL, suitable for [`RemoteConfig::url`](crate::config::RemoteConfig::url).
    pub fn url(&self) -> String {
        format!("http://{}/{}", self.addr, self.db_name)
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Store server task failed");
            }
        }
        info!(db = %self.db_name, "Store server stopped");
    }
}

impl Drop for StoreServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChangesPage, DocWriteResult, LocalStore, PutResult, StoreInfo};
    use serde_json::json;

    async fn local() -> Arc<dyn DocumentStore> {
        Arc::new(LocalStore::open_in_memory("league").await.unwrap())
    }

    fn api(store: Arc<dyn DocumentStore>) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
        routes("league", store, 1024 * 1024).recover(handle_rejection)
    }

    #[tokio::test]
    async fn test_info_endpoint() {
        let api = api(local().await);
        let response = warp::test::request().method("GET").path("/league").reply(&api).await;
        assert_eq!(response.status(), StatusCode::OK);
        let info: StoreInfo = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(info.name, "league");
        assert_eq!(info.update_seq, 0);
    }

    #[tokio::test]
    async fn test_unknown_database_is_404() {
        let api = api(local().await);
        let response = warp::test::request().method("GET").path("/other").reply(&api).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_put_get_and_changes() {
        let api = api(local().await);

        let response = warp::test::request()
            .method("PUT")
            .path("/league/teams/alpha")
            .json(&json!({"name": "Alpha"}))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let put: PutResult = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(put.id, "teams/alpha");
        assert_eq!(put.rev.generation, 1);

        let response = warp::test::request()
            .method("GET")
            .path("/league/teams/alpha")
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let doc: Document = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(doc.get("name"), Some(&json!("Alpha")));

        let response = warp::test::request()
            .method("GET")
            .path(&format!("/league/teams/alpha?rev={}", put.rev))
            .reply(&api)
            .await;
        let doc: Document = serde_json::from_slice(response.body()).unwrap();
        assert!(doc.revisions.is_some());

        let response = warp::test::request()
            .method("GET")
            .path("/league/_changes?since=0&limit=10")
            .reply(&api)
            .await;
        let page: ChangesPage = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(page.results.len(), 1);
        assert_eq!(page.last_seq, 1);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let api = api(local().await);

        let missing = warp::test::request()
            .method("GET")
            .path("/league/teams/nobody")
            .reply(&api)
            .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let body: ErrorBody = serde_json::from_slice(missing.body()).unwrap();
        assert_eq!(body.error, "not_found");

        warp::test::request()
            .method("PUT")
            .path("/league/a")
            .json(&json!({"n": 1}))
            .reply(&api)
            .await;
        let conflict = warp::test::request()
            .method("PUT")
            .path("/league/a")
            .json(&json!({"n": 2}))
            .reply(&api)
            .await;
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let bad_rev = warp::test::request()
            .method("GET")
            .path("/league/a?rev=garbage")
            .reply(&api)
            .await;
        assert_eq!(bad_rev.status(), StatusCode::BAD_REQUEST);

        let mismatched = warp::test::request()
            .method("PUT")
            .path("/league/b")
            .json(&json!({"_id": "c"}))
            .reply(&api)
            .await;
        assert_eq!(mismatched.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bulk_docs_and_revs_diff() {
        let api = api(local().await);

        let response = warp::test::request()
            .method("POST")
            .path("/league/_bulk_docs")
            .json(&json!({
                "new_edits": false,
                "docs": [{"_id": "m1", "_rev": "1-abc", "score": "0-0"}]
            }))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let results: Vec<DocWriteResult> = serde_json::from_slice(response.body()).unwrap();
        assert!(results[0].is_ok());

        let response = warp::test::request()
            .method("POST")
            .path("/league/_revs_diff")
            .json(&json!({"m1": ["1-abc", "2-def"]}))
            .reply(&api)
            .await;
        let missing: RevsDiff = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(missing["m1"], vec!["2-def".parse::<Revision>().unwrap()]);
    }

    #[tokio::test]
    async fn test_all_docs_requires_keys() {
        let api = api(local().await);
        let response = warp::test::request()
            .method("GET")
            .path("/league/_all_docs")
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = warp::test::request()
            .method("GET")
            .path("/league/_all_docs?keys=%5B%22x%22%5D")
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: AllDocsResponse = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.rows.len(), 1);
        assert_eq!(body.rows[0].error.as_deref(), Some("not_found"));
    }

    #[test]
    fn test_corruption_reply_names_its_kind() {
        let err = ReplicationError::corruption("m1", "2-bb is recorded under 1-aa");
        let response = error_reply(&err);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ErrorBody::from(&err).error, "corruption");

        let conflict = error_reply(&ReplicationError::conflict("m1", "stale"));
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_server_binds_ephemeral_port() {
        let server = StoreServer::start("league", local().await, &ServerConfig::for_testing())
            .await
            .unwrap();
        assert_ne!(server.addr().port(), 0);
        assert!(server.url().ends_with("/league"));
        server.shutdown().await;
    }
}
