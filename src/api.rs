//! HTTP API for the query service.
//!
//! Handlers are thin: each delegates to a plain service function returning
//! `Result<T, Error>`, and errors are mapped to structured JSON bodies with
//! an appropriate status code. Integration tests call the service functions
//! directly, without HTTP plumbing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, Path as UrlPath, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::{CacheStat, IndexCache};
use crate::config::ServiceConfig;
use crate::engine::{self, EngineOptions, MultiQueryRequest, MultiQueryResponse};
use crate::error::{Error, Result};

/// Shared service state for all handlers.
#[derive(Clone)]
pub struct AppContext {
    pub cache: Arc<IndexCache>,
    pub config: Arc<ServiceConfig>,
    /// Default collection served when a query names no directory.
    pub collection: PathBuf,
}

impl AppContext {
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            collection_root: self.collection.clone(),
            top_k_per_source: self.config.top_k_per_source,
            max_workers: self.config.max_workers,
            shard_timeout: self.config.shard_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    /// Collection to query; defaults to the service's collection.
    #[serde(default)]
    pub pdf_directory: Option<String>,
    pub question: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct PassageMetadata {
    pub source: String,
    pub page: usize,
}

#[derive(Debug, Serialize)]
pub struct SourcePassage {
    pub content: String,
    pub metadata: PassageMetadata,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    /// Deterministic rendering of the retrieved passages — not generated text.
    pub answer: String,
    pub sources: Vec<SourcePassage>,
    pub load_time_seconds: f64,
    pub retrieval_time_seconds: f64,
    pub from_cache: bool,
}

#[derive(Debug, Deserialize)]
pub struct ReloadRequest {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub load_time_seconds: f64,
    pub docs_count: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_cached: usize,
    pub indices: Vec<CacheStat>,
}

// ---------------------------------------------------------------------------
// Service functions (the testable surface)
// ---------------------------------------------------------------------------

/// Answer a question against one collection: load (or hit) its index, embed
/// the question, search, and render the passages.
pub async fn run_query(
    ctx: &AppContext,
    directory: Option<&Path>,
    question: &str,
    top_k: Option<usize>,
) -> Result<QueryResponse> {
    if question.trim().is_empty() {
        return Err(Error::BadRequest("empty question".into()));
    }
    let k = top_k.unwrap_or(ctx.config.top_k).max(1);
    let target = directory.unwrap_or(&ctx.collection).to_path_buf();

    let deadline = ctx.config.query_timeout();
    let work = async {
        let (entry, from_cache) = ctx.cache.get_or_load(&target).await?;
        let load_time_seconds = if from_cache { 0.0 } else { entry.load_seconds };

        let retrieval_start = Instant::now();
        let embedder = ctx.cache.embedder();
        let text = question.to_string();
        let vectors = tokio::task::spawn_blocking(move || embedder.embed(&[text.as_str()]))
            .await
            .map_err(|e| Error::EmbeddingFailure(format!("embed task failed: {e}")))??;
        let query_vec = vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::EmbeddingFailure("no vector for question".into()))?;

        let hits = entry.index.search(&query_vec, k)?;
        let retrieval_time_seconds = retrieval_start.elapsed().as_secs_f64();

        let sources: Vec<SourcePassage> = hits
            .iter()
            .map(|h| SourcePassage {
                content: h.text.clone(),
                metadata: PassageMetadata { source: h.source.clone(), page: h.page },
            })
            .collect();
        let answer = hits
            .iter()
            .map(|h| format!("[{}] Page {}:\n{}", h.source, h.page, h.text))
            .collect::<Vec<_>>()
            .join("\n---\n");

        Ok(QueryResponse {
            answer,
            sources,
            load_time_seconds,
            retrieval_time_seconds,
            from_cache,
        })
    };

    match tokio::time::timeout(deadline, work).await {
        Ok(result) => result,
        Err(_) => Err(Error::QueryTimeout(deadline.as_secs())),
    }
}

/// Fan a request out over per-file indices (see [`engine::multi_query`]).
///
/// The service-level deadline applies to the whole call; when it expires the
/// engine future is dropped, which cancels all outstanding shard tasks.
pub async fn run_multi_query(
    ctx: &AppContext,
    req: MultiQueryRequest,
) -> Result<MultiQueryResponse> {
    let deadline = ctx.config.query_timeout();
    match tokio::time::timeout(
        deadline,
        engine::multi_query(req, Arc::clone(&ctx.cache), ctx.engine_options()),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::QueryTimeout(deadline.as_secs())),
    }
}

/// Force-rebuild a path (default: the service collection) and swap it in.
pub async fn run_reload(ctx: &AppContext, path: Option<&Path>) -> Result<ReloadResponse> {
    let target = path.unwrap_or(&ctx.collection);
    let entry = ctx.cache.reload(target).await?;
    Ok(ReloadResponse { load_time_seconds: entry.load_seconds, docs_count: entry.doc_count() })
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::SourceUnavailable { .. } => StatusCode::NOT_FOUND,
        Error::BadRequest(_) => StatusCode::BAD_REQUEST,
        Error::QueryTimeout(_) | Error::ShardTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::AllShardsFailed { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: Error) -> (StatusCode, Json<serde_json::Value>) {
    (
        status_for(&error),
        Json(serde_json::json!({ "error": error.to_string(), "kind": error.kind() })),
    )
}

type ApiResult<T> = std::result::Result<Json<T>, (StatusCode, Json<serde_json::Value>)>;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /` — service identity and cache summary.
pub async fn api_root(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "pdfscope",
        "status": "ok",
        "cached_count": ctx.cache.len(),
        "paths": ctx.cache.paths(),
    }))
}

/// `GET /cache/stats` — per-entry load time and document count.
pub async fn api_cache_stats(State(ctx): State<AppContext>) -> impl IntoResponse {
    let indices = ctx.cache.stats();
    Json(StatsResponse { total_cached: indices.len(), indices })
}

/// `POST /query` — single-collection question answering.
pub async fn api_query(
    State(ctx): State<AppContext>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<QueryResponse> {
    let directory = req.pdf_directory.as_ref().map(PathBuf::from);
    run_query(&ctx, directory.as_deref(), &req.question, req.top_k)
        .await
        .map(Json)
        .map_err(error_response)
}

/// `POST /multi_query` — bounded parallel fan-out over per-file indices.
pub async fn api_multi_query(
    State(ctx): State<AppContext>,
    Json(req): Json<MultiQueryRequest>,
) -> ApiResult<MultiQueryResponse> {
    run_multi_query(&ctx, req).await.map(Json).map_err(error_response)
}

/// `DELETE /cache/{*path}` — evict one entry.
pub async fn api_evict(
    State(ctx): State<AppContext>,
    UrlPath(path): UrlPath<String>,
) -> impl IntoResponse {
    // The wildcard strips the leading slash of absolute paths.
    let candidate = PathBuf::from(&path);
    let evicted = ctx.cache.evict(&candidate)
        || (!path.starts_with('/') && ctx.cache.evict(Path::new(&format!("/{path}"))));
    info!(path = path.as_str(), evicted, "evict requested");
    Json(serde_json::json!({ "ok": evicted }))
}

/// `DELETE /cache` — evict everything.
pub async fn api_evict_all(State(ctx): State<AppContext>) -> impl IntoResponse {
    let evicted = ctx.cache.evict_all();
    info!(evicted, "cache cleared");
    Json(serde_json::json!({ "ok": true, "evicted": evicted }))
}

/// `POST /cache/reload` — force-rebuild then swap.
pub async fn api_reload(
    State(ctx): State<AppContext>,
    Json(req): Json<ReloadRequest>,
) -> ApiResult<ReloadResponse> {
    let path = req.path.as_ref().map(PathBuf::from);
    run_reload(&ctx, path.as_deref()).await.map(Json).map_err(error_response)
}
