//! Multi-shard query engine — bounded parallel fan-out over per-file indices.
//!
//! Each shard is an independent failure domain: its work (index load, then
//! search) runs under its own deadline, and a timeout or error never cancels
//! siblings. Workers are tokio tasks gated by a semaphore, sharing one heap,
//! one cache, and one embedding model — fanning a query over 30 shards costs
//! one model load plus the searches, not 30 model loads.
//!
//! The question is embedded once per query through the process-wide model
//! and the vector is shared by every shard, so all shard scores live on the
//! same scale and aggregate directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::aggregate::{aggregate, AggregatedPassage, ShardPassage};
use crate::cache::IndexCache;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::index::ScoredPassage;
use crate::store;

/// Hard limit on questions per multi-shard call.
pub const MAX_QUERIES_PER_CALL: usize = 3;

/// Per-source result count is clamped to this range.
pub const K_PER_SOURCE_RANGE: (usize, usize) = (3, 8);

#[derive(Clone, Debug, Deserialize)]
pub struct MultiQueryRequest {
    /// Questions to run (at most [`MAX_QUERIES_PER_CALL`]).
    pub queries: Vec<String>,
    /// Fingerprints of per-file indices under the collection root.
    #[serde(default)]
    pub source_hashes: Vec<String>,
    /// Extra index directories (or collection roots) outside the collection.
    #[serde(default)]
    pub external_sources: Vec<PathBuf>,
    #[serde(default)]
    pub top_k_per_source: Option<usize>,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Engine defaults, taken from the service configuration.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Collection root that fingerprints resolve against.
    pub collection_root: PathBuf,
    pub top_k_per_source: usize,
    pub max_workers: usize,
    pub shard_timeout: Duration,
}

/// Outcome of one shard within one query.
#[derive(Clone, Debug, Serialize)]
pub struct ShardStatus {
    pub shard: String,
    pub elapsed_seconds: f64,
    pub passages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
}

/// Aggregated answer for one question.
#[derive(Clone, Debug, Serialize)]
pub struct QueryResult {
    pub query: String,
    pub passages: Vec<AggregatedPassage>,
    pub shards: Vec<ShardStatus>,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct MultiQueryResponse {
    pub results: Vec<QueryResult>,
    pub total_shards: usize,
    pub elapsed_seconds: f64,
}

/// A resolved shard: display label plus the directory holding its index.
#[derive(Clone)]
struct ShardSpec {
    label: String,
    dir: PathBuf,
}

/// Resolve request shards: fingerprints become `<root>/<fingerprint>`
/// directories, external sources are used as-is.
fn resolve_shards(req: &MultiQueryRequest, opts: &EngineOptions) -> Result<Vec<ShardSpec>> {
    let mut shards = Vec::new();
    for hash in &req.source_hashes {
        let fp = Fingerprint::parse(hash)
            .ok_or_else(|| Error::BadRequest(format!("invalid fingerprint: {hash}")))?;
        shards.push(ShardSpec {
            label: fp.as_str().to_string(),
            dir: store::shard_dir(&opts.collection_root, &fp),
        });
    }
    for path in &req.external_sources {
        shards.push(ShardSpec { label: path.to_string_lossy().into_owned(), dir: path.clone() });
    }
    if shards.is_empty() {
        return Err(Error::BadRequest("no shards selected".into()));
    }
    Ok(shards)
}

/// Run up to three questions against the selected shards.
///
/// Fails only when every shard of every question failed; any partial result
/// is preferred over no result.
pub async fn multi_query(
    req: MultiQueryRequest,
    cache: Arc<IndexCache>,
    opts: EngineOptions,
) -> Result<MultiQueryResponse> {
    if req.queries.is_empty() {
        return Err(Error::BadRequest("no queries given".into()));
    }
    if req.queries.len() > MAX_QUERIES_PER_CALL {
        return Err(Error::BadRequest(format!(
            "at most {MAX_QUERIES_PER_CALL} queries per call, got {}",
            req.queries.len()
        )));
    }

    let shards = resolve_shards(&req, &opts)?;
    let k = req
        .top_k_per_source
        .unwrap_or(opts.top_k_per_source)
        .clamp(K_PER_SOURCE_RANGE.0, K_PER_SOURCE_RANGE.1);
    let workers = req.max_workers.unwrap_or(opts.max_workers).max(1);
    let timeout = req.timeout_secs.map(Duration::from_secs).unwrap_or(opts.shard_timeout);

    let start = Instant::now();
    let embedder = cache.embedder();
    let mut results = Vec::with_capacity(req.queries.len());

    for query in &req.queries {
        let question = query.clone();
        let embed_handle = {
            let embedder = Arc::clone(&embedder);
            let question = question.clone();
            tokio::task::spawn_blocking(move || embedder.embed(&[question.as_str()]))
        };
        let vectors = embed_handle
            .await
            .map_err(|e| Error::EmbeddingFailure(format!("embed task failed: {e}")))??;
        let query_vec = Arc::new(vectors.into_iter().next().ok_or_else(|| {
            Error::EmbeddingFailure("embedder returned no vector for query".into())
        })?);

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks: JoinSet<(String, f64, Result<Vec<ScoredPassage>>)> = JoinSet::new();

        for shard in shards.clone() {
            let cache = Arc::clone(&cache);
            let semaphore = Arc::clone(&semaphore);
            let query_vec = Arc::clone(&query_vec);
            tasks.spawn(async move {
                let shard_start = Instant::now();
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => run_shard(&cache, &shard, &query_vec, k, timeout).await,
                    Err(_) => Err(Error::ShardFailure {
                        fingerprint: shard.label.clone(),
                        reason: "worker pool closed".into(),
                    }),
                };
                (shard.label, shard_start.elapsed().as_secs_f64(), outcome)
            });
        }

        let mut statuses = Vec::with_capacity(shards.len());
        let mut shard_passages = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (label, elapsed, outcome) = match joined {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "shard task panicked");
                    continue;
                }
            };
            match outcome {
                Ok(passages) => {
                    debug!(shard = label.as_str(), hits = passages.len(), "shard complete");
                    statuses.push(ShardStatus {
                        shard: label.clone(),
                        elapsed_seconds: elapsed,
                        passages: passages.len(),
                        error: None,
                        error_kind: None,
                    });
                    shard_passages.extend(
                        passages.into_iter().map(|p| ShardPassage { shard: label.clone(), passage: p }),
                    );
                }
                Err(e) => {
                    warn!(shard = label.as_str(), error = %e, "shard failed");
                    statuses.push(ShardStatus {
                        shard: label,
                        elapsed_seconds: elapsed,
                        passages: 0,
                        error: Some(e.to_string()),
                        error_kind: Some(e.kind()),
                    });
                }
            }
        }
        statuses.sort_by(|a, b| a.shard.cmp(&b.shard));

        let succeeded = statuses.iter().filter(|s| s.error.is_none()).count();
        let failed = statuses.len() - succeeded;
        results.push(QueryResult {
            query: question,
            passages: aggregate(shard_passages),
            shards: statuses,
            succeeded,
            failed,
        });
    }

    if results.iter().all(|r| r.succeeded == 0) {
        // Enumerate per-shard causes for every query, not just the first:
        // the same shard can fail differently from one question to the next.
        let summary = results
            .iter()
            .map(|r| {
                let causes = r
                    .shards
                    .iter()
                    .map(|s| format!("{}: {}", s.shard, s.error.as_deref().unwrap_or("unknown")))
                    .collect::<Vec<_>>()
                    .join("; ");
                format!("[{}] {causes}", r.query)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        return Err(Error::AllShardsFailed { count: shards.len(), summary });
    }

    Ok(MultiQueryResponse {
        results,
        total_shards: shards.len(),
        elapsed_seconds: start.elapsed().as_secs_f64(),
    })
}

/// One shard's work under its own deadline: obtain the handle (which may
/// pay a first load) and search it.
async fn run_shard(
    cache: &IndexCache,
    shard: &ShardSpec,
    query_vec: &[f32],
    k: usize,
    timeout: Duration,
) -> Result<Vec<ScoredPassage>> {
    let work = async {
        let (entry, _from_cache) = cache.get_or_load(&shard.dir).await?;
        entry.index.search(query_vec, k)
    };
    match tokio::time::timeout(timeout, work).await {
        Ok(result) => result.map_err(|e| Error::ShardFailure {
            fingerprint: shard.label.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Err(Error::ShardTimeout {
            fingerprint: shard.label.clone(),
            timeout_secs: timeout.as_secs(),
        }),
    }
}
