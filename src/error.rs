//! Error taxonomy for the retrieval service.
//!
//! Shard-level errors (`ShardTimeout`, `ShardFailure`) are isolated by the
//! multi-shard engine and never abort sibling shards; only initialization
//! errors terminate the process.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Main error type for pdfscope.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested source path does not exist or is unreadable.
    #[error("source unavailable: {path}: {reason}", path = .path.display())]
    SourceUnavailable { path: PathBuf, reason: String },

    /// A resident cache entry disagrees with the current directory contents.
    #[error("stale cache entry for {path}", path = .path.display())]
    StaleCache { path: PathBuf },

    /// An on-disk index failed to load or failed validation.
    #[error("corrupt index at {dir}: {reason}", dir = .dir.display())]
    IndexCorrupt { dir: PathBuf, reason: String },

    /// The embedding model failed to load or to produce vectors.
    #[error("embedding failure: {0}")]
    EmbeddingFailure(String),

    /// An index was built with a different embedding model than the one
    /// loaded in this process.
    #[error("embedding model mismatch: index built with {index_model}, process uses {process_model}")]
    ModelMismatch { index_model: String, process_model: String },

    /// A shard exceeded its per-shard deadline.
    #[error("shard {fingerprint} timed out after {timeout_secs} s")]
    ShardTimeout { fingerprint: String, timeout_secs: u64 },

    /// A shard failed for any non-timeout reason.
    #[error("shard {fingerprint} failed: {reason}")]
    ShardFailure { fingerprint: String, reason: String },

    /// Every shard of a multi-shard call failed.
    #[error("all {count} shards failed: {summary}")]
    AllShardsFailed { count: usize, summary: String },

    /// A query exceeded the service-level deadline.
    #[error("query timed out after {0} s")]
    QueryTimeout(u64),

    /// Malformed request (e.g. too many queries, invalid fingerprint).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// I/O error during file or directory operations.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization or deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary index payload encoding or decoding error.
    #[error("index payload error: {0}")]
    Payload(#[from] postcard::Error),

    /// Configuration file parse error.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
}

impl Error {
    /// Short machine-readable kind string, reported per shard and in HTTP
    /// error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::SourceUnavailable { .. } => "source_unavailable",
            Error::StaleCache { .. } => "stale_cache",
            Error::IndexCorrupt { .. } => "index_corrupt",
            Error::EmbeddingFailure(_) => "embedding_failure",
            Error::ModelMismatch { .. } => "model_mismatch",
            Error::ShardTimeout { .. } => "shard_timeout",
            Error::ShardFailure { .. } => "shard_failure",
            Error::AllShardsFailed { .. } => "all_shards_failed",
            Error::QueryTimeout(_) => "query_timeout",
            Error::BadRequest(_) => "bad_request",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Payload(_) => "payload",
            Error::Config(_) => "config",
        }
    }
}

impl From<candle_core::Error> for Error {
    fn from(e: candle_core::Error) -> Self {
        Error::EmbeddingFailure(e.to_string())
    }
}

impl From<hf_hub::api::sync::ApiError> for Error {
    fn from(e: hf_hub::api::sync::ApiError) -> Self {
        Error::EmbeddingFailure(e.to_string())
    }
}

/// Standard result type using [`enum@Error`] as the default error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
