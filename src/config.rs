//! Service configuration — defaults, `.pdfscope.toml` overrides, CLI flags.
//!
//! Precedence is defaults ← config file at the collection root ← CLI flags
//! (applied by `main`). Every knob has a sensible default so a bare
//! `pdfscope` against a directory of text files just works.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::builder::BuildOptions;
use crate::embed::DEFAULT_MODEL;
use crate::error::Result;

/// Config file looked up at the collection root.
pub const CONFIG_FILE: &str = ".pdfscope.toml";

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 1411;

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Chunk size in bytes.
    pub chunk_size: usize,
    /// Overlap between neighboring chunks in bytes.
    pub chunk_overlap: usize,
    /// Default result count for single-collection queries.
    pub top_k: usize,
    /// Default per-shard result count for multi-shard queries.
    pub top_k_per_source: usize,
    /// Concurrent shard workers in a fan-out.
    pub max_workers: usize,
    /// Per-shard deadline in seconds.
    pub shard_timeout_secs: u64,
    /// Service-level query deadline in seconds.
    pub query_timeout_secs: u64,
    /// Embedding model identifier.
    pub embedding_model: String,
    /// Warm the default collection into the cache at startup.
    pub preload: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1200,
            chunk_overlap: 150,
            top_k: 4,
            top_k_per_source: 5,
            max_workers: 4,
            shard_timeout_secs: 30,
            query_timeout_secs: 300,
            embedding_model: DEFAULT_MODEL.to_string(),
            preload: true,
        }
    }
}

impl ServiceConfig {
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions { chunk_size: self.chunk_size, chunk_overlap: self.chunk_overlap }
    }

    pub fn shard_timeout(&self) -> Duration {
        Duration::from_secs(self.shard_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

/// Optional-field mirror of [`ServiceConfig`] for the TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
    top_k: Option<usize>,
    top_k_per_source: Option<usize>,
    max_workers: Option<usize>,
    shard_timeout_secs: Option<u64>,
    query_timeout_secs: Option<u64>,
    embedding_model: Option<String>,
    preload: Option<bool>,
}

/// Load the configuration for a collection root, merging `.pdfscope.toml`
/// over the defaults when present.
pub fn load(collection_root: &Path) -> Result<ServiceConfig> {
    let mut config = ServiceConfig::default();
    let path = collection_root.join(CONFIG_FILE);
    if !path.is_file() {
        return Ok(config);
    }

    let raw = std::fs::read_to_string(&path)?;
    let file: FileConfig = toml::from_str(&raw)?;

    if let Some(v) = file.chunk_size {
        config.chunk_size = v;
    }
    if let Some(v) = file.chunk_overlap {
        config.chunk_overlap = v;
    }
    if let Some(v) = file.top_k {
        config.top_k = v;
    }
    if let Some(v) = file.top_k_per_source {
        config.top_k_per_source = v;
    }
    if let Some(v) = file.max_workers {
        config.max_workers = v;
    }
    if let Some(v) = file.shard_timeout_secs {
        config.shard_timeout_secs = v;
    }
    if let Some(v) = file.query_timeout_secs {
        config.query_timeout_secs = v;
    }
    if let Some(v) = file.embedding_model {
        config.embedding_model = v;
    }
    if let Some(v) = file.preload {
        config.preload = v;
    }
    Ok(config)
}
