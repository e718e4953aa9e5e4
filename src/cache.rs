//! In-memory index cache — path → loaded index, shared across all queries.
//!
//! The map itself is a [`DashMap`] (concurrent reads, per-key write
//! exclusion); first loads for a path serialize on a per-path async mutex so
//! N concurrent cold callers trigger exactly one load. `reload` builds the
//! replacement first and swaps it in with a single insert: in-flight
//! searches keep their `Arc` to the old entry and complete against the old
//! index, which is freed when the last reader drops it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::builder::{self, BuildOptions};
use crate::embed::Embedder;
use crate::error::{Error, Result};
use crate::fingerprint;
use crate::index::VectorIndex;
use crate::store::{self, BuildManifest};

/// A resident index. Shared by `Arc`; never mutated after load.
#[derive(Debug)]
pub struct CacheEntry {
    pub path: String,
    pub index: VectorIndex,
    pub manifest: BuildManifest,
    pub loaded_at: DateTime<Utc>,
    pub load_seconds: f64,
}

impl CacheEntry {
    /// Number of source documents behind this index.
    pub fn doc_count(&self) -> usize {
        self.manifest.fingerprints.len()
    }
}

/// Stats row for one resident entry.
#[derive(Clone, Debug, Serialize)]
pub struct CacheStat {
    pub path: String,
    pub loaded_at: String,
    pub docs_count: usize,
    pub load_seconds: f64,
}

pub struct IndexCache {
    entries: DashMap<String, Arc<CacheEntry>>,
    load_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    embedder: Arc<dyn Embedder>,
    build_opts: BuildOptions,
}

impl IndexCache {
    pub fn new(embedder: Arc<dyn Embedder>, build_opts: BuildOptions) -> Self {
        Self { entries: DashMap::new(), load_locks: DashMap::new(), embedder, build_opts }
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }

    /// Canonical cache key for a path. The path must exist.
    fn key_for(&self, path: &Path) -> Result<String> {
        let canonical = path.canonicalize().map_err(|e| Error::SourceUnavailable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(canonical.to_string_lossy().into_owned())
    }

    fn load_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.load_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Return the resident entry for `path`, loading (and building, when the
    /// on-disk index is missing or stale) on first use.
    ///
    /// The boolean is the cache-hit flag: callers that found the entry
    /// resident — including callers that blocked behind another caller's
    /// load — observe a hit with zero load time.
    pub async fn get_or_load(&self, path: &Path) -> Result<(Arc<CacheEntry>, bool)> {
        let key = self.key_for(path)?;

        if let Some(entry) = self.entries.get(&key) {
            let entry = Arc::clone(&entry);
            self.check_stale(&entry);
            return Ok((entry, true));
        }

        let lock = self.load_lock(&key);
        let _guard = lock.lock().await;
        if let Some(entry) = self.entries.get(&key) {
            return Ok((Arc::clone(&entry), true));
        }

        let entry = self.load_entry(key.clone(), false).await?;
        self.entries.insert(key, Arc::clone(&entry));
        Ok((entry, false))
    }

    /// Force-rebuild the index behind `path` and atomically swap the
    /// resident entry. In-flight queries finish against the old index.
    pub async fn reload(&self, path: &Path) -> Result<Arc<CacheEntry>> {
        let key = self.key_for(path)?;
        let lock = self.load_lock(&key);
        let _guard = lock.lock().await;

        let entry = self.load_entry(key.clone(), true).await?;
        self.entries.insert(key.clone(), Arc::clone(&entry));
        info!(path = key.as_str(), docs = entry.doc_count(), "cache entry reloaded");
        Ok(entry)
    }

    /// Load the index directory for `key`, building first when needed.
    /// Runs on the blocking pool: index loads read large files and builds
    /// embed entire collections.
    async fn load_entry(&self, key: String, force_rebuild: bool) -> Result<Arc<CacheEntry>> {
        let embedder = Arc::clone(&self.embedder);
        let build_opts = self.build_opts;

        let entry = tokio::task::spawn_blocking(move || -> Result<CacheEntry> {
            let start = Instant::now();
            let path = PathBuf::from(&key);

            let index_dir = if store::index_exists(&path) {
                // `key` is itself an index directory (per-file shard or an
                // externally built index).
                if force_rebuild {
                    debug!(path = key.as_str(), "reload of a bare index directory re-reads it");
                }
                path.clone()
            } else {
                // `key` is a collection root: make sure the merged index is
                // current before loading it.
                builder::build_collection(&path, embedder.as_ref(), &build_opts, force_rebuild)?;
                store::collection_index_dir(&path)
            };

            let (index, manifest) = match store::load_index(&index_dir, embedder.model_id()) {
                Ok(loaded) => loaded,
                // A model mismatch on a collection index is repaired by
                // rebuilding with the process model.
                Err(Error::ModelMismatch { .. }) if index_dir != path => {
                    builder::build_collection(&path, embedder.as_ref(), &build_opts, true)?;
                    store::load_index(&index_dir, embedder.model_id())?
                }
                Err(e) => return Err(e),
            };

            Ok(CacheEntry {
                path: key,
                index,
                manifest,
                loaded_at: Utc::now(),
                load_seconds: start.elapsed().as_secs_f64(),
            })
        })
        .await
        .map_err(|e| Error::EmbeddingFailure(format!("load task failed: {e}")))??;

        Ok(Arc::new(entry))
    }

    /// Cheap staleness probe on a cache hit: compare the directory's source
    /// filename listing with the names recorded at build time. No hashing on
    /// the hot path; a mismatch is only warned about — `reload` is the
    /// remedy.
    fn check_stale(&self, entry: &CacheEntry) {
        let root = Path::new(&entry.path);
        if !root.is_dir() || store::index_exists(root) {
            return;
        }
        let Ok(Some(collection)) = store::load_collection_manifest(root) else {
            return;
        };
        let Ok(listing) = std::fs::read_dir(root) else {
            return;
        };
        let mut current: Vec<String> = listing
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| fingerprint::is_source_name(n))
            .collect();
        current.sort();
        let mut recorded: Vec<String> = collection.files.values().cloned().collect();
        recorded.sort();
        if current != recorded {
            warn!(
                path = entry.path.as_str(),
                "collection changed since load, serving stale index (reload to refresh)"
            );
        }
    }

    /// One stats row per resident entry, sorted by path.
    pub fn stats(&self) -> Vec<CacheStat> {
        let mut rows: Vec<CacheStat> = self
            .entries
            .iter()
            .map(|kv| {
                let e = kv.value();
                CacheStat {
                    path: e.path.clone(),
                    loaded_at: e.loaded_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    docs_count: e.doc_count(),
                    load_seconds: e.load_seconds,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.path.cmp(&b.path));
        rows
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.entries.iter().map(|kv| kv.key().clone()).collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove the entry for `path`. Accepts the original or canonical form.
    pub fn evict(&self, path: &Path) -> bool {
        let raw = path.to_string_lossy().into_owned();
        let removed = match self.key_for(path) {
            Ok(key) => self.entries.remove(&key).is_some() || self.entries.remove(&raw).is_some(),
            // Path may no longer exist on disk; fall back to the raw form.
            Err(_) => self.entries.remove(&raw).is_some(),
        };
        if removed {
            debug!(path = raw.as_str(), "cache entry evicted");
        }
        removed
    }

    /// Drop every resident entry, returning how many were removed.
    pub fn evict_all(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}
