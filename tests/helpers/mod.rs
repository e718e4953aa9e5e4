//! Test harness for service-level integration tests.
//!
//! Builds an [`AppContext`] over a temp-dir collection of synthetic text
//! files, backed by the deterministic hash embedder so no test downloads or
//! loads a real model.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use pdfscope::api::AppContext;
use pdfscope::builder::{self, BuildOptions};
use pdfscope::cache::IndexCache;
use pdfscope::config::ServiceConfig;
use pdfscope::embed::HashEmbedder;
use pdfscope::fingerprint::directory_manifest;

pub const TEST_DIM: usize = 64;

pub struct TestService {
    pub ctx: AppContext,
    _dir: TempDir,
}

impl TestService {
    /// Create a collection from `(filename, content)` pairs, build its merged
    /// index, and wrap it in a ready-to-query service context.
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        let dir = write_collection(files);
        let config = ServiceConfig {
            embedding_model: "hash-embedder".into(),
            ..ServiceConfig::default()
        };
        let embedder = Arc::new(HashEmbedder::new(TEST_DIM));

        builder::build_collection(dir.path(), embedder.as_ref(), &config.build_options(), false)
            .expect("collection build failed");

        let cache = Arc::new(IndexCache::new(embedder, config.build_options()));
        let ctx = AppContext {
            cache,
            config: Arc::new(config),
            collection: dir.path().canonicalize().unwrap(),
        };
        Self { ctx, _dir: dir }
    }

    /// Like [`TestService::with_files`], additionally building one index per
    /// source file and returning their fingerprints.
    pub fn with_shards(files: &[(&str, &str)]) -> (Self, Vec<String>) {
        let service = Self::with_files(files);
        let root = service.root().to_path_buf();
        builder::build_per_file(
            &root,
            &HashEmbedder::new(TEST_DIM),
            &BuildOptions::default(),
        )
        .expect("per-file build failed");
        let hashes = directory_manifest(&root)
            .unwrap()
            .into_keys()
            .map(|fp| fp.into_string())
            .collect();
        (service, hashes)
    }

    pub fn root(&self) -> &Path {
        &self.ctx.collection
    }
}

/// Write `(filename, content)` pairs into a fresh temp dir.
pub fn write_collection(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().expect("failed to create temp dir");
    for (name, content) in files {
        std::fs::write(dir.path().join(name), content).unwrap();
    }
    dir
}
