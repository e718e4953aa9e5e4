//! On-disk index store — content-addressed layout and manifests.
//!
//! Per-file indices live in directories named by their source fingerprint,
//! as siblings of the source files; the merged collection index lives in a
//! `.mini_rag_index/` directory at the collection root, described by a
//! collection manifest next to it:
//!
//! ```text
//! <collection_root>/
//!   A.pdf.txt ...                 source artifacts
//!   manifest.json                 collection manifest
//!   .mini_rag_index/              merged collection index
//!     index.bin                   flat f32 vector payload (postcard)
//!     chunks.json                 passage metadata + text
//!     manifest.json               build manifest
//!   <fingerprint>/                per-file shard index (32-hex name)
//!     index.bin / chunks.json / manifest.json
//! ```
//!
//! Any directory containing the three index files loads through
//! [`load_index`], regardless of which layout placed it there.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::index::{StoredChunk, VectorIndex};

pub const INDEX_FILE: &str = "index.bin";
pub const CHUNKS_FILE: &str = "chunks.json";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const COLLECTION_INDEX_DIR: &str = ".mini_rag_index";

pub const SCHEMA_VERSION: u32 = 1;

/// Record persisted alongside every on-disk index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildManifest {
    pub schema_version: u32,
    /// Fingerprint of each source included; exactly one for per-file indices.
    pub fingerprints: Vec<String>,
    /// Display filename, for single-source indices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub chunks: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_model: String,
    /// ISO-8601 build timestamp.
    pub built_at: String,
}

/// Collection-level manifest at the collection root: which files the merged
/// index was built from. Fingerprints appear as top-level keys.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CollectionManifest {
    #[serde(flatten)]
    pub files: BTreeMap<String, String>,
    pub built_at: String,
    pub total_chunks: usize,
}

impl CollectionManifest {
    /// Whether the recorded fingerprint set equals `current`'s.
    pub fn matches_fingerprints(&self, current: &BTreeMap<Fingerprint, String>) -> bool {
        self.files.len() == current.len()
            && current.keys().all(|fp| self.files.contains_key(fp.as_str()))
    }
}

/// Current ISO-8601 timestamp for manifests.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Serialized form of the binary vector payload.
#[derive(Serialize, Deserialize)]
struct IndexPayload {
    dim: u32,
    vectors: Vec<f32>,
}

pub fn collection_index_dir(root: &Path) -> PathBuf {
    root.join(COLLECTION_INDEX_DIR)
}

pub fn shard_dir(root: &Path, fingerprint: &Fingerprint) -> PathBuf {
    root.join(fingerprint.as_str())
}

/// Whether `dir` holds a complete index (all three files present).
pub fn index_exists(dir: &Path) -> bool {
    dir.join(INDEX_FILE).is_file()
        && dir.join(CHUNKS_FILE).is_file()
        && dir.join(MANIFEST_FILE).is_file()
}

/// Write the three index files into `dir` (which must already exist).
/// Callers persist atomically by writing into a staging directory and
/// renaming it into place.
pub fn write_index(dir: &Path, index: &VectorIndex, manifest: &BuildManifest) -> Result<()> {
    let payload =
        IndexPayload { dim: index.dim() as u32, vectors: index.embeddings().to_vec() };
    std::fs::write(dir.join(INDEX_FILE), postcard::to_allocvec(&payload)?)?;
    std::fs::write(dir.join(CHUNKS_FILE), serde_json::to_vec(index.chunks())?)?;
    std::fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(manifest)?)?;
    Ok(())
}

/// Load and validate an index directory.
///
/// Decode failures, missing files, and length mismatches surface as
/// [`Error::IndexCorrupt`]; a manifest recording a different embedding model
/// than `expected_model` is [`Error::ModelMismatch`].
pub fn load_index(dir: &Path, expected_model: &str) -> Result<(VectorIndex, BuildManifest)> {
    let manifest = load_build_manifest(dir)?;
    if manifest.embedding_model != expected_model {
        return Err(Error::ModelMismatch {
            index_model: manifest.embedding_model,
            process_model: expected_model.to_string(),
        });
    }

    let corrupt = |reason: String| Error::IndexCorrupt { dir: dir.to_path_buf(), reason };

    let raw = std::fs::read(dir.join(INDEX_FILE))
        .map_err(|e| corrupt(format!("{INDEX_FILE}: {e}")))?;
    let payload: IndexPayload =
        postcard::from_bytes(&raw).map_err(|e| corrupt(format!("{INDEX_FILE}: {e}")))?;

    let chunks_raw = std::fs::read(dir.join(CHUNKS_FILE))
        .map_err(|e| corrupt(format!("{CHUNKS_FILE}: {e}")))?;
    let chunks: Vec<StoredChunk> =
        serde_json::from_slice(&chunks_raw).map_err(|e| corrupt(format!("{CHUNKS_FILE}: {e}")))?;

    if manifest.chunks != chunks.len() {
        return Err(corrupt(format!(
            "manifest records {} chunks, {} stored",
            manifest.chunks,
            chunks.len()
        )));
    }

    let index = VectorIndex::from_flat(
        chunks,
        payload.vectors,
        payload.dim as usize,
        manifest.embedding_model.clone(),
    )
    .map_err(|e| corrupt(e.to_string()))?;

    Ok((index, manifest))
}

/// Read a build manifest, mapping all failures to [`Error::IndexCorrupt`].
pub fn load_build_manifest(dir: &Path) -> Result<BuildManifest> {
    let path = dir.join(MANIFEST_FILE);
    let raw = std::fs::read(&path).map_err(|e| Error::IndexCorrupt {
        dir: dir.to_path_buf(),
        reason: format!("{MANIFEST_FILE}: {e}"),
    })?;
    let manifest: BuildManifest = serde_json::from_slice(&raw).map_err(|e| Error::IndexCorrupt {
        dir: dir.to_path_buf(),
        reason: format!("{MANIFEST_FILE}: {e}"),
    })?;
    if manifest.schema_version != SCHEMA_VERSION {
        return Err(Error::IndexCorrupt {
            dir: dir.to_path_buf(),
            reason: format!("unsupported schema version {}", manifest.schema_version),
        });
    }
    Ok(manifest)
}

pub fn load_collection_manifest(root: &Path) -> Result<Option<CollectionManifest>> {
    let path = root.join(MANIFEST_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let raw = std::fs::read(&path)?;
    Ok(Some(serde_json::from_slice(&raw)?))
}

pub fn save_collection_manifest(root: &Path, manifest: &CollectionManifest) -> Result<()> {
    std::fs::write(root.join(MANIFEST_FILE), serde_json::to_vec_pretty(manifest)?)?;
    Ok(())
}
