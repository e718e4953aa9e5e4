//! Index builder — chunk, embed, and persist source files.
//!
//! Builds are atomic: the index is assembled fully in memory, written into a
//! hidden staging directory next to the target, then renamed into place. An
//! embedding failure aborts the build and leaves no partial output.
//! Unreadable sources are skipped and reported in the build warnings.

use std::path::{Path, PathBuf};
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::chunker::{chunk_text, ChunkOptions};
use crate::embed::{Embedder, EMBED_BATCH};
use crate::error::{Error, Result};
use crate::fingerprint::{directory_manifest, Fingerprint};
use crate::index::{StoredChunk, VectorIndex};
use crate::store::{self, BuildManifest, CollectionManifest, SCHEMA_VERSION};

#[derive(Clone, Copy, Debug)]
pub struct BuildOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        let chunk = ChunkOptions::default();
        Self { chunk_size: chunk.chunk_size, chunk_overlap: chunk.chunk_overlap }
    }
}

impl BuildOptions {
    fn chunk_options(&self) -> ChunkOptions {
        ChunkOptions { chunk_size: self.chunk_size, chunk_overlap: self.chunk_overlap }
    }
}

/// Outcome of a build operation.
#[derive(Debug)]
pub struct BuildReport {
    pub manifest: BuildManifest,
    /// Per-source problems that did not abort the build.
    pub warnings: Vec<String>,
    /// False when an up-to-date index was reused instead of rebuilt.
    pub built: bool,
    pub elapsed_seconds: f64,
}

/// Source text with page breaks preserved, read as lossy UTF-8.
///
/// PDF ingestion is external to this service: a source file is expected to
/// already hold extracted plain text, with form feeds separating pages.
fn read_source_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| Error::SourceUnavailable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

struct PreparedSource {
    fingerprint: Fingerprint,
    chunks: Vec<StoredChunk>,
}

/// Fingerprint, read, and chunk one source file.
fn prepare_source(path: &Path, opts: &BuildOptions) -> Result<PreparedSource> {
    let fingerprint = Fingerprint::of_file(path)?;
    let text = read_source_text(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let chunks = chunk_text(&text, &opts.chunk_options())
        .into_iter()
        .map(|c| StoredChunk { text: c.text, source: name.clone(), page: c.page, ordinal: c.ordinal })
        .collect();
    Ok(PreparedSource { fingerprint, chunks })
}

/// Build an index over `sources` and persist it to `out_dir`.
///
/// Sources are chunked in parallel, embedded in batches through the shared
/// model, and written atomically. Unreadable sources are skipped with a
/// warning; an empty chunk set or an embedding failure aborts the build.
pub fn build_index(
    sources: &[PathBuf],
    out_dir: &Path,
    embedder: &dyn Embedder,
    opts: &BuildOptions,
) -> Result<BuildReport> {
    let start = Instant::now();
    let mut warnings = Vec::new();

    let prepared: Vec<Result<PreparedSource>> =
        sources.par_iter().map(|path| prepare_source(path, opts)).collect();

    let mut fingerprints = Vec::new();
    let mut chunks: Vec<StoredChunk> = Vec::new();
    for (path, result) in sources.iter().zip(prepared) {
        match result {
            Ok(source) => {
                fingerprints.push(source.fingerprint.into_string());
                chunks.extend(source.chunks);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable source");
                warnings.push(format!("{}: {e}", path.display()));
            }
        }
    }

    if fingerprints.is_empty() {
        return Err(Error::SourceUnavailable {
            path: out_dir.to_path_buf(),
            reason: "no readable sources".into(),
        });
    }

    debug!(sources = fingerprints.len(), chunks = chunks.len(), "embedding chunks");
    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
    for batch in chunks.chunks(EMBED_BATCH) {
        let texts: Vec<&str> = batch.iter().map(|c| c.text.as_str()).collect();
        vectors.extend(embedder.embed(&texts)?);
    }

    let filename = if sources.len() == 1 {
        sources[0].file_name().map(|n| n.to_string_lossy().into_owned())
    } else {
        None
    };
    let manifest = BuildManifest {
        schema_version: SCHEMA_VERSION,
        fingerprints,
        filename,
        chunks: chunks.len(),
        chunk_size: opts.chunk_size,
        chunk_overlap: opts.chunk_overlap,
        embedding_model: embedder.model_id().to_string(),
        built_at: store::now_iso8601(),
    };

    let index =
        VectorIndex::from_parts(chunks, vectors, embedder.dimension(), manifest.embedding_model.clone())?;
    persist_atomically(out_dir, &index, &manifest)?;

    let elapsed_seconds = start.elapsed().as_secs_f64();
    info!(
        dir = %out_dir.display(),
        chunks = manifest.chunks,
        elapsed_ms = (elapsed_seconds * 1000.0) as u64,
        "index built"
    );
    Ok(BuildReport { manifest, warnings, built: true, elapsed_seconds })
}

/// Write the index into a staging sibling of `out_dir`, then rename it into
/// place, replacing any previous index. Failure removes the staging
/// directory so no partial output survives.
fn persist_atomically(out_dir: &Path, index: &VectorIndex, manifest: &BuildManifest) -> Result<()> {
    let parent = out_dir.parent().unwrap_or_else(|| Path::new("."));
    let base = out_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let staging = parent.join(format!(".staging-{}-{base}", std::process::id()));

    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    let written = store::write_index(&staging, index, manifest);
    if let Err(e) = written {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    if out_dir.exists() {
        std::fs::remove_dir_all(out_dir)?;
    }
    std::fs::rename(&staging, out_dir)?;
    Ok(())
}

/// Whether the merged collection index at `root` is current for `scan`:
/// manifest fingerprint set matches, build parameters match, and the index
/// was built with the process embedding model.
pub fn collection_is_current(
    root: &Path,
    scan: &std::collections::BTreeMap<Fingerprint, String>,
    embedder: &dyn Embedder,
    opts: &BuildOptions,
) -> bool {
    let index_dir = store::collection_index_dir(root);
    if !store::index_exists(&index_dir) {
        return false;
    }
    let Ok(Some(collection)) = store::load_collection_manifest(root) else {
        return false;
    };
    if !collection.matches_fingerprints(scan) {
        return false;
    }
    match store::load_build_manifest(&index_dir) {
        Ok(build) => {
            build.embedding_model == embedder.model_id()
                && build.chunk_size == opts.chunk_size
                && build.chunk_overlap == opts.chunk_overlap
        }
        Err(_) => false,
    }
}

/// Build (or reuse) the merged collection index at `root`.
///
/// When `force` is false and the on-disk manifest's fingerprint set equals
/// the current directory scan, the existing index is reused; renamed files
/// only have their display names refreshed in the collection manifest.
pub fn build_collection(
    root: &Path,
    embedder: &dyn Embedder,
    opts: &BuildOptions,
    force: bool,
) -> Result<BuildReport> {
    let start = Instant::now();
    let scan = directory_manifest(root)?;
    if scan.is_empty() {
        return Err(Error::SourceUnavailable {
            path: root.to_path_buf(),
            reason: "collection has no source files".into(),
        });
    }

    if !force && collection_is_current(root, &scan, embedder, opts) {
        // Fingerprints unchanged; refresh display names for renamed files.
        let mut collection = store::load_collection_manifest(root)?.unwrap_or_default();
        let mut renamed = false;
        for (fp, name) in &scan {
            if collection.files.get(fp.as_str()) != Some(name) {
                collection.files.insert(fp.as_str().to_string(), name.clone());
                renamed = true;
            }
        }
        if renamed {
            store::save_collection_manifest(root, &collection)?;
            info!(root = %root.display(), "collection unchanged, refreshed filenames");
        }
        let manifest = store::load_build_manifest(&store::collection_index_dir(root))?;
        return Ok(BuildReport {
            manifest,
            warnings: Vec::new(),
            built: false,
            elapsed_seconds: start.elapsed().as_secs_f64(),
        });
    }

    let sources: Vec<PathBuf> = scan.values().map(|name| root.join(name)).collect();
    let report = build_index(&sources, &store::collection_index_dir(root), embedder, opts)?;

    let collection = CollectionManifest {
        files: scan.iter().map(|(fp, name)| (fp.as_str().to_string(), name.clone())).collect(),
        built_at: report.manifest.built_at.clone(),
        total_chunks: report.manifest.chunks,
    };
    store::save_collection_manifest(root, &collection)?;

    info!(
        root = %root.display(),
        files = collection.files.len(),
        chunks = collection.total_chunks,
        "collection index built"
    );
    Ok(report)
}

/// Summary of a per-file build sweep over a collection.
pub struct PerFileReport {
    pub built: usize,
    pub reused: usize,
    pub warnings: Vec<String>,
}

/// Build one index per source file under `root`, in `<root>/<fingerprint>/`
/// directories. Directories whose fingerprint already holds a valid index
/// built with the same model and parameters are reused untouched — this is
/// what makes renames free.
pub fn build_per_file(
    root: &Path,
    embedder: &dyn Embedder,
    opts: &BuildOptions,
) -> Result<PerFileReport> {
    let scan = directory_manifest(root)?;
    let mut report = PerFileReport { built: 0, reused: 0, warnings: Vec::new() };

    for (fp, name) in &scan {
        let dir = store::shard_dir(root, fp);
        let current = store::index_exists(&dir)
            && store::load_build_manifest(&dir).is_ok_and(|m| {
                m.embedding_model == embedder.model_id()
                    && m.chunk_size == opts.chunk_size
                    && m.chunk_overlap == opts.chunk_overlap
            });
        if current {
            report.reused += 1;
            continue;
        }
        match build_index(&[root.join(name)], &dir, embedder, opts) {
            Ok(built) => {
                report.built += 1;
                report.warnings.extend(built.warnings);
            }
            Err(e) => {
                warn!(file = name.as_str(), error = %e, "per-file build failed");
                report.warnings.push(format!("{name}: {e}"));
            }
        }
    }

    info!(
        root = %root.display(),
        built = report.built,
        reused = report.reused,
        "per-file indices ready"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;

    fn write_sources(dir: &Path, files: &[(&str, &str)]) {
        for (name, content) in files {
            std::fs::write(dir.join(name), content).unwrap();
        }
    }

    #[test]
    fn build_index_writes_complete_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_sources(dir.path(), &[("a.txt", "alpha beta gamma delta")]);
        let out = dir.path().join("out");
        let embedder = HashEmbedder::new(16);

        let report =
            build_index(&[dir.path().join("a.txt")], &out, &embedder, &BuildOptions::default())
                .unwrap();
        assert!(report.built);
        assert!(report.warnings.is_empty());
        assert_eq!(report.manifest.fingerprints.len(), 1);
        assert!(store::index_exists(&out));

        let (index, manifest) = store::load_index(&out, "hash-embedder").unwrap();
        assert_eq!(index.len(), manifest.chunks);
        assert_eq!(manifest.filename.as_deref(), Some("a.txt"));
    }

    #[test]
    fn unreadable_source_is_skipped_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        write_sources(dir.path(), &[("ok.txt", "some real text here")]);
        let out = dir.path().join("out");
        let embedder = HashEmbedder::new(16);

        let report = build_index(
            &[dir.path().join("ok.txt"), dir.path().join("missing.txt")],
            &out,
            &embedder,
            &BuildOptions::default(),
        )
        .unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.manifest.fingerprints.len(), 1);
    }

    #[test]
    fn all_sources_unreadable_aborts_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let embedder = HashEmbedder::new(16);

        let err = build_index(
            &[dir.path().join("missing.txt")],
            &out,
            &embedder,
            &BuildOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
        assert!(!out.exists());
    }

    #[test]
    fn collection_build_skips_when_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        write_sources(dir.path(), &[("a.txt", "first document"), ("b.txt", "second document")]);
        let embedder = HashEmbedder::new(16);
        let opts = BuildOptions::default();

        let first = build_collection(dir.path(), &embedder, &opts, false).unwrap();
        assert!(first.built);
        let second = build_collection(dir.path(), &embedder, &opts, false).unwrap();
        assert!(!second.built);
    }

    #[test]
    fn rename_reuses_index_and_updates_manifest() {
        let dir = tempfile::tempdir().unwrap();
        write_sources(dir.path(), &[("a.txt", "the renamable document")]);
        let embedder = HashEmbedder::new(16);
        let opts = BuildOptions::default();

        build_collection(dir.path(), &embedder, &opts, false).unwrap();
        let before = store::load_build_manifest(&store::collection_index_dir(dir.path())).unwrap();

        std::fs::rename(dir.path().join("a.txt"), dir.path().join("z.txt")).unwrap();
        let report = build_collection(dir.path(), &embedder, &opts, false).unwrap();
        assert!(!report.built, "rename must not trigger a rebuild");

        let after = store::load_build_manifest(&store::collection_index_dir(dir.path())).unwrap();
        assert_eq!(before.built_at, after.built_at);

        let collection = store::load_collection_manifest(dir.path()).unwrap().unwrap();
        assert_eq!(collection.files.values().next().map(String::as_str), Some("z.txt"));
    }

    #[test]
    fn changed_content_triggers_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        write_sources(dir.path(), &[("a.txt", "original content")]);
        let embedder = HashEmbedder::new(16);
        let opts = BuildOptions::default();

        build_collection(dir.path(), &embedder, &opts, false).unwrap();
        write_sources(dir.path(), &[("a.txt", "entirely different content")]);
        let report = build_collection(dir.path(), &embedder, &opts, false).unwrap();
        assert!(report.built);
    }

    #[test]
    fn per_file_build_creates_fingerprint_dirs_and_reuses() {
        let dir = tempfile::tempdir().unwrap();
        write_sources(dir.path(), &[("a.txt", "shard one"), ("b.txt", "shard two")]);
        let embedder = HashEmbedder::new(16);
        let opts = BuildOptions::default();

        let first = build_per_file(dir.path(), &embedder, &opts).unwrap();
        assert_eq!(first.built, 2);
        assert_eq!(first.reused, 0);

        for fp in directory_manifest(dir.path()).unwrap().keys() {
            assert!(store::index_exists(&store::shard_dir(dir.path(), fp)));
        }

        let second = build_per_file(dir.path(), &embedder, &opts).unwrap();
        assert_eq!(second.built, 0);
        assert_eq!(second.reused, 2);
    }
}
