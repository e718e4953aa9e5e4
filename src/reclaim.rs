//! Cache reclamation — delete per-file index directories whose source file
//! no longer exists.
//!
//! Safety comes from the directory naming contract: only names that parse as
//! valid 32-hex fingerprints are ever considered, and an orphan is removed
//! whole or not at all — the reclaimer never reaches inside a fingerprint
//! directory for partial deletion.

use std::collections::BTreeSet;
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::fingerprint::{directory_manifest, Fingerprint};

/// Outcome of a reclamation pass.
#[derive(Clone, Debug, Serialize)]
pub struct ReclaimReport {
    pub dry_run: bool,
    /// Fingerprints of orphan directories found (and removed unless dry-run).
    pub orphans_found: Vec<String>,
    /// Fingerprint directories with a live source file.
    pub kept: usize,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
}

/// Walk `collection_root`, find per-file index directories with no matching
/// source file, and remove them (report-only when `dry_run`).
pub fn reclaim(collection_root: &Path, dry_run: bool) -> Result<ReclaimReport> {
    let live: BTreeSet<Fingerprint> =
        directory_manifest(collection_root)?.into_keys().collect();

    let mut report = ReclaimReport {
        dry_run,
        orphans_found: Vec::new(),
        kept: 0,
        bytes_freed: 0,
        errors: Vec::new(),
    };

    let entries = std::fs::read_dir(collection_root).map_err(|e| Error::SourceUnavailable {
        path: collection_root.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut orphan_dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        // Only fingerprint-shaped names are ours to manage.
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(fp) = Fingerprint::parse(&name) else {
            continue;
        };
        if live.contains(&fp) {
            report.kept += 1;
        } else {
            orphan_dirs.push((fp, entry.path()));
        }
    }
    orphan_dirs.sort_by(|a, b| a.0.cmp(&b.0));

    for (fp, dir) in orphan_dirs {
        let size = dir_size(&dir);
        if dry_run {
            info!(fingerprint = %fp, bytes = size, "orphan index (dry run, kept)");
        } else {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {
                    info!(fingerprint = %fp, bytes = size, "orphan index removed");
                }
                Err(e) => {
                    warn!(fingerprint = %fp, error = %e, "failed to remove orphan");
                    report.errors.push(format!("{fp}: {e}"));
                    continue;
                }
            }
        }
        report.bytes_freed += size;
        report.orphans_found.push(fp.into_string());
    }

    info!(
        root = %collection_root.display(),
        orphans = report.orphans_found.len(),
        kept = report.kept,
        bytes = report.bytes_freed,
        dry_run,
        "reclamation pass complete"
    );
    Ok(report)
}

/// Recursive byte size of a directory; unreadable entries count as zero.
fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            total += dir_size(&entry.path());
        } else {
            total += meta.len();
        }
    }
    total
}
