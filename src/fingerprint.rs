//! Content fingerprinting for source files.
//!
//! A fingerprint is the first 128 bits of the SHA-256 digest of a file's raw
//! bytes, rendered as 32 lowercase hex characters. It depends only on file
//! contents — renaming a file never changes its fingerprint — and is stable
//! across processes and machines. Fingerprints name the on-disk index
//! directories, so the same 32-hex shape doubles as the reclaimer's safety
//! check.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{Error, Result};

/// Number of hex characters in a fingerprint.
pub const FINGERPRINT_LEN: usize = 32;

/// Read buffer size for streaming file digests.
const READ_BLOCK: usize = 8 * 1024;

/// A stable content fingerprint stored as 32 lowercase hex characters.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of an arbitrary byte slice.
    pub fn of_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_ref());
        Self(truncate_digest(&hasher.finalize()))
    }

    /// Compute the fingerprint of bytes read from `reader`, streaming in
    /// fixed-size blocks so large files are never held in memory.
    pub fn of_reader(mut reader: impl Read) -> Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0_u8; READ_BLOCK];
        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(Self(truncate_digest(&hasher.finalize())))
    }

    /// Compute the fingerprint of a file's contents.
    pub fn of_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| Error::SourceUnavailable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::of_reader(file)
    }

    /// Parse a fingerprint from its hex form, validating shape and case.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == FINGERPRINT_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn truncate_digest(digest: &[u8]) -> String {
    hex::encode(&digest[..FINGERPRINT_LEN / 2])
}

/// Fingerprint every regular file directly under `dir` (non-recursive) and
/// return the fingerprint → filename mapping.
///
/// Hidden files, `manifest.json`, and subdirectories (including fingerprint
/// index directories) are skipped. When two files share content, the first
/// filename in directory-sorted order wins and a warning is logged.
pub fn directory_manifest(dir: &Path) -> Result<BTreeMap<Fingerprint, String>> {
    let mut names: Vec<String> = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|e| Error::SourceUnavailable {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_source_name(&name) {
            names.push(name);
        }
    }
    names.sort();

    let mut manifest = BTreeMap::new();
    for name in names {
        let fp = Fingerprint::of_file(dir.join(&name))?;
        if let Some(existing) = manifest.get(&fp) {
            warn!(
                fingerprint = %fp,
                first = %existing,
                duplicate = %name,
                "duplicate file content, keeping first"
            );
            continue;
        }
        manifest.insert(fp, name);
    }
    Ok(manifest)
}

/// Whether a directory entry name counts as a source file.
pub fn is_source_name(name: &str) -> bool {
    !name.starts_with('.') && name != crate::store::MANIFEST_FILE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_content_only() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, b"the quick brown fox").unwrap();

        let f1 = Fingerprint::of_file(&a).unwrap();
        let f2 = Fingerprint::of_file(&a).unwrap();
        assert_eq!(f1, f2);
        assert_eq!(f1.as_str().len(), FINGERPRINT_LEN);

        // Renaming must not change the fingerprint.
        let b = dir.path().join("renamed.txt");
        std::fs::rename(&a, &b).unwrap();
        assert_eq!(Fingerprint::of_file(&b).unwrap(), f1);

        // Changing any byte must change it.
        std::fs::write(&b, b"the quick brown fox.").unwrap();
        assert_ne!(Fingerprint::of_file(&b).unwrap(), f1);
    }

    #[test]
    fn streaming_matches_in_memory() {
        let data = vec![7_u8; 100 * 1024]; // spans many read blocks
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, &data).unwrap();
        assert_eq!(Fingerprint::of_file(&path).unwrap(), Fingerprint::of_bytes(&data));
    }

    #[test]
    fn parse_rejects_bad_shapes() {
        assert!(Fingerprint::parse(&"a".repeat(32)).is_some());
        assert!(Fingerprint::parse(&"A".repeat(32)).is_none());
        assert!(Fingerprint::parse(&"a".repeat(31)).is_none());
        assert!(Fingerprint::parse(&"g".repeat(32)).is_none());
        assert!(Fingerprint::parse("").is_none());
    }

    #[test]
    fn directory_manifest_skips_hidden_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.txt"), b"one").unwrap();
        std::fs::write(dir.path().join("two.txt"), b"two").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();
        std::fs::write(dir.path().join("manifest.json"), b"{}").unwrap();
        std::fs::create_dir(dir.path().join("deadbeef")).unwrap();

        let manifest = directory_manifest(dir.path()).unwrap();
        let mut names: Vec<&str> = manifest.values().map(String::as_str).collect();
        names.sort();
        assert_eq!(names, vec!["one.txt", "two.txt"]);
    }

    #[test]
    fn directory_manifest_keeps_first_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"same").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"same").unwrap();

        let manifest = directory_manifest(dir.path()).unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.values().next().unwrap(), "a.txt");
    }
}
