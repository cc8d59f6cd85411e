//! File fingerprints for change detection and cache keys
//!
//! A fingerprint is `(size, modified time)`. Two equal fingerprints mean
//! "unchanged" without reading any content. The partial mode also hashes the
//! first bytes of the file to catch edits that preserve size and mtime.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::error::{HubError, Result};

/// Cheap, deterministic signature of a file's state
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    /// Modification time in nanoseconds relative to the Unix epoch
    pub modified_ns: i64,
    /// Hex blake3 digest of the leading bytes, only in partial mode
    pub content_hash: Option<String>,
}

impl Fingerprint {
    /// Feed every field into a hasher in a fixed order
    pub(crate) fn hash_into(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&self.size.to_le_bytes());
        hasher.update(&self.modified_ns.to_le_bytes());
        match &self.content_hash {
            Some(hash) => {
                hasher.update(&[1]);
                hasher.update(hash.as_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashMode {
    /// Size and modification time only
    Metadata,
    /// Also hash the first `sample_bytes` bytes of content
    Partial { sample_bytes: u64 },
}

impl Default for HashMode {
    fn default() -> Self {
        HashMode::Metadata
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContentHasher {
    mode: HashMode,
}

impl ContentHasher {
    pub fn new(mode: HashMode) -> Self {
        Self { mode }
    }

    /// Fingerprint a file. Fails with `HubError::Io` if the file is
    /// unreadable or disappeared between the stat and the read.
    pub fn fingerprint(&self, path: &Path) -> Result<Fingerprint> {
        let metadata = std::fs::metadata(path).map_err(|e| HubError::io(path, e))?;
        if !metadata.is_file() {
            return Err(HubError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        let modified = metadata.modified().map_err(|e| HubError::io(path, e))?;
        let modified_ns = match modified.duration_since(UNIX_EPOCH) {
            Ok(after) => after.as_nanos() as i64,
            Err(before) => -(before.duration().as_nanos() as i64),
        };
        let size = metadata.len();

        let content_hash = match self.mode {
            HashMode::Metadata => None,
            HashMode::Partial { sample_bytes } => Some(hash_prefix(path, size, sample_bytes)?),
        };

        Ok(Fingerprint {
            size,
            modified_ns,
            content_hash,
        })
    }
}

/// Hash the file size plus up to `sample_bytes` leading bytes
fn hash_prefix(path: &Path, size: u64, sample_bytes: u64) -> Result<String> {
    let file = File::open(path).map_err(|e| HubError::io(path, e))?;

    let mut hasher = blake3::Hasher::new();
    // include the file size in the checksum
    hasher.update(&size.to_le_bytes());

    let mut buf = Vec::with_capacity(sample_bytes.min(size) as usize);
    file.take(sample_bytes)
        .read_to_end(&mut buf)
        .map_err(|e| HubError::io(path, e))?;
    hasher.update(&buf);

    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_fingerprint_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crate.obj");
        std::fs::write(&path, b"v 0 0 0\n").unwrap();

        let hasher = ContentHasher::new(HashMode::Metadata);
        let first = hasher.fingerprint(&path).unwrap();
        let second = hasher.fingerprint(&path).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.size, 8);
        assert!(first.content_hash.is_none());
    }

    #[test]
    fn test_partial_hash_sees_content() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.obj");
        let b = dir.path().join("b.obj");
        std::fs::write(&a, b"v 0 0 0\n").unwrap();
        std::fs::write(&b, b"v 1 1 1\n").unwrap();

        let hasher = ContentHasher::new(HashMode::Partial { sample_bytes: 4096 });
        let fa = hasher.fingerprint(&a).unwrap();
        let fb = hasher.fingerprint(&b).unwrap();

        assert_eq!(fa.size, fb.size);
        assert_ne!(fa.content_hash, fb.content_hash);
        assert_eq!(fa.content_hash, hasher.fingerprint(&a).unwrap().content_hash);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let hasher = ContentHasher::new(HashMode::Metadata);
        let err = hasher.fingerprint(&dir.path().join("gone.fbx")).unwrap_err();
        assert!(matches!(err, HubError::Io { .. }));
    }
}
