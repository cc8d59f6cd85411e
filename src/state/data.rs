//! Shared data structures for the asset index
//!
//! These structs represent the data model that flows between the scanner,
//! the database layer and the query interface consumed by views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::scan::hasher::Fingerprint;
use crate::thumb::store::{CacheKey, ThumbnailSource};

pub type FolderId = i64;
pub type AssetId = i64;

/// What kind of file an asset is, decided by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Model,
    Image,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Model => "model",
            AssetKind::Image => "image",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "model" => Some(AssetKind::Model),
            "image" => Some(AssetKind::Image),
            _ => None,
        }
    }
}

/// A directory in the library tree
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FolderNode {
    pub id: FolderId,
    /// None for a library root
    pub parent_id: Option<FolderId>,
    /// Directory name (e.g., "props")
    pub name: String,
    pub path: PathBuf,
    pub last_scanned_at: Option<DateTime<Utc>>,
}

/// A same-name preview image sitting next to a model
/// (`car.fbx` + `car.png`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Companion {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
}

/// Weak link from an asset to its cached thumbnail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThumbnailRef {
    pub key: CacheKey,
    pub source: ThumbnailSource,
}

/// Represents a single asset in the index
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetRecord {
    /// Unique database ID
    pub id: AssetId,
    pub folder_id: FolderId,
    /// Full path to the asset file
    pub path: PathBuf,
    /// Filename only (e.g., "car.fbx")
    pub file_name: String,
    pub kind: AssetKind,
    pub fingerprint: Fingerprint,
    pub companion: Option<Companion>,
    /// None until a thumbnail has been produced
    pub thumbnail: Option<ThumbnailRef>,
    pub comment: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of a tree/grid listing
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildEntry {
    Folder(FolderNode),
    Asset(AssetRecord),
}

impl ChildEntry {
    pub fn name(&self) -> &str {
        match self {
            ChildEntry::Folder(folder) => &folder.name,
            ChildEntry::Asset(asset) => &asset.file_name,
        }
    }
}

/// A file observed by a scan, ready to be written to the index
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedFile {
    pub path: PathBuf,
    pub kind: AssetKind,
    pub fingerprint: Fingerprint,
    pub companion: Option<Companion>,
    /// Filled in by the coordinator once the thumbnail exists
    pub thumbnail: Option<ThumbnailRef>,
}

/// A path the scan could not look into, with a human readable reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPath {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of comparing a fresh walk against the index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffSet {
    /// Directory the walk started from
    pub root: PathBuf,
    pub added: Vec<ObservedFile>,
    pub updated: Vec<ObservedFile>,
    pub removed: Vec<PathBuf>,
    /// Warnings only, they never count as changes
    pub skipped: Vec<SkippedPath>,
}

impl DiffSet {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// True when the walk found nothing to add, update or remove
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }
}

/// What the index knew about one asset before a scan
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub fingerprint: Fingerprint,
    pub companion: Option<Companion>,
}

/// Path-keyed view of the assets under one folder
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    pub entries: HashMap<PathBuf, SnapshotEntry>,
}

impl IndexSnapshot {
    pub fn get(&self, path: &Path) -> Option<&SnapshotEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of a successful `apply_diff`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitResult {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub folders_created: usize,
    pub folders_pruned: usize,
    /// Folders whose children changed, for change notifications
    pub changed_folders: Vec<FolderId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LibraryStats {
    pub total_assets: i64,
    pub assets_with_thumbnail: i64,
    pub folders: i64,
    /// Extension → count, most common first
    pub assets_by_extension: Vec<(String, i64)>,
}

/// Lowercase extension of a path, empty when there is none
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Format a byte count as a readable string (e.g., "2.4 MB")
pub fn format_file_size(size_bytes: u64) -> String {
    let mut size = size_bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} PB")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(512), "512.0 B");
        assert_eq!(format_file_size(2_516_582), "2.4 MB");
    }

    #[test]
    fn test_extension_is_lowercased() {
        assert_eq!(extension_of(Path::new("/lib/Car.FBX")), "fbx");
        assert_eq!(extension_of(Path::new("/lib/README")), "");
    }

    #[test]
    fn test_skipped_paths_do_not_make_a_diff_dirty() {
        let mut diff = DiffSet::new("/lib");
        diff.skipped.push(SkippedPath {
            path: "/lib/locked".into(),
            reason: "permission denied".into(),
        });
        assert!(diff.is_empty());
        assert_eq!(diff.change_count(), 0);
    }
}
