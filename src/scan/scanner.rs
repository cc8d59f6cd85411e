//! Directory walker and change detection
//!
//! Walks a library root depth-first, classifies files by extension and
//! compares what it finds against an index snapshot. The result is a
//! `DiffSet` of added, updated and removed assets.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use super::hasher::ContentHasher;
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::state::data::{extension_of, AssetKind, Companion, DiffSet, IndexSnapshot, ObservedFile, SkippedPath};
use crate::thumb::pipeline::pick_matching_image;

/// Folders that never contain library assets (VCS metadata, tool caches, trash)
pub const IGNORED_DIRECTORIES: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    "__pycache__",
    ".mypy_cache",
    ".pytest_cache",
    ".vscode",
    ".idea",
    ".vs",
    ".mayaswatches",
    "incrementalsave",
    "node_modules",
    ".next",
    "build",
    "dist",
    ".cache",
    "$recycle.bin",
    "system volume information",
];

#[derive(Debug, Clone)]
pub struct Scanner {
    model_extensions: HashSet<String>,
    /// Same-name match priority order
    image_extensions: Vec<String>,
    hasher: ContentHasher,
    /// Directories to never descend into (the thumbnail cache, mostly)
    excluded: Vec<PathBuf>,
}

impl Scanner {
    pub fn new(config: &HubConfig) -> Self {
        let mut excluded = vec![config.cache_directory_path.clone()];
        if let Ok(canonical) = config.cache_directory_path.canonicalize() {
            excluded.push(canonical);
        }

        Self {
            model_extensions: config.supported_model_extensions.iter().cloned().collect(),
            image_extensions: config.supported_image_extensions.clone(),
            hasher: ContentHasher::new(config.hash_mode),
            excluded,
        }
    }

    /// Classify a file by extension, case-insensitively
    pub fn classify(&self, path: &Path) -> Option<AssetKind> {
        let ext = extension_of(path);
        if ext.is_empty() {
            None
        } else if self.model_extensions.contains(&ext) {
            Some(AssetKind::Model)
        } else if self.image_extensions.contains(&ext) {
            Some(AssetKind::Image)
        } else {
            None
        }
    }

    /// Walk `root` and diff it against `snapshot`
    pub fn scan(&self, root: &Path, snapshot: &IndexSnapshot, cancel: &CancellationToken) -> Result<DiffSet> {
        self.scan_with_progress(root, snapshot, cancel, |_| {})
    }

    /// Like [`Scanner::scan`], calling `on_entry` for every visited path
    pub fn scan_with_progress(
        &self,
        root: &Path,
        snapshot: &IndexSnapshot,
        cancel: &CancellationToken,
        mut on_entry: impl FnMut(&Path),
    ) -> Result<DiffSet> {
        // A missing root is an error rather than "everything was deleted",
        // so an unmounted drive never empties the index
        if !root.is_dir() {
            return Err(HubError::io(
                root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "library root is not a directory"),
            ));
        }

        info!("Scanning folder: {}", root.display());
        let mut diff = DiffSet::new(root);

        // Phase 1: collect candidate files grouped by directory
        let mut by_dir: BTreeMap<PathBuf, Vec<(PathBuf, AssetKind)>> = BTreeMap::new();
        let walker = WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.is_excluded(entry));

        for entry in walker {
            if cancel.is_cancelled() {
                debug!("Scan of {} cancelled during walk", root.display());
                return Err(HubError::Cancelled);
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().unwrap_or(root).to_path_buf();
                    let reason = match (err.loop_ancestor(), err.io_error()) {
                        (Some(ancestor), _) => format!("symlink loop back to {}", ancestor.display()),
                        (None, Some(io)) => io.to_string(),
                        (None, None) => err.to_string(),
                    };
                    warn!("Skipping {}: {reason}", path.display());
                    diff.skipped.push(SkippedPath { path, reason });
                    continue;
                }
            };

            on_entry(entry.path());

            if !entry.file_type().is_file() {
                continue;
            }
            let Some(kind) = self.classify(entry.path()) else {
                continue;
            };
            let Some(parent) = entry.path().parent() else {
                continue;
            };
            by_dir
                .entry(parent.to_path_buf())
                .or_default()
                .push((entry.path().to_path_buf(), kind));
        }

        // Phase 2: pair models with their preview images
        let mut candidates: Vec<(PathBuf, AssetKind, Option<PathBuf>)> = Vec::new();
        for files in by_dir.values() {
            let images: Vec<&Path> = files
                .iter()
                .filter(|(_, kind)| *kind == AssetKind::Image)
                .map(|(path, _)| path.as_path())
                .collect();
            let model_stems: HashSet<String> = files
                .iter()
                .filter(|(_, kind)| *kind == AssetKind::Model)
                .filter_map(|(path, _)| path.file_stem())
                .map(|stem| stem.to_string_lossy().to_lowercase())
                .collect();

            for (path, kind) in files {
                match kind {
                    AssetKind::Model => {
                        let companion = pick_matching_image(path, images.iter().copied(), &self.image_extensions);
                        candidates.push((path.clone(), AssetKind::Model, companion));
                    }
                    AssetKind::Image => {
                        // An image named after a model is that model's preview, not an asset
                        let stem = path
                            .file_stem()
                            .map(|stem| stem.to_string_lossy().to_lowercase())
                            .unwrap_or_default();
                        if !model_stems.contains(&stem) {
                            candidates.push((path.clone(), AssetKind::Image, None));
                        }
                    }
                }
            }
        }

        // Phase 3: fingerprint and compare against the snapshot
        let mut seen: HashSet<PathBuf> = HashSet::with_capacity(candidates.len());
        for (path, kind, companion_path) in candidates {
            if cancel.is_cancelled() {
                debug!("Scan of {} cancelled while fingerprinting", root.display());
                return Err(HubError::Cancelled);
            }

            let fingerprint = match self.hasher.fingerprint(&path) {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    // Vanished or unreadable between the walk and the stat
                    warn!("Skipping {}: {e}", path.display());
                    diff.skipped.push(SkippedPath {
                        reason: e.to_string(),
                        path,
                    });
                    continue;
                }
            };

            let companion = companion_path.and_then(|companion_path| {
                match self.hasher.fingerprint(&companion_path) {
                    Ok(fingerprint) => Some(Companion {
                        path: companion_path,
                        fingerprint,
                    }),
                    Err(e) => {
                        warn!("Ignoring preview {}: {e}", companion_path.display());
                        diff.skipped.push(SkippedPath {
                            reason: e.to_string(),
                            path: companion_path,
                        });
                        None
                    }
                }
            });

            seen.insert(path.clone());
            let observed = ObservedFile {
                path,
                kind,
                fingerprint,
                companion,
                thumbnail: None,
            };

            match snapshot.get(&observed.path) {
                None => diff.added.push(observed),
                Some(previous)
                    if previous.fingerprint != observed.fingerprint
                        || previous.companion != observed.companion =>
                {
                    diff.updated.push(observed)
                }
                Some(_) => {}
            }
        }

        // Phase 4: anything the index knew about that we did not see is gone,
        // unless it sits under a path we could not read
        let mut removed: Vec<PathBuf> = snapshot
            .entries
            .keys()
            .filter(|path| !seen.contains(*path))
            .filter(|path| !diff.skipped.iter().any(|skipped| path.starts_with(&skipped.path)))
            .cloned()
            .collect();
        removed.sort();
        diff.removed = removed;

        info!(
            "Scan of {} complete: {} new, {} updated, {} removed, {} skipped",
            root.display(),
            diff.added.len(),
            diff.updated.len(),
            diff.removed.len(),
            diff.skipped.len()
        );
        Ok(diff)
    }

    /// Hidden, junk and cache directories are not descended into. The root
    /// itself is always walked.
    fn is_excluded(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return false;
        }
        if self.excluded.iter().any(|excluded| is_same_dir(entry, excluded)) {
            return true;
        }
        is_hidden_folder(&entry.file_name().to_string_lossy())
    }
}

/// Whether `entry` is `dir`, also when the walk reached it through a
/// symlinked root. Only same-named entries are resolved.
fn is_same_dir(entry: &DirEntry, dir: &Path) -> bool {
    if entry.path() == dir {
        return true;
    }
    dir.file_name() == Some(entry.file_name())
        && entry
            .path()
            .canonicalize()
            .is_ok_and(|canonical| canonical == dir)
}

/// Check if a folder should be skipped when scanning
pub fn is_hidden_folder(name: &str) -> bool {
    if name.starts_with('.') || name.starts_with("__") {
        return true;
    }
    let lower = name.to_lowercase();
    IGNORED_DIRECTORIES.contains(&lower.as_str())
}
