//! Asset discovery, indexing and thumbnail caching for libraries of 3D
//! models and images.
//!
//! A [`Coordinator`] ties the pieces together: the [`Scanner`] walks library
//! roots and diffs them against the [`AssetIndex`], the
//! [`ThumbnailPipeline`] renders previews into the [`ThumbnailStore`], and
//! the resulting changes are committed in one transaction and announced as
//! [`IndexEvent`]s.

pub mod config;
pub mod error;
pub mod scan;
pub mod state;
pub mod thumb;

pub use config::{EvictionPolicy, HubConfig};
pub use error::{HubError, Result};
pub use scan::coordinator::{Coordinator, CoordinatorState, IndexEvent, RescanTarget, ScanReport, ThumbnailFailure};
pub use scan::hasher::{ContentHasher, Fingerprint, HashMode};
pub use scan::scanner::Scanner;
pub use scan::watcher::FsWatcher;
pub use state::data::{AssetId, AssetKind, AssetRecord, ChildEntry, DiffSet, FolderId, FolderNode, LibraryStats};
pub use state::library::AssetIndex;
pub use thumb::pipeline::{ThumbnailPipeline, ThumbnailRequest};
pub use thumb::store::{CacheKey, ThumbnailEntry, ThumbnailSource, ThumbnailStore};
