//! Error types for the asset hub
//!
//! Per-asset problems (`Io`, `Decode`, `CacheWrite`) are recorded and
//! worked around by the scan. Only `IndexCommit` ends a batch.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    /// A path was unreadable or vanished while we were looking at it
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Image bytes could not be decoded
    #[error("failed to decode {}: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },

    /// The thumbnail cache directory rejected a write (disk full, permissions)
    #[error("failed to write thumbnail {key}: {source}")]
    CacheWrite {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// The transactional apply of a diff failed and was rolled back
    #[error("index commit failed: {0}")]
    IndexCommit(#[source] rusqlite::Error),

    /// Any other storage-layer failure (open, query, schema)
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A thread panicked while holding an index connection
    #[error("index connection lock poisoned")]
    LockPoisoned,

    #[error("not found: {0}")]
    NotFound(String),

    /// Cooperative cancellation, not a failure
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking worker panicked or was aborted
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),
}

impl HubError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        HubError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, HubError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
