//! Filesystem notifications as a rescan trigger
//!
//! Events are collected per root and flushed as `request_rescan` calls once
//! the burst has been quiet for the debounce window. Missed events are
//! harmless: an on-demand rescan always finds the same changes.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::coordinator::{Coordinator, RescanTarget};
use crate::error::{HubError, Result};

pub struct FsWatcher {
    // Dropping the watcher closes the event channel and ends the task
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
    roots: Vec<PathBuf>,
}

impl FsWatcher {
    /// Watch every configured root of `coordinator`. Roots that cannot be
    /// watched are logged and left to manual rescans; it is an error only
    /// when none can be.
    pub fn start(coordinator: Arc<Coordinator>) -> Result<Self> {
        let config = coordinator.config();
        let roots = config.root_paths.clone();
        let cache_dir = config.cache_directory_path.clone();
        let debounce = Duration::from_millis(config.watch_debounce_ms);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                if events_tx.send(result).is_err() {
                    debug!("Watcher event dropped, receiver closed");
                }
            },
            Config::default(),
        )?;

        let mut watched = Vec::new();
        for root in &roots {
            match watcher.watch(root, RecursiveMode::Recursive) {
                Ok(()) => {
                    info!("Watching {}", root.display());
                    watched.push(root.clone());
                }
                Err(e) => warn!("Cannot watch {}: {e}", root.display()),
            }
        }
        if watched.is_empty() && !roots.is_empty() {
            return Err(HubError::Config("none of the library roots could be watched".into()));
        }

        let task = tokio::spawn(flush_loop(coordinator, events_rx, watched.clone(), cache_dir, debounce));

        Ok(Self {
            _watcher: watcher,
            task,
            roots: watched,
        })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn stop(self) {
        self.task.abort();
        info!("File watcher stopped");
    }
}

async fn flush_loop(
    coordinator: Arc<Coordinator>,
    mut events_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    roots: Vec<PathBuf>,
    cache_dir: PathBuf,
    debounce: Duration,
) {
    let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let message = match deadline {
            None => events_rx.recv().await,
            Some(at) => match tokio::time::timeout_at(at, events_rx.recv()).await {
                Ok(message) => message,
                Err(_) => {
                    flush(&coordinator, &mut pending);
                    deadline = None;
                    continue;
                }
            },
        };

        let touched = match message {
            Some(Ok(event)) => {
                if !is_relevant(&event.kind) {
                    continue;
                }
                let mut touched = false;
                for path in &event.paths {
                    if let Some(root) = owning_root(path, &roots, &cache_dir) {
                        pending.insert(root.to_path_buf());
                        touched = true;
                    }
                }
                touched
            }
            // Overflow or backend failure, rescan everything we watch
            Some(Err(e)) => {
                error!("File watcher error: {e}");
                pending.extend(roots.iter().cloned());
                true
            }
            None => {
                flush(&coordinator, &mut pending);
                break;
            }
        };

        // Every change restarts the quiet window
        if touched && !pending.is_empty() {
            deadline = Some(Instant::now() + debounce);
        }
    }
    debug!("Watcher flush loop finished");
}

fn flush(coordinator: &Coordinator, pending: &mut BTreeSet<PathBuf>) {
    for root in std::mem::take(pending) {
        debug!("Filesystem changes under {}", root.display());
        coordinator.request_rescan(RescanTarget::Root(root));
    }
}

/// Reads and opens never change the index
fn is_relevant(kind: &EventKind) -> bool {
    !matches!(kind, EventKind::Access(_))
}

/// The most specific watched root containing `path`, unless the path is
/// inside the thumbnail cache
fn owning_root<'a>(path: &Path, roots: &'a [PathBuf], cache_dir: &Path) -> Option<&'a Path> {
    if path.starts_with(cache_dir) {
        return None;
    }
    roots
        .iter()
        .filter(|root| path.starts_with(root))
        .max_by_key(|root| root.components().count())
        .map(PathBuf::as_path)
}
