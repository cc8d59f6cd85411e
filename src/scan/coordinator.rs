//! Scan coordinator
//!
//! Owns the index, the thumbnail store and the pipeline, and drives one scan
//! batch at a time through `Scanning → Thumbnailing → Committing`. Rescan
//! requests are coalesced; requests that arrive while a batch runs are all
//! served by a single follow-up pass. Views read through the query methods
//! and learn about changes from the event channel.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{broadcast, watch, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::scanner::Scanner;
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::state::data::{AssetId, AssetRecord, ChildEntry, DiffSet, FolderId, FolderNode, SkippedPath, ThumbnailRef};
use crate::state::library::AssetIndex;
use crate::thumb::pipeline::{ThumbnailPipeline, ThumbnailRequest};
use crate::thumb::store::ThumbnailStore;

/// Capacity of the event channel. Slow subscribers see `Lagged` and should
/// re-query.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum RescanTarget {
    /// Every configured root
    All,
    Root(PathBuf),
    Folder(FolderId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Idle,
    Scanning,
    Thumbnailing,
    Committing,
    /// The last batch was stopped. Left on the next scan.
    Cancelled,
}

/// An asset whose thumbnail degraded to a placeholder or stayed in memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThumbnailFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Summary of one completed batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub roots: Vec<PathBuf>,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub folders_pruned: usize,
    pub skipped: Vec<SkippedPath>,
    pub thumbnail_failures: Vec<ThumbnailFailure>,
    pub duration_ms: u64,
}

impl ScanReport {
    pub fn change_count(&self) -> usize {
        self.added + self.updated + self.removed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IndexEvent {
    /// The children of a folder changed, re-query it
    IndexChanged { folder_id: FolderId },
    ScanStarted,
    ScanFinished { report: ScanReport },
    ScanCancelled,
    ScanFailed { error: String },
    StateChanged { state: CoordinatorState },
}

/// Coalesced set of outstanding rescan requests
#[derive(Debug, Default)]
struct PendingRescans {
    all: bool,
    targets: BTreeSet<RescanTarget>,
}

impl PendingRescans {
    fn push(&mut self, target: RescanTarget) {
        match target {
            RescanTarget::All => {
                self.all = true;
                self.targets.clear();
            }
            other if !self.all => {
                self.targets.insert(other);
            }
            _ => {}
        }
    }

    fn take(&mut self) -> Vec<RescanTarget> {
        if std::mem::take(&mut self.all) {
            self.targets.clear();
            return vec![RescanTarget::All];
        }
        std::mem::take(&mut self.targets).into_iter().collect()
    }

    fn clear(&mut self) {
        self.all = false;
        self.targets.clear();
    }
}

pub struct Coordinator {
    config: HubConfig,
    index: Arc<AssetIndex>,
    store: Arc<ThumbnailStore>,
    pipeline: Arc<ThumbnailPipeline>,
    scanner: Scanner,
    events: broadcast::Sender<IndexEvent>,
    state: watch::Sender<CoordinatorState>,
    pending: Mutex<PendingRescans>,
    wake: Notify,
    /// Held for the whole batch so at most one scan runs
    scan_lock: tokio::sync::Mutex<()>,
    current: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl Coordinator {
    /// Open the index and cache named by `config`
    pub fn open(mut config: HubConfig) -> Result<Arc<Self>> {
        config.normalize();
        config.validate()?;
        let index = Arc::new(AssetIndex::open(&config.database_path)?);
        let store = Arc::new(ThumbnailStore::open(&config.cache_directory_path, config.eviction)?);
        let pipeline = Arc::new(ThumbnailPipeline::new(&config));
        Ok(Self::with_parts(config, index, store, pipeline))
    }

    /// Assemble a coordinator from already opened parts
    pub fn with_parts(
        config: HubConfig,
        index: Arc<AssetIndex>,
        store: Arc<ThumbnailStore>,
        pipeline: Arc<ThumbnailPipeline>,
    ) -> Arc<Self> {
        let scanner = Scanner::new(&config);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(CoordinatorState::Idle);

        Arc::new(Self {
            config,
            index,
            store,
            pipeline,
            scanner,
            events,
            state,
            pending: Mutex::new(PendingRescans::default()),
            wake: Notify::new(),
            scan_lock: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<AssetIndex> {
        &self.index
    }

    pub fn store(&self) -> &Arc<ThumbnailStore> {
        &self.store
    }

    pub fn pipeline(&self) -> &Arc<ThumbnailPipeline> {
        &self.pipeline
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn watch_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    /// Queue a rescan for the background loop started by [`Coordinator::spawn`].
    /// Never blocks.
    pub fn request_rescan(&self, target: RescanTarget) {
        debug!("Rescan requested: {target:?}");
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(target);
        self.wake.notify_one();
    }

    /// Cancel the running batch and drop queued requests. The index keeps
    /// its state from before the batch.
    pub fn stop(&self) {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
        if let Some(token) = self.current.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            info!("Stopping current scan");
            token.cancel();
        }
    }

    /// Stop the background loop and any running batch
    pub fn shutdown(&self) {
        self.stop();
        self.shutdown.cancel();
    }

    /// Start the loop that serves `request_rescan`
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }

    async fn run(self: Arc<Self>) {
        info!("Coordinator started");
        loop {
            let targets = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take();
            if targets.is_empty() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.wake.notified() => continue,
                }
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            // Outcome already went out on the event channel
            let _ = self.rescan_targets(targets, self.shutdown.child_token()).await;
        }
        info!("Coordinator stopped");
    }

    /// Run one batch now and wait for it
    pub async fn rescan(&self, target: RescanTarget) -> Result<ScanReport> {
        self.rescan_with(target, self.shutdown.child_token()).await
    }

    /// Run one batch under a caller-owned cancellation token
    pub async fn rescan_with(&self, target: RescanTarget, cancel: CancellationToken) -> Result<ScanReport> {
        self.rescan_targets(vec![target], cancel).await
    }

    async fn rescan_targets(&self, targets: Vec<RescanTarget>, cancel: CancellationToken) -> Result<ScanReport> {
        let _guard = self.scan_lock.lock().await;
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());
        let _ = self.events.send(IndexEvent::ScanStarted);

        let result = self.execute(&targets, &cancel).await;
        self.current.lock().unwrap_or_else(PoisonError::into_inner).take();

        match &result {
            Ok(report) => {
                info!(
                    "Scan finished in {} ms: {} added, {} updated, {} removed, {} skipped, {} thumbnail failures",
                    report.duration_ms,
                    report.added,
                    report.updated,
                    report.removed,
                    report.skipped.len(),
                    report.thumbnail_failures.len()
                );
                self.set_state(CoordinatorState::Idle);
                let _ = self.events.send(IndexEvent::ScanFinished { report: report.clone() });
            }
            Err(e) if e.is_cancelled() => {
                info!("Scan cancelled, index left unchanged");
                self.set_state(CoordinatorState::Cancelled);
                let _ = self.events.send(IndexEvent::ScanCancelled);
            }
            Err(e) => {
                error!("Scan failed: {e}");
                self.set_state(CoordinatorState::Idle);
                let _ = self.events.send(IndexEvent::ScanFailed { error: e.to_string() });
            }
        }
        result
    }

    async fn execute(&self, targets: &[RescanTarget], cancel: &CancellationToken) -> Result<ScanReport> {
        let started = Instant::now();
        let mut report = ScanReport::default();
        if cancel.is_cancelled() {
            return Err(HubError::Cancelled);
        }

        let roots = self.resolve_targets(targets)?;
        report.roots = roots.clone();

        // Scanning
        self.set_state(CoordinatorState::Scanning);
        let mut diffs = Vec::with_capacity(roots.len());
        for root in roots {
            let index = Arc::clone(&self.index);
            let scanner = self.scanner.clone();
            let token = cancel.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let snapshot = index.snapshot(&root)?;
                scanner.scan(&root, &snapshot, &token)
            })
            .await?;

            match outcome {
                Ok(diff) => {
                    report.skipped.extend(diff.skipped.iter().cloned());
                    diffs.push(diff);
                }
                // An unreachable root is reported and left as indexed
                Err(HubError::Io { path, source }) => {
                    warn!("Skipping root {}: {source}", path.display());
                    report.skipped.push(SkippedPath {
                        path,
                        reason: source.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        // Thumbnailing
        self.set_state(CoordinatorState::Thumbnailing);
        report.thumbnail_failures = self.generate_thumbnails(&mut diffs, cancel).await?;

        // Committing
        if cancel.is_cancelled() {
            return Err(HubError::Cancelled);
        }
        self.set_state(CoordinatorState::Committing);
        let index = Arc::clone(&self.index);
        let committed = tokio::task::spawn_blocking(move || index.apply_batch(&diffs)).await??;

        for folder_id in &committed.changed_folders {
            let _ = self.events.send(IndexEvent::IndexChanged { folder_id: *folder_id });
        }

        report.added = committed.added;
        report.updated = committed.updated;
        report.removed = committed.removed;
        report.folders_pruned = committed.folders_pruned;
        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Turn requests into a list of directories, dropping any that sit
    /// inside another one on the list
    fn resolve_targets(&self, targets: &[RescanTarget]) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for target in targets {
            match target {
                RescanTarget::All => paths.extend(self.config.root_paths.iter().cloned()),
                RescanTarget::Root(path) => paths.push(path.clone()),
                RescanTarget::Folder(id) => {
                    let folder = self
                        .index
                        .get_folder(*id)?
                        .ok_or_else(|| HubError::NotFound(format!("folder {id}")))?;
                    paths.push(folder.path);
                }
            }
        }

        paths.sort();
        paths.dedup();
        let mut roots: Vec<PathBuf> = Vec::with_capacity(paths.len());
        for path in paths {
            if !roots.iter().any(|root| path.starts_with(root)) {
                roots.push(path);
            }
        }
        Ok(roots)
    }

    /// Produce thumbnails for every added or updated file, bounded by
    /// `scan_concurrency`, and attach the references to the diffs
    async fn generate_thumbnails(
        &self,
        diffs: &mut [DiffSet],
        cancel: &CancellationToken,
    ) -> Result<Vec<ThumbnailFailure>> {
        let permits = Arc::new(Semaphore::new(self.config.scan_concurrency));
        let mut tasks = JoinSet::new();

        for (d, diff) in diffs.iter().enumerate() {
            for (list, files) in [(0usize, &diff.added), (1usize, &diff.updated)] {
                for (i, file) in files.iter().enumerate() {
                    let request = ThumbnailRequest::from(file);
                    let permits = Arc::clone(&permits);
                    let pipeline = Arc::clone(&self.pipeline);
                    let store = Arc::clone(&self.store);
                    let token = cancel.clone();
                    tasks.spawn(async move {
                        let _permit = permits.acquire_owned().await.map_err(|_| HubError::Cancelled)?;
                        if token.is_cancelled() {
                            return Err(HubError::Cancelled);
                        }
                        let outcome = pipeline.thumbnail_for(&store, request).await;
                        Ok::<_, HubError>((d, list, i, outcome))
                    });
                }
            }
        }

        let mut failures = Vec::new();
        loop {
            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(HubError::Cancelled);
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else { break };
            let (d, list, i, outcome) = joined??;

            let diff = &mut diffs[d];
            let file = if list == 0 { &mut diff.added[i] } else { &mut diff.updated[i] };
            if let Some(reason) = outcome.failure {
                failures.push(ThumbnailFailure {
                    path: file.path.clone(),
                    reason,
                });
            }
            file.thumbnail = Some(ThumbnailRef {
                key: outcome.entry.key,
                source: outcome.entry.source,
            });
        }
        Ok(failures)
    }

    fn set_state(&self, state: CoordinatorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Coordinator state: {previous:?} -> {state:?}");
            let _ = self.events.send(IndexEvent::StateChanged { state });
        }
    }

    pub fn list_roots(&self) -> Result<Vec<FolderNode>> {
        self.index.list_roots()
    }

    pub fn list_children(&self, folder_id: FolderId) -> Result<Vec<ChildEntry>> {
        self.index.list_children(folder_id)
    }

    pub fn get_asset(&self, asset_id: AssetId) -> Result<Option<AssetRecord>> {
        self.index.get_asset(asset_id)
    }

    /// Encoded thumbnail for an asset. A missing or evicted entry is
    /// regenerated on the spot and the asset relinked to it.
    pub async fn get_thumbnail_bytes(&self, asset_id: AssetId) -> Result<Vec<u8>> {
        let asset = self
            .index
            .get_asset(asset_id)?
            .ok_or_else(|| HubError::NotFound(format!("asset {asset_id}")))?;

        if let Some(thumbnail) = &asset.thumbnail {
            if let Some(entry) = self.store.lookup(&thumbnail.key).await {
                match self.store.read_bytes(&entry).await {
                    Ok(bytes) => return Ok(bytes),
                    Err(HubError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        debug!("Regenerating thumbnail for {}", asset.path.display());
        let outcome = self
            .pipeline
            .thumbnail_for(&self.store, ThumbnailRequest::from(&asset))
            .await;
        let reference = ThumbnailRef {
            key: outcome.entry.key.clone(),
            source: outcome.entry.source,
        };
        if asset.thumbnail.as_ref() != Some(&reference) {
            let index = Arc::clone(&self.index);
            let relink = reference.clone();
            tokio::task::spawn_blocking(move || index.set_thumbnail(asset_id, &relink)).await??;
        }
        self.store.read_bytes(&outcome.entry).await
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("roots", &self.config.root_paths)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf, Arc<Coordinator>) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("library");
        fs::create_dir_all(&root).unwrap();
        let mut config = HubConfig::in_directory(dir.path().join(".hub"));
        config.root_paths = vec![root.clone()];
        config.decoder_enabled = false;
        let coordinator = Coordinator::open(config).unwrap();
        (dir, root, coordinator)
    }

    fn write(path: &Path, bytes: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_pending_all_absorbs_everything() {
        let mut pending = PendingRescans::default();
        pending.push(RescanTarget::Folder(3));
        pending.push(RescanTarget::All);
        pending.push(RescanTarget::Root(PathBuf::from("/lib")));
        assert_eq!(pending.take(), vec![RescanTarget::All]);
        assert!(pending.take().is_empty());
    }

    #[test]
    fn test_pending_deduplicates_targets() {
        let mut pending = PendingRescans::default();
        pending.push(RescanTarget::Folder(3));
        pending.push(RescanTarget::Folder(3));
        pending.push(RescanTarget::Root(PathBuf::from("/lib")));
        assert_eq!(pending.take().len(), 2);
    }

    #[tokio::test]
    async fn test_nested_targets_collapse() {
        let (_dir, root, coordinator) = setup();
        let nested = root.join("props");
        let roots = coordinator
            .resolve_targets(&[RescanTarget::Root(nested), RescanTarget::All])
            .unwrap();
        assert_eq!(roots, vec![root]);
    }

    #[tokio::test]
    async fn test_scan_emits_events_in_order() {
        let (_dir, root, coordinator) = setup();
        write(&root.join("props/barrel.obj"), b"v 0 0 0");
        let mut events = coordinator.subscribe();

        let report = coordinator.rescan(RescanTarget::All).await.unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(coordinator.state(), CoordinatorState::Idle);

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert_eq!(received.first(), Some(&IndexEvent::ScanStarted));
        let states: Vec<CoordinatorState> = received
            .iter()
            .filter_map(|event| match event {
                IndexEvent::StateChanged { state } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                CoordinatorState::Scanning,
                CoordinatorState::Thumbnailing,
                CoordinatorState::Committing,
                CoordinatorState::Idle,
            ]
        );
        assert!(received.iter().any(|e| matches!(e, IndexEvent::IndexChanged { .. })));
        assert!(matches!(received.last(), Some(IndexEvent::ScanFinished { report }) if report.added == 1));
    }

    #[tokio::test]
    async fn test_missing_root_is_skipped_not_wiped() {
        let (_dir, root, coordinator) = setup();
        write(&root.join("crate.fbx"), b"fbx");
        coordinator.rescan(RescanTarget::All).await.unwrap();

        fs::rename(&root, root.with_file_name("unmounted")).unwrap();
        let report = coordinator.rescan(RescanTarget::All).await.unwrap();

        assert_eq!(report.removed, 0);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(coordinator.index().count_assets().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_folder_target_fails() {
        let (_dir, _root, coordinator) = setup();
        let mut events = coordinator.subscribe();
        let err = coordinator.rescan(RescanTarget::Folder(999)).await.unwrap_err();
        assert!(matches!(err, HubError::NotFound(_)));
        assert!(std::iter::from_fn(|| events.try_recv().ok())
            .any(|event| matches!(event, IndexEvent::ScanFailed { .. })));
    }

    #[tokio::test]
    async fn test_thumbnail_bytes_regenerated_after_eviction() {
        let (_dir, root, coordinator) = setup();
        write(&root.join("chair.obj"), b"v 0 0 0");
        coordinator.rescan(RescanTarget::All).await.unwrap();

        let asset = coordinator
            .index()
            .find_by_path(&root.join("chair.obj"))
            .unwrap()
            .unwrap();
        let first = coordinator.get_thumbnail_bytes(asset.id).await.unwrap();
        assert!(!first.is_empty());

        coordinator.store().clear().await.unwrap();
        let again = coordinator.get_thumbnail_bytes(asset.id).await.unwrap();
        assert_eq!(first.len(), again.len());
        assert_eq!(coordinator.pipeline().invocations(), 2);
    }

    #[tokio::test]
    async fn test_background_loop_serves_requests() {
        let (_dir, root, coordinator) = setup();
        write(&root.join("lamp.glb"), b"glTF");
        let mut events = coordinator.subscribe();
        let handle = coordinator.spawn();

        coordinator.request_rescan(RescanTarget::All);
        let finished = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Ok(IndexEvent::ScanFinished { report }) => break report,
                    Ok(_) => continue,
                    Err(e) => panic!("event channel closed: {e}"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(finished.added, 1);

        coordinator.shutdown();
        tokio::time::timeout(Duration::from_secs(10), handle).await.unwrap().unwrap();
    }

    /// Wait for the next `ScanFinished`, or `None` when nothing more comes
    async fn next_finished(events: &mut broadcast::Receiver<IndexEvent>, within: Duration) -> Option<ScanReport> {
        tokio::time::timeout(within, async {
            loop {
                match events.recv().await {
                    Ok(IndexEvent::ScanFinished { report }) => break report,
                    Ok(_) => continue,
                    Err(e) => panic!("event channel closed: {e}"),
                }
            }
        })
        .await
        .ok()
    }

    #[tokio::test]
    async fn test_requests_during_a_batch_coalesce_into_one_follow_up() {
        let (_dir, root, coordinator) = setup();
        write(&root.join("lamp.glb"), b"glTF");
        let mut events = coordinator.subscribe();

        // Hold the batch lock so the first pass blocks right after taking its request
        let blocker = coordinator.scan_lock.lock().await;
        let handle = coordinator.spawn();
        coordinator.request_rescan(RescanTarget::All);
        tokio::time::timeout(Duration::from_secs(10), async {
            while coordinator.pending.lock().unwrap().all {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        for _ in 0..3 {
            coordinator.request_rescan(RescanTarget::Root(root.clone()));
            coordinator.request_rescan(RescanTarget::All);
        }
        drop(blocker);

        let first = next_finished(&mut events, Duration::from_secs(10)).await.unwrap();
        let second = next_finished(&mut events, Duration::from_secs(10)).await.unwrap();
        assert_eq!(first.added, 1);
        assert_eq!(second.change_count(), 0);
        assert!(next_finished(&mut events, Duration::from_millis(300)).await.is_none());

        coordinator.shutdown();
        tokio::time::timeout(Duration::from_secs(10), handle).await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_during_thumbnailing_leaves_index_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("library");
        fs::create_dir_all(&root).unwrap();
        write(&root.join("keep.obj"), b"keep");
        let mut config = HubConfig::in_directory(dir.path().join(".hub"));
        config.root_paths = vec![root.clone()];
        config.scan_concurrency = 1;
        let coordinator = Coordinator::open(config).unwrap();
        coordinator.rescan(RescanTarget::All).await.unwrap();
        let before = coordinator.index().snapshot(&root).unwrap();

        const TEXTURES: usize = 40;
        for i in 0..TEXTURES {
            image::RgbImage::from_pixel(512, 512, image::Rgb([i as u8, 90, 160]))
                .save(root.join(format!("texture_{i:02}.png")))
                .unwrap();
        }
        let generated = coordinator.pipeline().invocations();
        let mut events = coordinator.subscribe();
        let mut state = coordinator.watch_state();

        let token = CancellationToken::new();
        let scan = {
            let coordinator = Arc::clone(&coordinator);
            let token = token.clone();
            tokio::spawn(async move { coordinator.rescan_with(RescanTarget::All, token).await })
        };
        tokio::time::timeout(
            Duration::from_secs(10),
            state.wait_for(|state| *state == CoordinatorState::Thumbnailing),
        )
        .await
        .unwrap()
        .unwrap();
        token.cancel();

        let err = scan.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(coordinator.state(), CoordinatorState::Cancelled);
        assert!(coordinator.pipeline().invocations() - generated < TEXTURES);

        let received: Vec<IndexEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(received.contains(&IndexEvent::ScanCancelled));
        assert!(!received.contains(&IndexEvent::StateChanged {
            state: CoordinatorState::Committing
        }));
        assert_eq!(coordinator.index().snapshot(&root).unwrap().entries, before.entries);
        assert_eq!(coordinator.index().count_assets().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_batch_commits_nothing() {
        let (_dir, root, coordinator) = setup();
        write(&root.join("a.obj"), b"a");
        let token = CancellationToken::new();
        token.cancel();

        let err = coordinator.rescan_with(RescanTarget::All, token).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(coordinator.state(), CoordinatorState::Cancelled);
        assert_eq!(coordinator.index().count_assets().unwrap(), 0);
    }
}
