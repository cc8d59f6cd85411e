//! Content-addressed thumbnail cache
//!
//! Every entry lives in the cache directory as `<key>.jpg` with a
//! `<key>.json` sidecar describing it. Keys are derived from file content
//! fingerprints, never from asset ids, so an identical file reappearing
//! elsewhere reuses its thumbnail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::EvictionPolicy;
use crate::error::{HubError, Result};
use crate::state::data::format_file_size;

const IMAGE_EXTENSION: &str = "jpg";
const SIDECAR_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Filesystem-safe cache key (lowercase hex)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Accepts only lowercase hex so keys can never escape the cache directory
    pub fn from_hex(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let valid = !value.is_empty()
            && value.len() <= 128
            && value.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then_some(CacheKey(value))
    }

    pub fn from_hash(hash: blake3::Hash) -> Self {
        CacheKey(hash.to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a thumbnail's pixels came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThumbnailSource {
    /// A same-name image next to a model
    MatchedImage,
    /// Synthesized label image
    Placeholder,
    /// The asset itself was an image and was decoded directly
    DecodedPreview,
}

impl ThumbnailSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThumbnailSource::MatchedImage => "matched-image",
            ThumbnailSource::Placeholder => "placeholder",
            ThumbnailSource::DecodedPreview => "decoded-preview",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "matched-image" => Some(ThumbnailSource::MatchedImage),
            "placeholder" => Some(ThumbnailSource::Placeholder),
            "decoded-preview" => Some(ThumbnailSource::DecodedPreview),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageLocation {
    Disk { path: PathBuf },
    /// Kept only in memory because the cache directory refused the write
    Memory,
}

/// A cached preview image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailEntry {
    pub key: CacheKey,
    pub width: u32,
    pub height: u32,
    pub location: StorageLocation,
    pub source: ThumbnailSource,
    /// Image that was decoded to produce this entry, if any
    pub origin: Option<PathBuf>,
    /// Why the pipeline fell back to a placeholder, if it did
    pub fallback_reason: Option<String>,
    pub generated_at: DateTime<Utc>,
}

/// Encoded thumbnail produced by the pipeline, not yet stored
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedThumbnail {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub source: ThumbnailSource,
    pub origin: Option<PathBuf>,
    pub fallback_reason: Option<String>,
}

/// Running total of the images on disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheUsage {
    pub bytes: u64,
    pub entries: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub removed: usize,
    pub bytes_reclaimed: u64,
}

struct MemoryEntry {
    entry: ThumbnailEntry,
    bytes: Arc<Vec<u8>>,
}

pub struct ThumbnailStore {
    cache_dir: PathBuf,
    eviction: Option<EvictionPolicy>,
    /// One slot per key currently being generated
    in_flight: Mutex<HashMap<CacheKey, Arc<OnceCell<ThumbnailEntry>>>>,
    memory: RwLock<HashMap<CacheKey, MemoryEntry>>,
    /// Last access time in milliseconds, for LRU eviction
    last_access: Mutex<HashMap<CacheKey, i64>>,
    /// Counted once at open, then kept current by writes and removals
    usage: Mutex<CacheUsage>,
}

impl ThumbnailStore {
    /// Open (and create if needed) the cache directory
    pub fn open(cache_dir: impl Into<PathBuf>, eviction: Option<EvictionPolicy>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir).map_err(|e| HubError::io(&cache_dir, e))?;
        let usage = count_usage(&cache_dir)?;
        debug!(
            "Thumbnail cache at {} ({} entries, {})",
            cache_dir.display(),
            usage.entries,
            format_file_size(usage.bytes)
        );

        Ok(Self {
            cache_dir,
            eviction,
            in_flight: Mutex::new(HashMap::new()),
            memory: RwLock::new(HashMap::new()),
            last_access: Mutex::new(HashMap::new()),
            usage: Mutex::new(usage),
        })
    }

    /// Bytes and entry count of the images on disk, without listing the
    /// directory
    pub fn usage(&self) -> CacheUsage {
        *self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn over_budget(&self) -> bool {
        let Some(policy) = self.eviction else {
            return false;
        };
        policy.exceeded_by(self.usage())
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Get the image path for a key (doesn't generate, just returns the expected path)
    pub fn image_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(format!("{key}.{IMAGE_EXTENSION}"))
    }

    fn sidecar_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(format!("{key}.{SIDECAR_EXTENSION}"))
    }

    /// Return the cached entry for `key`, or run `generate` to create it.
    ///
    /// Concurrent calls for the same key share one generation: the first
    /// caller runs `generate` on a blocking worker, the others await its
    /// result.
    pub async fn get_or_create<F>(&self, key: &CacheKey, generate: F) -> Result<ThumbnailEntry>
    where
        F: FnOnce() -> RenderedThumbnail + Send + 'static,
    {
        if let Some(entry) = self.lookup(key).await {
            self.touch(key);
            return Ok(entry);
        }

        let slot = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            in_flight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = slot
            .get_or_try_init(|| async {
                // Someone may have finished this key between our lookup and taking the slot
                if let Some(entry) = self.lookup(key).await {
                    return Ok(entry);
                }
                let rendered = tokio::task::spawn_blocking(generate).await.map_err(|e| {
                    HubError::CacheWrite {
                        key: key.to_string(),
                        source: std::io::Error::new(ErrorKind::Other, e.to_string()),
                    }
                })?;
                self.persist(key, rendered).await
            })
            .await
            .cloned();

        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if in_flight.get(key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                in_flight.remove(key);
            }
        }

        let entry = result?;
        self.touch(key);
        if self.over_budget() {
            if let Err(e) = self.evict().await {
                warn!("Thumbnail eviction failed: {e}");
            }
        }
        Ok(entry)
    }

    /// Cached entry for `key` if one exists, in memory or on disk
    pub async fn lookup(&self, key: &CacheKey) -> Option<ThumbnailEntry> {
        if let Some(memory) = self
            .memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Some(memory.entry.clone());
        }

        let sidecar = fs::read(self.sidecar_path(key)).await.ok()?;
        let entry: ThumbnailEntry = match serde_json::from_slice(&sidecar) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Corrupt thumbnail sidecar for {key}: {e}");
                return None;
            }
        };

        // Sidecar without its image is as good as missing
        let StorageLocation::Disk { path } = &entry.location else {
            return None;
        };
        if fs::try_exists(path).await.unwrap_or(false) {
            Some(entry)
        } else {
            None
        }
    }

    /// Read the encoded image for an entry. `NotFound` if it was evicted.
    pub async fn read_bytes(&self, entry: &ThumbnailEntry) -> Result<Vec<u8>> {
        let bytes = match &entry.location {
            StorageLocation::Disk { path } => match fs::read(path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(HubError::NotFound(format!("thumbnail {}", entry.key)));
                }
                Err(e) => return Err(HubError::io(path, e)),
            },
            StorageLocation::Memory => self
                .memory
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&entry.key)
                .map(|memory| memory.bytes.as_ref().clone())
                .ok_or_else(|| HubError::NotFound(format!("thumbnail {}", entry.key)))?,
        };
        self.touch(&entry.key);
        Ok(bytes)
    }

    /// Keep a thumbnail in memory only. Used when the cache directory
    /// cannot be written so the asset still has something to display.
    pub fn insert_in_memory(&self, key: &CacheKey, rendered: RenderedThumbnail) -> ThumbnailEntry {
        let entry = ThumbnailEntry {
            key: key.clone(),
            width: rendered.width,
            height: rendered.height,
            location: StorageLocation::Memory,
            source: rendered.source,
            origin: rendered.origin,
            fallback_reason: rendered.fallback_reason,
            generated_at: Utc::now(),
        };
        self.memory.write().unwrap_or_else(PoisonError::into_inner).insert(
            key.clone(),
            MemoryEntry {
                entry: entry.clone(),
                bytes: Arc::new(rendered.bytes),
            },
        );
        self.touch(key);
        entry
    }

    /// Drop an entry from memory and disk. Missing files are fine.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        self.memory.write().unwrap_or_else(PoisonError::into_inner).remove(key);
        self.last_access.lock().unwrap_or_else(PoisonError::into_inner).remove(key);

        let image_path = self.image_path(key);
        let image_bytes = fs::metadata(&image_path).await.ok().map(|metadata| metadata.len());
        for path in [image_path, self.sidecar_path(key)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(HubError::io(&path, e)),
            }
        }
        if let Some(bytes) = image_bytes {
            let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
            usage.bytes = usage.bytes.saturating_sub(bytes);
            usage.entries = usage.entries.saturating_sub(1);
        }
        debug!("Invalidated thumbnail {key}");
        Ok(())
    }

    /// Write the image then its sidecar. The sidecar is what makes an entry
    /// visible, so a crash in between leaves only an orphan image.
    async fn persist(&self, key: &CacheKey, rendered: RenderedThumbnail) -> Result<ThumbnailEntry> {
        let image_path = self.image_path(key);
        let entry = ThumbnailEntry {
            key: key.clone(),
            width: rendered.width,
            height: rendered.height,
            location: StorageLocation::Disk {
                path: image_path.clone(),
            },
            source: rendered.source,
            origin: rendered.origin,
            fallback_reason: rendered.fallback_reason,
            generated_at: Utc::now(),
        };
        let sidecar = serde_json::to_vec_pretty(&entry)?;

        let cache_write = |source| HubError::CacheWrite {
            key: key.to_string(),
            source,
        };
        // An orphan image from an interrupted write is replaced, not added
        let replaced = fs::metadata(&image_path).await.ok().map(|metadata| metadata.len());
        self.write_atomic(&image_path, &rendered.bytes).await.map_err(cache_write)?;
        {
            let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
            match replaced {
                Some(old) => usage.bytes = usage.bytes.saturating_sub(old),
                None => usage.entries += 1,
            }
            usage.bytes += rendered.bytes.len() as u64;
        }
        self.write_atomic(&self.sidecar_path(key), &sidecar)
            .await
            .map_err(cache_write)?;

        debug!("Stored thumbnail {} ({}x{})", key, entry.width, entry.height);
        Ok(entry)
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut temp = path.as_os_str().to_owned();
        temp.push(".");
        temp.push(TEMP_EXTENSION);
        let temp = PathBuf::from(temp);

        fs::write(&temp, bytes).await?;
        if let Err(e) = fs::rename(&temp, path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e);
        }
        Ok(())
    }

    fn touch(&self, key: &CacheKey) {
        self.last_access
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), Utc::now().timestamp_millis());
    }

    /// Reclaim least recently used entries until the configured limits hold.
    /// Does nothing without an eviction policy. Lists the cache directory,
    /// so callers check [`ThumbnailStore::usage`] first.
    pub async fn evict(&self) -> Result<EvictionReport> {
        let Some(policy) = self.eviction else {
            return Ok(EvictionReport::default());
        };

        let mut entries = self.disk_entries().await?;
        let mut usage = CacheUsage {
            bytes: entries.iter().map(|e| e.bytes).sum(),
            entries: entries.len(),
        };
        // The listing is authoritative, resync the running total
        *self.usage.lock().unwrap_or_else(PoisonError::into_inner) = usage;
        if !policy.exceeded_by(usage) {
            return Ok(EvictionReport::default());
        }

        {
            let last_access = self.last_access.lock().unwrap_or_else(PoisonError::into_inner);
            for entry in entries.iter_mut() {
                if let Some(&accessed) = last_access.get(&entry.key) {
                    entry.accessed_ms = entry.accessed_ms.max(accessed);
                }
            }
        }
        entries.sort_by_key(|entry| entry.accessed_ms);

        let mut report = EvictionReport::default();
        for entry in entries {
            if !policy.exceeded_by(usage) {
                break;
            }
            self.invalidate(&entry.key).await?;
            usage.bytes = usage.bytes.saturating_sub(entry.bytes);
            usage.entries -= 1;
            report.removed += 1;
            report.bytes_reclaimed += entry.bytes;
        }

        if report.removed > 0 {
            info!(
                "Evicted {} thumbnails ({})",
                report.removed,
                format_file_size(report.bytes_reclaimed)
            );
        }
        Ok(report)
    }

    /// Remove every cached thumbnail. Returns the number of images deleted.
    pub async fn clear(&self) -> Result<usize> {
        let entries = self.disk_entries().await?;
        let count = entries.len();
        for entry in entries {
            self.invalidate(&entry.key).await?;
        }
        self.memory.write().unwrap_or_else(PoisonError::into_inner).clear();
        info!("Cleared {count} cached thumbnails");
        Ok(count)
    }

    /// Total size of cached images, raw and formatted
    pub async fn disk_usage(&self) -> Result<(u64, String)> {
        let total: u64 = self.disk_entries().await?.iter().map(|e| e.bytes).sum();
        Ok((total, format_file_size(total)))
    }

    async fn disk_entries(&self) -> Result<Vec<DiskEntry>> {
        let mut dir = fs::read_dir(&self.cache_dir)
            .await
            .map_err(|e| HubError::io(&self.cache_dir, e))?;

        let mut entries = Vec::new();
        while let Some(item) = dir.next_entry().await.map_err(|e| HubError::io(&self.cache_dir, e))? {
            let Some(key) = image_key(&item.path()) else {
                continue;
            };
            // Vanished since read_dir, skip it
            let Ok(metadata) = item.metadata().await else {
                continue;
            };
            let accessed_ms = metadata
                .modified()
                .ok()
                .map(DateTime::<Utc>::from)
                .map(|time| time.timestamp_millis())
                .unwrap_or(0);
            entries.push(DiskEntry {
                key,
                bytes: metadata.len(),
                accessed_ms,
            });
        }
        Ok(entries)
    }
}

impl fmt::Debug for ThumbnailStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThumbnailStore")
            .field("cache_dir", &self.cache_dir)
            .field("eviction", &self.eviction)
            .finish()
    }
}

struct DiskEntry {
    key: CacheKey,
    bytes: u64,
    accessed_ms: i64,
}

impl EvictionPolicy {
    fn exceeded_by(&self, usage: CacheUsage) -> bool {
        self.max_total_bytes.is_some_and(|max| usage.bytes > max)
            || self.max_entries.is_some_and(|max| usage.entries > max)
    }
}

/// Image key for a cache directory entry, if it is one
fn image_key(path: &Path) -> Option<CacheKey> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(IMAGE_EXTENSION) {
        return None;
    }
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(CacheKey::from_hex)
}

/// Startup count of the images already in the cache
fn count_usage(cache_dir: &Path) -> Result<CacheUsage> {
    let mut usage = CacheUsage::default();
    for item in std::fs::read_dir(cache_dir).map_err(|e| HubError::io(cache_dir, e))? {
        let item = item.map_err(|e| HubError::io(cache_dir, e))?;
        if image_key(&item.path()).is_none() {
            continue;
        }
        if let Ok(metadata) = item.metadata() {
            usage.bytes += metadata.len();
            usage.entries += 1;
        }
    }
    Ok(usage)
}
