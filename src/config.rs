//! Session configuration
//!
//! The hub treats these values as immutable inputs for a session. They are
//! usually produced by an external loader; `HubConfig::load` reads the same
//! shape from a JSON file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{HubError, Result};
use crate::scan::hasher::HashMode;

/// 3D formats recognized by default
pub const DEFAULT_MODEL_EXTENSIONS: &[&str] = &["fbx", "obj", "max", "abc", "blend", "gltf", "glb"];

/// Image formats recognized by default, in same-name match priority order
pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tga", "bmp"];

/// Size of generated thumbnails (square bound)
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 256;

/// Accepted range for `thumbnail_max_dimension`
pub const MIN_THUMBNAIL_SIZE: u32 = 16;
pub const MAX_THUMBNAIL_SIZE: u32 = 4096;

const APP_DIR_NAME: &str = "asset-hub";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Library roots to scan
    pub root_paths: Vec<PathBuf>,
    /// Lowercase extensions without the leading dot
    pub supported_model_extensions: Vec<String>,
    pub supported_image_extensions: Vec<String>,
    pub thumbnail_max_dimension: u32,
    /// Upper bound on concurrent thumbnail workers
    pub scan_concurrency: usize,
    pub cache_directory_path: PathBuf,
    pub database_path: PathBuf,
    pub hash_mode: HashMode,
    /// Whether preview images may be decoded at all. When off, every asset
    /// gets a placeholder.
    pub decoder_enabled: bool,
    pub eviction: Option<EvictionPolicy>,
    pub watch_filesystem: bool,
    pub watch_debounce_ms: u64,
}

/// Optional limits for the thumbnail cache. Least recently used entries are
/// reclaimed first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionPolicy {
    pub max_total_bytes: Option<u64>,
    pub max_entries: Option<usize>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            root_paths: Vec::new(),
            supported_model_extensions: DEFAULT_MODEL_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            supported_image_extensions: DEFAULT_IMAGE_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            thumbnail_max_dimension: DEFAULT_THUMBNAIL_SIZE,
            scan_concurrency: 4,
            cache_directory_path: default_cache_dir(),
            database_path: default_db_path(),
            hash_mode: HashMode::Metadata,
            decoder_enabled: true,
            eviction: None,
            watch_filesystem: false,
            watch_debounce_ms: 500,
        }
    }
}

impl HubConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| HubError::io(path, e))?;
        let mut config: HubConfig = serde_json::from_str(&text)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Configuration with every path rooted under `dir`. Handy for tests and
    /// portable installs.
    pub fn in_directory(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            cache_directory_path: dir.join("thumbnails"),
            database_path: dir.join("assets.db"),
            ..Self::default()
        }
    }

    /// Lowercase extensions and strip leading dots so lookups are
    /// case-insensitive, and make every path absolute so the scanner and
    /// watcher compare like with like.
    pub fn normalize(&mut self) {
        for list in [
            &mut self.supported_model_extensions,
            &mut self.supported_image_extensions,
        ] {
            for ext in list.iter_mut() {
                *ext = ext.trim_start_matches('.').to_ascii_lowercase();
            }
            list.retain(|ext| !ext.is_empty());
        }

        for root in self.root_paths.iter_mut() {
            *root = absolute(root);
        }
        self.cache_directory_path = absolute(&self.cache_directory_path);
        self.database_path = absolute(&self.database_path);
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_THUMBNAIL_SIZE..=MAX_THUMBNAIL_SIZE).contains(&self.thumbnail_max_dimension) {
            return Err(HubError::Config(format!(
                "thumbnail_max_dimension must be between {MIN_THUMBNAIL_SIZE} and {MAX_THUMBNAIL_SIZE}, got {}",
                self.thumbnail_max_dimension
            )));
        }
        if self.scan_concurrency == 0 {
            return Err(HubError::Config("scan_concurrency must be at least 1".into()));
        }
        if self.supported_model_extensions.is_empty() && self.supported_image_extensions.is_empty() {
            return Err(HubError::Config("no supported extensions configured".into()));
        }
        if let Some(ext) = self
            .supported_model_extensions
            .iter()
            .find(|ext| self.supported_image_extensions.contains(ext))
        {
            return Err(HubError::Config(format!(
                "extension '{ext}' is listed as both model and image"
            )));
        }
        if let HashMode::Partial { sample_bytes: 0 } = self.hash_mode {
            return Err(HubError::Config("partial hash sample size must be positive".into()));
        }
        Ok(())
    }
}

/// Resolve `path` against the working directory without touching symlinks.
/// A path that cannot be resolved is kept as given.
fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Get the path where the database should be stored
/// - Linux: ~/.local/share/asset-hub/assets.db
/// - macOS: ~/Library/Application Support/asset-hub/assets.db
/// - Windows: %APPDATA%\asset-hub\assets.db
fn default_db_path() -> PathBuf {
    let mut path = dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir);
    path.push(APP_DIR_NAME);
    path.push("assets.db");
    path
}

/// ~/.cache/asset-hub/thumbnails on Linux
fn default_cache_dir() -> PathBuf {
    let mut path = dirs::cache_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir);
    path.push(APP_DIR_NAME);
    path.push("thumbnails");
    path
}
