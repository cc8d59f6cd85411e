//! Thumbnail generation pipeline
//!
//! For each asset, in priority order:
//! 1. a same-name image next to a model (`car.fbx` + `car.png`)
//! 2. the asset itself when it is an image
//! 3. a synthesized placeholder labelled with the extension
//!
//! `generate` never fails. Any decode problem degrades to the placeholder so
//! the index always has something to display.

use image::codecs::jpeg::JpegEncoder;
use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::placeholder;
use super::store::{CacheKey, RenderedThumbnail, ThumbnailEntry, ThumbnailSource, ThumbnailStore};
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::scan::hasher::Fingerprint;
use crate::state::data::{extension_of, AssetKind, AssetRecord, Companion, ObservedFile};

/// Bump whenever rendering changes so old cache entries stop matching
pub const PIPELINE_VERSION: &str = "asset-hub-thumbnail/1";

/// JPEG quality for cached thumbnails (small files, quick to load)
const JPEG_QUALITY: u8 = 85;

/// Everything the pipeline needs to know about one asset
#[derive(Debug, Clone, PartialEq)]
pub struct ThumbnailRequest {
    pub asset_path: PathBuf,
    pub kind: AssetKind,
    pub fingerprint: Fingerprint,
    /// Resolved by the scanner with [`find_matching_image`]
    pub companion: Option<Companion>,
}

impl From<&ObservedFile> for ThumbnailRequest {
    fn from(file: &ObservedFile) -> Self {
        Self {
            asset_path: file.path.clone(),
            kind: file.kind,
            fingerprint: file.fingerprint.clone(),
            companion: file.companion.clone(),
        }
    }
}

impl From<&AssetRecord> for ThumbnailRequest {
    fn from(asset: &AssetRecord) -> Self {
        Self {
            asset_path: asset.path.clone(),
            kind: asset.kind,
            fingerprint: asset.fingerprint.clone(),
            companion: asset.companion.clone(),
        }
    }
}

/// A stored thumbnail plus the reason it is degraded, if it is
#[derive(Debug, Clone, PartialEq)]
pub struct ThumbnailOutcome {
    pub entry: ThumbnailEntry,
    pub failure: Option<String>,
}

pub struct ThumbnailPipeline {
    max_dimension: u32,
    /// Same-name match priority order
    image_extensions: Vec<String>,
    /// Resolved once at startup
    decoder_available: bool,
    invocations: AtomicUsize,
}

impl ThumbnailPipeline {
    pub fn new(config: &HubConfig) -> Self {
        let decoder_available = config.decoder_enabled;
        if !decoder_available {
            debug!("Image decoding disabled, every thumbnail will be a placeholder");
        }
        Self {
            max_dimension: config.thumbnail_max_dimension,
            image_extensions: config.supported_image_extensions.clone(),
            decoder_available,
            invocations: AtomicUsize::new(0),
        }
    }

    pub fn decoder_available(&self) -> bool {
        self.decoder_available
    }

    pub fn max_dimension(&self) -> u32 {
        self.max_dimension
    }

    /// Number of times `generate` has run since startup
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Deterministic cache key for a request.
    ///
    /// Covers the pipeline version, output bound, decoder capability, the
    /// asset's extension and fingerprint and the companion's fingerprint.
    /// Size+mtime alone does not identify content, so without a content hash
    /// the path is mixed in as well.
    pub fn cache_key(&self, request: &ThumbnailRequest) -> CacheKey {
        let mut hasher = blake3::Hasher::new();
        hasher.update(PIPELINE_VERSION.as_bytes());
        hasher.update(&self.max_dimension.to_le_bytes());
        hasher.update(&[self.decoder_available as u8]);
        hasher.update(request.kind.as_str().as_bytes());
        hasher.update(extension_of(&request.asset_path).as_bytes());
        hasher.update(&[0]);
        request.fingerprint.hash_into(&mut hasher);

        if let Some(companion) = &request.companion {
            hasher.update(&[1]);
            hasher.update(extension_of(&companion.path).as_bytes());
            hasher.update(&[0]);
            companion.fingerprint.hash_into(&mut hasher);
            if companion.fingerprint.content_hash.is_none() {
                hasher.update(companion.path.to_string_lossy().as_bytes());
            }
        } else {
            hasher.update(&[0]);
        }

        if request.fingerprint.content_hash.is_none() {
            hasher.update(request.asset_path.to_string_lossy().as_bytes());
        }

        CacheKey::from_hash(hasher.finalize())
    }

    /// Produce an encoded thumbnail. Blocking, never fails.
    pub fn generate(&self, request: &ThumbnailRequest) -> RenderedThumbnail {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let preview = match (request.kind, &request.companion) {
            (AssetKind::Model, Some(companion)) => {
                Some((companion.path.as_path(), ThumbnailSource::MatchedImage))
            }
            (AssetKind::Model, None) => None,
            (AssetKind::Image, _) => Some((request.asset_path.as_path(), ThumbnailSource::DecodedPreview)),
        };

        let mut fallback_reason = None;
        if let Some((path, source)) = preview.filter(|_| self.decoder_available) {
            match self.decode_and_resize(path) {
                Ok(img) => return self.finish(img, source, Some(path.to_path_buf()), None),
                Err(e) => {
                    warn!("Falling back to placeholder for {}: {e}", request.asset_path.display());
                    fallback_reason = Some(e.to_string());
                }
            }
        }

        self.render_placeholder(request, fallback_reason)
    }

    /// Generate through the store so each key is rendered at most once.
    ///
    /// If the cache directory refuses the write, a placeholder is kept in
    /// memory instead and the failure is reported.
    pub async fn thumbnail_for(
        self: &Arc<Self>,
        store: &ThumbnailStore,
        request: ThumbnailRequest,
    ) -> ThumbnailOutcome {
        let key = self.cache_key(&request);
        let pipeline = Arc::clone(self);
        let worker_request = request.clone();

        match store
            .get_or_create(&key, move || pipeline.generate(&worker_request))
            .await
        {
            Ok(entry) => {
                let failure = entry.fallback_reason.clone();
                ThumbnailOutcome { entry, failure }
            }
            Err(e) => {
                warn!(
                    "Thumbnail for {} kept in memory only: {e}",
                    request.asset_path.display()
                );
                let reason = e.to_string();
                let placeholder = self.render_placeholder(&request, Some(reason.clone()));
                let entry = store.insert_in_memory(&key, placeholder);
                ThumbnailOutcome {
                    entry,
                    failure: Some(reason),
                }
            }
        }
    }

    fn render_placeholder(&self, request: &ThumbnailRequest, fallback_reason: Option<String>) -> RenderedThumbnail {
        let img = placeholder::render(&extension_of(&request.asset_path), self.max_dimension);
        self.finish(img, ThumbnailSource::Placeholder, None, fallback_reason)
    }

    fn finish(
        &self,
        img: RgbImage,
        source: ThumbnailSource,
        origin: Option<PathBuf>,
        fallback_reason: Option<String>,
    ) -> RenderedThumbnail {
        let (width, height) = img.dimensions();
        RenderedThumbnail {
            bytes: encode_jpeg(&img),
            width,
            height,
            source,
            origin,
            fallback_reason,
        }
    }

    /// Decode an image, flatten transparency onto white and shrink it to fit
    /// the square bound. Smaller images are left at their size.
    fn decode_and_resize(&self, path: &Path) -> Result<RgbImage> {
        let img = image::open(path).map_err(|e| HubError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let rgb = flatten_onto_white(img);
        let (width, height) = rgb.dimensions();
        if width <= self.max_dimension && height <= self.max_dimension {
            return Ok(rgb);
        }

        let resized = DynamicImage::ImageRgb8(rgb).resize(self.max_dimension, self.max_dimension, FilterType::Triangle);
        Ok(resized.to_rgb8())
    }
}

impl std::fmt::Debug for ThumbnailPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailPipeline")
            .field("max_dimension", &self.max_dimension)
            .field("decoder_available", &self.decoder_available)
            .field("invocations", &self.invocations())
            .finish()
    }
}

/// Find an image in the same folder sharing the model's base name.
///
/// Stems compare case-insensitively. When several match, the first
/// extension in `priority` wins (e.g. `car.png` over `car.jpg`).
pub fn find_matching_image(model_path: &Path, priority: &[String]) -> Option<PathBuf> {
    let directory = model_path.parent()?;
    let siblings: Vec<PathBuf> = std::fs::read_dir(directory)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect();
    pick_matching_image(model_path, siblings.iter().map(PathBuf::as_path), priority)
}

/// Same as [`find_matching_image`] over an already listed directory
pub fn pick_matching_image<'a>(
    model_path: &Path,
    siblings: impl Iterator<Item = &'a Path>,
    priority: &[String],
) -> Option<PathBuf> {
    let model_stem = model_path.file_stem()?.to_string_lossy().to_lowercase();

    let mut best: Option<(usize, &Path)> = None;
    for sibling in siblings {
        let Some(stem) = sibling.file_stem() else { continue };
        if stem.to_string_lossy().to_lowercase() != model_stem {
            continue;
        }
        let ext = extension_of(sibling);
        let Some(rank) = priority.iter().position(|p| *p == ext) else { continue };
        // Ties on rank (e.g. "Car.PNG" and "car.png" on case-sensitive filesystems) go to the smaller name
        let better = match best {
            None => true,
            Some((best_rank, best_path)) => rank < best_rank || (rank == best_rank && sibling < best_path),
        };
        if better {
            best = Some((rank, sibling));
        }
    }
    best.map(|(_, path)| path.to_path_buf())
}

fn flatten_onto_white(img: DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }

    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = pixel[3] as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    out
}

/// Encode as JPEG. Falls back to binary PPM, which cannot fail, so a
/// thumbnail always has bytes.
fn encode_jpeg(img: &RgbImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    match JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY).encode_image(img) {
        Ok(()) => bytes,
        Err(e) => {
            warn!("JPEG encoding failed, storing raw PPM: {e}");
            let mut ppm = format!("P6\n{} {}\n255\n", img.width(), img.height()).into_bytes();
            ppm.extend_from_slice(img.as_raw());
            ppm
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::hasher::{ContentHasher, HashMode};
    use image::Rgba;

    fn config(decoder_enabled: bool) -> HubConfig {
        HubConfig {
            decoder_enabled,
            ..HubConfig::default()
        }
    }

    fn fingerprint(path: &Path) -> Fingerprint {
        ContentHasher::new(HashMode::Metadata).fingerprint(path).unwrap()
    }

    fn write_png(path: &Path, width: u32, height: u32) {
        RgbImage::from_pixel(width, height, Rgb([10, 120, 200])).save(path).unwrap();
    }

    fn model_request(model: &Path, companion: Option<&Path>) -> ThumbnailRequest {
        ThumbnailRequest {
            asset_path: model.to_path_buf(),
            kind: AssetKind::Model,
            fingerprint: fingerprint(model),
            companion: companion.map(|path| Companion {
                path: path.to_path_buf(),
                fingerprint: fingerprint(path),
            }),
        }
    }

    #[test]
    fn test_matching_prefers_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("Car.fbx");
        std::fs::write(&model, b"fbx").unwrap();
        std::fs::write(dir.path().join("car.JPG"), b"jpg").unwrap();
        std::fs::write(dir.path().join("CAR.png"), b"png").unwrap();
        std::fs::write(dir.path().join("carpet.png"), b"png").unwrap();

        let priority = config(true).supported_image_extensions;
        let found = find_matching_image(&model, &priority).unwrap();
        assert_eq!(found.file_name().unwrap(), "CAR.png");
    }

    #[test]
    fn test_no_match_for_other_stems() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("chair.obj");
        std::fs::write(&model, b"obj").unwrap();
        std::fs::write(dir.path().join("table.png"), b"png").unwrap();

        assert!(find_matching_image(&model, &config(true).supported_image_extensions).is_none());
    }

    #[test]
    fn test_matched_image_is_resized_within_bound() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("car.fbx");
        let preview = dir.path().join("car.png");
        std::fs::write(&model, b"fbx").unwrap();
        write_png(&preview, 800, 400);

        let pipeline = ThumbnailPipeline::new(&config(true));
        let out = pipeline.generate(&model_request(&model, Some(&preview)));

        assert_eq!(out.source, ThumbnailSource::MatchedImage);
        assert_eq!((out.width, out.height), (256, 128));
        assert_eq!(out.origin.as_deref(), Some(preview.as_path()));
        assert!(image::load_from_memory(&out.bytes).is_ok());
    }

    #[test]
    fn test_configured_bound_is_respected_and_keyed() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("car.fbx");
        let preview = dir.path().join("car.png");
        std::fs::write(&model, b"fbx").unwrap();
        write_png(&preview, 800, 400);

        let small = ThumbnailPipeline::new(&HubConfig {
            thumbnail_max_dimension: 64,
            ..config(true)
        });
        assert_eq!(small.max_dimension(), 64);
        assert!(small.decoder_available());

        let request = model_request(&model, Some(&preview));
        let out = small.generate(&request);
        assert_eq!((out.width, out.height), (64, 32));
        assert_ne!(small.cache_key(&request), ThumbnailPipeline::new(&config(true)).cache_key(&request));
    }

    #[test]
    fn test_small_images_are_not_upscaled() {
        let dir = tempfile::tempdir().unwrap();
        let asset = dir.path().join("decal.png");
        write_png(&asset, 40, 30);

        let pipeline = ThumbnailPipeline::new(&config(true));
        let out = pipeline.generate(&ThumbnailRequest {
            asset_path: asset.clone(),
            kind: AssetKind::Image,
            fingerprint: fingerprint(&asset),
            companion: None,
        });

        assert_eq!(out.source, ThumbnailSource::DecodedPreview);
        assert_eq!((out.width, out.height), (40, 30));
    }

    #[test]
    fn test_transparent_pixels_become_white() {
        let img = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 0])));
        let flat = flatten_onto_white(img);
        assert_eq!(*flat.get_pixel(0, 0), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_undecodable_preview_falls_back_to_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("tree.blend");
        let preview = dir.path().join("tree.png");
        std::fs::write(&model, b"blend").unwrap();
        std::fs::write(&preview, b"definitely not a png").unwrap();

        let pipeline = ThumbnailPipeline::new(&config(true));
        let out = pipeline.generate(&model_request(&model, Some(&preview)));

        assert_eq!(out.source, ThumbnailSource::Placeholder);
        assert!(out.fallback_reason.is_some());
        assert!(!out.bytes.is_empty());
    }

    #[test]
    fn test_disabled_decoder_always_uses_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("car.fbx");
        let preview = dir.path().join("car.png");
        std::fs::write(&model, b"fbx").unwrap();
        write_png(&preview, 64, 64);

        let pipeline = ThumbnailPipeline::new(&config(false));
        assert!(!pipeline.decoder_available());
        let out = pipeline.generate(&model_request(&model, Some(&preview)));

        assert_eq!(out.source, ThumbnailSource::Placeholder);
        assert_eq!((out.width, out.height), (pipeline.max_dimension(), pipeline.max_dimension()));
        assert!(out.fallback_reason.is_none());
        assert_eq!(pipeline.invocations(), 1);
    }

    #[test]
    fn test_generation_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("car.fbx");
        let preview = dir.path().join("car.png");
        std::fs::write(&model, b"fbx").unwrap();
        write_png(&preview, 500, 300);

        let pipeline = ThumbnailPipeline::new(&config(true));
        let request = model_request(&model, Some(&preview));
        assert_eq!(pipeline.generate(&request), pipeline.generate(&request));
    }

    #[test]
    fn test_cache_key_changes_with_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("car.fbx");
        std::fs::write(&model, b"fbx").unwrap();

        let pipeline = ThumbnailPipeline::new(&config(true));
        let request = model_request(&model, None);
        let mut changed = request.clone();
        changed.fingerprint.size += 1;

        assert_eq!(pipeline.cache_key(&request), pipeline.cache_key(&request));
        assert_ne!(pipeline.cache_key(&request), pipeline.cache_key(&changed));
    }

    #[test]
    fn test_content_hashed_keys_ignore_location() {
        let hasher = ContentHasher::new(HashMode::Partial { sample_bytes: 1024 });
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("rock.obj");
        std::fs::write(&model, b"v 1 2 3").unwrap();

        let pipeline = ThumbnailPipeline::new(&config(true));
        let request = ThumbnailRequest {
            asset_path: model.clone(),
            kind: AssetKind::Model,
            fingerprint: hasher.fingerprint(&model).unwrap(),
            companion: None,
        };
        let moved = ThumbnailRequest {
            asset_path: dir.path().join("props").join("rock.obj"),
            ..request.clone()
        };

        assert_eq!(pipeline.cache_key(&request), pipeline.cache_key(&moved));
    }

    #[tokio::test]
    async fn test_thumbnail_for_reuses_cached_entry() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("chair.obj");
        std::fs::write(&model, b"obj").unwrap();
        let store = ThumbnailStore::open(dir.path().join("cache"), None).unwrap();
        let pipeline = Arc::new(ThumbnailPipeline::new(&config(false)));

        let first = pipeline.thumbnail_for(&store, model_request(&model, None)).await;
        let second = pipeline.thumbnail_for(&store, model_request(&model, None)).await;

        assert_eq!(first.entry, second.entry);
        assert_eq!(first.entry.source, ThumbnailSource::Placeholder);
        assert!(first.failure.is_none());
        assert_eq!(pipeline.invocations(), 1);
        assert!(!store.read_bytes(&first.entry).await.unwrap().is_empty());
    }
}
