//! Image Optimizer
//!
//! Turns a decoded RGB bitmap into a compressed artifact on disk: optional
//! sharpening, aspect-preserving downscale, profile-driven quality, the
//! encoder fallback chain from [`crate::compression`], metadata stripping and
//! thumbnail variants.

use image::imageops::{self, FilterType};
use image::RgbImage;
use psdforge_core::{
    compression_ratio, AppError, OptimizationResult, OutputFormat, QualityProfile, Resolution,
    ThumbnailInfo, UseCase,
};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::compression::{self, ExternalTools};
use crate::recommend::recommend;

/// Images larger than this on either side are downscaled even without an explicit ceiling
pub const HIGH_RES_THRESHOLD: Resolution = Resolution::new(4000, 4000);
/// Sharpening applies when the shorter side exceeds this
pub const SHARPEN_MIN_SIDE: u32 = 1000;
pub const THUMBNAIL_SIZES: [Resolution; 3] = [
    Resolution::new(150, 150),
    Resolution::new(300, 300),
    Resolution::new(800, 600),
];
const THUMBNAIL_QUALITY_BUMP: u8 = 10;
const MAX_THUMBNAIL_QUALITY: u8 = 95;
const SHARPEN_SIGMA: f32 = 0.5;
const SHARPEN_THRESHOLD: i32 = 3;

#[derive(Debug, Clone)]
pub struct OptimizeParams {
    pub format: OutputFormat,
    pub quality_profile: QualityProfile,
    pub custom_quality: Option<u8>,
    pub max_resolution: Option<Resolution>,
    pub strip_metadata: bool,
    pub generate_thumbnails: bool,
}

impl Default for OptimizeParams {
    fn default() -> Self {
        Self {
            format: OutputFormat::Jpeg,
            quality_profile: QualityProfile::StorageOptimized,
            custom_quality: None,
            max_resolution: None,
            strip_metadata: true,
            generate_thumbnails: true,
        }
    }
}

pub struct ImageOptimizer {
    tools: ExternalTools,
}

impl Default for ImageOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageOptimizer {
    /// Optimizer using whatever external encoders are installed
    pub fn new() -> Self {
        Self {
            tools: ExternalTools::detected(),
        }
    }

    pub fn with_tools(tools: ExternalTools) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> ExternalTools {
        self.tools
    }

    /// Optimize and report failures as an unsuccessful result.
    pub fn optimize(&self, image: RgbImage, output_path: &Path, params: &OptimizeParams) -> OptimizationResult {
        let original = Resolution::from(image.dimensions());
        match self.try_optimize(image, output_path, params) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, output = %output_path.display(), "Storage optimization failed");
                OptimizationResult {
                    success: false,
                    output_path: output_path.to_path_buf(),
                    original_dimensions: original,
                    final_dimensions: original,
                    format: params.format,
                    quality: params.custom_quality.unwrap_or(0),
                    quality_profile: params.quality_profile,
                    estimated_uncompressed_size: original.pixels() * 3,
                    optimized_size: 0,
                    compression_ratio: 0.0,
                    metadata_stripped: false,
                    resolution_optimized: false,
                    techniques: Vec::new(),
                    thumbnails: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Optimize, surfacing the typed error when no encoder succeeds.
    pub fn try_optimize(
        &self,
        image: RgbImage,
        output_path: &Path,
        params: &OptimizeParams,
    ) -> Result<OptimizationResult, AppError> {
        let start = Instant::now();
        let original = Resolution::from(image.dimensions());

        let mut image = sharpen_if_large(image);

        let resolution_target = params
            .max_resolution
            .or_else(|| should_downscale(original).then_some(HIGH_RES_THRESHOLD));
        if let Some(bound) = resolution_target {
            image = downscale(image, bound);
        }
        let final_dimensions = Resolution::from(image.dimensions());
        if final_dimensions != original {
            tracing::info!(from = %original, to = %final_dimensions, "Downscaled image");
        }

        let quality_profile = resolve_profile(params.quality_profile, original);
        let quality = effective_quality(params.custom_quality, quality_profile, params.format);

        let encoded = compression::encode_optimized(&image, params.format, quality, self.tools)?;
        let data = if params.strip_metadata {
            compression::strip_metadata(encoded.data, params.format)
        } else {
            encoded.data
        };
        write_artifact(output_path, &data)?;

        let thumbnails = if params.generate_thumbnails {
            generate_thumbnails(&image, output_path, params.format, quality)
        } else {
            Vec::new()
        };

        let estimated_uncompressed_size = original.pixels() * 3;
        let optimized_size = data.len() as u64;
        let ratio = compression_ratio(optimized_size, estimated_uncompressed_size);

        tracing::info!(
            output = %output_path.display(),
            format = %params.format,
            quality,
            size_bytes = optimized_size,
            compression_ratio = ratio,
            thumbnails = thumbnails.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Storage optimization complete"
        );

        Ok(OptimizationResult {
            success: true,
            output_path: output_path.to_path_buf(),
            original_dimensions: original,
            final_dimensions,
            format: params.format,
            quality,
            quality_profile,
            estimated_uncompressed_size,
            optimized_size,
            compression_ratio: ratio,
            metadata_stripped: params.strip_metadata,
            resolution_optimized: final_dimensions != original,
            techniques: vec![encoded.technique.as_str().to_string()],
            thumbnails,
            error: None,
        })
    }
}

pub fn should_downscale(size: Resolution) -> bool {
    size.width > HIGH_RES_THRESHOLD.width || size.height > HIGH_RES_THRESHOLD.height
}

/// `Auto` is resolved through the recommendation engine using the web use case.
pub fn resolve_profile(profile: QualityProfile, size: Resolution) -> QualityProfile {
    match profile {
        QualityProfile::Auto => recommend(size, 0, UseCase::Web).quality_profile,
        other => other,
    }
}

pub fn effective_quality(custom: Option<u8>, profile: QualityProfile, format: OutputFormat) -> u8 {
    custom
        .or_else(|| profile.quality_for(format))
        .or_else(|| QualityProfile::StorageOptimized.quality_for(format))
        .unwrap_or(psdforge_core::DEFAULT_QUALITY)
}

fn sharpen_if_large(image: RgbImage) -> RgbImage {
    let (w, h) = image.dimensions();
    if w.min(h) > SHARPEN_MIN_SIDE {
        imageops::unsharpen(&image, SHARPEN_SIGMA, SHARPEN_THRESHOLD)
    } else {
        image
    }
}

/// Fit within `bound` keeping aspect ratio. Never upscales.
pub fn downscale(image: RgbImage, bound: Resolution) -> RgbImage {
    let (w, h) = image.dimensions();
    let (nw, nh) = fit_within(Resolution::new(w, h), bound);
    if (nw, nh) == (w, h) {
        return image;
    }
    imageops::resize(&image, nw, nh, FilterType::Lanczos3)
}

/// Target dimensions for fitting `size` inside `bound`, clamped to a scale of 1.0.
/// Integer arithmetic, so the result is the exact floor.
pub fn fit_within(size: Resolution, bound: Resolution) -> (u32, u32) {
    let (w, h) = (u64::from(size.width), u64::from(size.height));
    let (bw, bh) = (u64::from(bound.width), u64::from(bound.height));
    if w == 0 || h == 0 || (w <= bw && h <= bh) {
        return (size.width, size.height);
    }
    let (nw, nh) = if bw * h <= bh * w {
        (bw, (h * bw / w).max(1))
    } else {
        ((w * bh / h).max(1), bh)
    };
    (nw as u32, nh as u32)
}

pub fn thumbnail_path(output_path: &Path, target: Resolution, format: OutputFormat) -> PathBuf {
    let stem = psdforge_core::utils::file_stem_or(output_path, "image");
    let name = format!("{}_thumb_{}x{}.{}", stem, target.width, target.height, format.extension());
    match output_path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

fn generate_thumbnails(
    image: &RgbImage,
    output_path: &Path,
    format: OutputFormat,
    quality: u8,
) -> Vec<ThumbnailInfo> {
    let thumb_quality = quality
        .saturating_add(THUMBNAIL_QUALITY_BUMP)
        .min(MAX_THUMBNAIL_QUALITY);
    let mut thumbnails = Vec::with_capacity(THUMBNAIL_SIZES.len());

    for target in THUMBNAIL_SIZES {
        let thumb = downscale(image.clone(), target);
        let path = thumbnail_path(output_path, target, format);

        let written = compression::encode_basic(&thumb, format, thumb_quality)
            .and_then(|encoded| write_artifact(&path, &encoded.data).map(|_| encoded.data.len()));
        match written {
            Ok(file_size) => {
                let dimensions = Resolution::from(thumb.dimensions());
                tracing::debug!(target = %target, actual = %dimensions, "Generated thumbnail");
                thumbnails.push(ThumbnailInfo {
                    target,
                    path,
                    file_size: file_size as u64,
                    dimensions,
                });
            }
            Err(e) => {
                tracing::warn!(target = %target, error = %e, "Failed to generate thumbnail");
            }
        }
    }

    thumbnails
}

fn write_artifact(path: &Path, data: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::rgb_image;
    use tempfile::tempdir;

    fn gradient(w: u32, h: u32) -> RgbImage {
        rgb_image(w, h, |x, y| [(x % 256) as u8, (y % 256) as u8, 90])
    }

    #[test]
    fn test_fit_within_never_upscales() {
        assert_eq!(fit_within(Resolution::new(100, 50), Resolution::new(400, 400)), (100, 50));
        assert_eq!(fit_within(Resolution::new(100, 50), Resolution::new(100, 50)), (100, 50));
        assert_eq!(fit_within(Resolution::new(8000, 4000), Resolution::new(4000, 4000)), (4000, 2000));
        assert_eq!(fit_within(Resolution::new(1000, 10), Resolution::new(150, 150)), (150, 1));
    }

    #[test]
    fn test_downscale_keeps_small_images() {
        let img = gradient(120, 80);
        let out = downscale(img, Resolution::new(120, 80));
        assert_eq!(out.dimensions(), (120, 80));
    }

    #[test]
    fn test_effective_quality() {
        assert_eq!(effective_quality(Some(42), QualityProfile::HighQuality, OutputFormat::Jpeg), 42);
        assert_eq!(effective_quality(None, QualityProfile::WebOptimized, OutputFormat::WebP), 80);
        assert_eq!(effective_quality(None, QualityProfile::Auto, OutputFormat::Avif), 65);
    }

    #[test]
    fn test_resolve_auto_profile() {
        assert_eq!(
            resolve_profile(QualityProfile::Auto, Resolution::new(500, 500)),
            QualityProfile::HighQuality
        );
        assert_eq!(
            resolve_profile(QualityProfile::MaximumCompression, Resolution::new(500, 500)),
            QualityProfile::MaximumCompression
        );
    }

    #[test]
    fn test_thumbnail_path() {
        let path = thumbnail_path(Path::new("/out/poster.webp"), Resolution::new(800, 600), OutputFormat::WebP);
        assert_eq!(path, PathBuf::from("/out/poster_thumb_800x600.webp"));
    }

    #[test]
    fn test_optimize_jpeg_with_thumbnails() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("nested").join("out.jpeg");
        let optimizer = ImageOptimizer::with_tools(ExternalTools::none());

        let result = optimizer.optimize(gradient(400, 300), &output, &OptimizeParams::default());

        assert!(result.success, "{:?}", result.error);
        assert!(output.exists());
        assert_eq!(result.quality, 75);
        assert_eq!(result.final_dimensions, Resolution::new(400, 300));
        assert!(!result.resolution_optimized);
        assert_eq!(result.estimated_uncompressed_size, 400 * 300 * 3);
        assert_eq!(result.techniques, vec!["builtin_optimized_jpeg".to_string()]);

        assert_eq!(result.thumbnails.len(), 3);
        let small = &result.thumbnails[0];
        assert_eq!(small.target, Resolution::new(150, 150));
        assert_eq!(small.dimensions, Resolution::new(150, 112));
        // 800x600 box is larger than the image, so no upscale
        assert_eq!(result.thumbnails[2].dimensions, Resolution::new(400, 300));
        assert!(small.path.exists());
    }

    #[test]
    fn test_optimize_respects_max_resolution() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.webp");
        let optimizer = ImageOptimizer::with_tools(ExternalTools::none());
        let params = OptimizeParams {
            format: OutputFormat::WebP,
            max_resolution: Some(Resolution::new(100, 100)),
            generate_thumbnails: false,
            ..OptimizeParams::default()
        };

        let result = optimizer.optimize(gradient(400, 200), &output, &params);
        assert!(result.success);
        assert_eq!(result.final_dimensions, Resolution::new(100, 50));
        assert!(result.resolution_optimized);
        assert!(result.thumbnails.is_empty());
    }

    #[test]
    fn test_compression_ratio_may_be_negative() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("tiny.jpeg");
        let optimizer = ImageOptimizer::with_tools(ExternalTools::none());
        let params = OptimizeParams {
            custom_quality: Some(100),
            generate_thumbnails: false,
            ..OptimizeParams::default()
        };

        // A 1x1 JPEG is far larger than its 3-byte uncompressed estimate
        let result = optimizer.optimize(gradient(1, 1), &output, &params);
        assert!(result.success);
        assert!(result.compression_ratio < 0.0);
    }
}
