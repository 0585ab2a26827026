//! PSD Converter
//!
//! Single-file conversion in two modes:
//!
//! - **basic**: fixed format and quality, chroma subsampling by quality tier,
//!   optional pre-shrink for low qualities. No optimizer and no dedup.
//! - **optimized**: recommendation engine, the optimizer's encoder chain and
//!   thumbnails, followed by a write-through duplicate check over every
//!   produced artifact when dedup is enabled.
//!
//! Every failure comes back as a `ConversionResult` with `success == false`.

use image::RgbImage;
use psdforge_core::error::LogLevel;
use psdforge_core::{
    compression_ratio, AppError, ConversionOptions, ConversionResult, DeduplicationInfo,
    DuplicateReference, OutputFormat, QualityProfile, Resolution, DEFAULT_QUALITY,
};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::compression;
use crate::dedup::DuplicateDetector;
use crate::document::{self, exif_orientation, Composite, PsdHeader};
use crate::hashing::PerceptualHasher;
use crate::optimizer::{self, ImageOptimizer, OptimizeParams};
use crate::orientation::apply_orientation;
use crate::recommend::recommend;
use crate::validator::PsdValidator;

/// Basic mode shrinks large images below this quality
const PRESHRINK_QUALITY: u8 = 50;
const PRESHRINK_TRIGGER_SIDE: u32 = 2048;
const PRESHRINK_LOW_QUALITY: u8 = 30;
const PRESHRINK_LOW_SIDE: u32 = 1920;
const PRESHRINK_SIDE: u32 = 2048;

/// Action recorded for duplicate artifacts that stay on disk
const DUPLICATE_KEPT: &str = "kept_for_job";

/// Decoded source ready for encoding
struct Rendered {
    image: RgbImage,
    header: PsdHeader,
    was_empty: bool,
    original_size: u64,
}

pub struct PsdConverter {
    optimizer: ImageOptimizer,
    hasher: PerceptualHasher,
    validator: PsdValidator,
    detector: Option<Arc<DuplicateDetector>>,
}

impl PsdConverter {
    /// Converter without a hash index. Optimized conversions report dedup as disabled.
    pub fn new() -> Self {
        Self {
            optimizer: ImageOptimizer::new(),
            hasher: PerceptualHasher::new(),
            validator: PsdValidator::default(),
            detector: None,
        }
    }

    pub fn with_detector(mut self, detector: Arc<DuplicateDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_optimizer(mut self, optimizer: ImageOptimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_max_file_size(mut self, max_bytes: u64) -> Self {
        self.validator = PsdValidator::new(max_bytes);
        self
    }

    pub fn detector(&self) -> Option<&Arc<DuplicateDetector>> {
        self.detector.as_ref()
    }

    /// Dispatch on `options.optimize_storage`.
    pub fn convert(&self, input: &Path, output: &Path, options: &ConversionOptions) -> ConversionResult {
        if !options.optimize_storage {
            return self.convert_basic(
                input,
                output,
                options.format,
                options.quality.unwrap_or(DEFAULT_QUALITY),
            );
        }

        let mut result = self.convert_optimized(input, output, options);
        if options.enable_deduplication {
            self.apply_deduplication(&mut result);
        } else {
            result.deduplication = Some(DeduplicationInfo::disabled());
        }
        result
    }

    #[tracing::instrument(skip(self, input, output), fields(input = %input.display()))]
    pub fn convert_basic(
        &self,
        input: &Path,
        output: &Path,
        format: OutputFormat,
        quality: u8,
    ) -> ConversionResult {
        let start = Instant::now();
        let mut original_size = 0;
        match self.try_convert_basic(input, output, format, quality, &mut original_size) {
            Ok(result) => {
                tracing::info!(
                    original_size = result.original_size,
                    converted_size = result.optimized_size,
                    compression_ratio = result.compression_ratio,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Converted PSD"
                );
                result
            }
            Err(e) => self.failure(input, output, original_size, e),
        }
    }

    fn try_convert_basic(
        &self,
        input: &Path,
        output: &Path,
        format: OutputFormat,
        quality: u8,
        original_size: &mut u64,
    ) -> Result<ConversionResult, AppError> {
        let rendered = self.render(input, original_size)?;
        let image = preshrink_for_quality(rendered.image, quality);
        let image_hash = self.composite_hash(&image);

        let encoded = compression::encode_basic(&image, format, quality)?;
        if encoded.data.is_empty() {
            return Err(AppError::EncodeFailure(
                "Failed to create output file or file is empty".to_string(),
            ));
        }
        write_output(output, &encoded.data)?;

        let optimized_size = encoded.data.len() as u64;
        Ok(ConversionResult {
            success: true,
            input_file: Some(input.to_path_buf()),
            output_file: Some(output.to_path_buf()),
            original_size: rendered.original_size,
            optimized_size,
            compression_ratio: compression_ratio(optimized_size, rendered.original_size),
            format: Some(format),
            quality: Some(quality),
            dimensions: Some(Resolution::from(image.dimensions())),
            image_hash,
            file_hash: Some(sha256_hex(&encoded.data)),
            psd_color_mode: Some(rendered.header.color_mode_name().to_string()),
            composite_was_empty: rendered.was_empty,
            techniques: vec![encoded.technique.as_str().to_string()],
            ..ConversionResult::default()
        })
    }

    /// Optimized conversion without the dedup pass.
    #[tracing::instrument(skip(self, input, output, options), fields(input = %input.display(), format = %options.format))]
    pub fn convert_optimized(
        &self,
        input: &Path,
        output: &Path,
        options: &ConversionOptions,
    ) -> ConversionResult {
        let start = Instant::now();
        let mut original_size = 0;
        match self.try_convert_optimized(input, output, options, &mut original_size) {
            Ok(result) => {
                tracing::info!(
                    original_size = result.original_size,
                    optimized_size = result.optimized_size,
                    compression_ratio = result.compression_ratio,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Converted PSD with storage optimization"
                );
                result
            }
            Err(e) => self.failure(input, output, original_size, e),
        }
    }

    fn try_convert_optimized(
        &self,
        input: &Path,
        output: &Path,
        options: &ConversionOptions,
        original_size: &mut u64,
    ) -> Result<ConversionResult, AppError> {
        let rendered = self.render(input, original_size)?;
        let source_dims = Resolution::new(rendered.header.width, rendered.header.height);

        let recommendation = recommend(source_dims, rendered.original_size, options.use_case);
        tracing::debug!(reasoning = ?recommendation.reasoning, "Optimization recommendations");

        let quality_profile = match options.quality_profile {
            QualityProfile::Auto => recommendation.quality_profile,
            profile => profile,
        };
        let max_resolution = options.max_resolution.or_else(|| {
            recommendation
                .should_downscale
                .then_some(recommendation.recommended_max_resolution)
                .flatten()
        });

        let image_hash = self.composite_hash(&rendered.image);
        let params = OptimizeParams {
            format: options.format,
            quality_profile,
            custom_quality: options.quality,
            max_resolution,
            strip_metadata: options.strip_metadata,
            generate_thumbnails: options.generate_thumbnails,
        };
        let optimization = self.optimizer.try_optimize(rendered.image, output, &params)?;

        let file_hash = std::fs::read(output).ok().map(|data| sha256_hex(&data));
        Ok(ConversionResult {
            success: true,
            input_file: Some(input.to_path_buf()),
            output_file: Some(output.to_path_buf()),
            original_size: rendered.original_size,
            optimized_size: optimization.optimized_size,
            compression_ratio: compression_ratio(optimization.optimized_size, rendered.original_size),
            format: Some(options.format),
            quality: Some(optimization.quality),
            dimensions: Some(optimization.final_dimensions),
            image_hash,
            file_hash,
            psd_color_mode: Some(rendered.header.color_mode_name().to_string()),
            composite_was_empty: rendered.was_empty,
            thumbnails: optimization.thumbnails.clone(),
            techniques: optimization.techniques.clone(),
            optimization: Some(optimization),
            recommendations_used: Some(recommendation),
            ..ConversionResult::default()
        })
    }

    /// Check every artifact of a successful result against the hash index.
    ///
    /// Duplicates stay on disk and gain a `duplicate_references` entry.
    /// Unique artifacts are renamed to their hash-derived filename and the
    /// result's paths follow the rename.
    pub fn apply_deduplication(&self, result: &mut ConversionResult) {
        let Some(detector) = &self.detector else {
            result.deduplication = Some(DeduplicationInfo::disabled());
            return;
        };

        let files: Vec<PathBuf> = if result.success {
            result.artifacts().into_iter().filter(|p| p.exists()).collect()
        } else {
            Vec::new()
        };

        let mut info = DeduplicationInfo {
            enabled: true,
            files_checked: files.len(),
            ..DeduplicationInfo::default()
        };

        for path in files {
            let key = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            let check = detector.check_for_duplicate(&path);

            if check.is_duplicate {
                if let Some(closest) = &check.closest_match {
                    tracing::warn!(file = %key, distance = closest.distance, "Duplicate detected but keeping for job");
                    info.duplicate_references.insert(
                        key.clone(),
                        DuplicateReference {
                            original_path: path.display().to_string(),
                            existing_file: closest.record.clone(),
                            hash: closest.hash.clone(),
                            distance: closest.distance,
                            action: DUPLICATE_KEPT.to_string(),
                        },
                    );
                }
            } else if let Some(name) = &check.recommended_filename {
                let renamed = path.with_file_name(name);
                match std::fs::rename(&path, &renamed) {
                    Ok(()) => {
                        tracing::info!(from = %key, to = %name, "Renamed to hash-based filename");
                        retarget_paths(result, &path, &renamed);
                    }
                    Err(e) => {
                        tracing::warn!(file = %key, error = %e, "Failed to rename unique artifact");
                    }
                }
            }

            info.results.insert(key, check);
        }

        info.duplicates_found = info.results.values().filter(|r| r.is_duplicate).count();
        info.unique_files = info
            .results
            .values()
            .filter(|r| !r.is_duplicate && r.error.is_none())
            .count();
        tracing::info!(
            duplicates = info.duplicates_found,
            unique = info.unique_files,
            "Deduplication complete"
        );
        result.deduplication = Some(info);
    }

    /// Rough output size from the header dimensions alone.
    pub fn estimate_output_size(&self, input: &Path, quality: u8) -> Option<u64> {
        match PsdHeader::read_from_path(input) {
            Ok(header) if header.has_valid_dimensions() => {
                let pixels = u64::from(header.width) * u64::from(header.height);
                Some((pixels as f64 * bytes_per_pixel(quality)) as u64)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(input = %input.display(), error = %e, "Could not estimate size");
                None
            }
        }
    }

    /// Sequential basic conversions into `output_dir` as `{stem}.{ext}`.
    ///
    /// `callback` receives (percent, completed, total, result) after each file.
    pub fn batch_convert<F>(
        &self,
        inputs: &[PathBuf],
        output_dir: &Path,
        format: OutputFormat,
        quality: u8,
        mut callback: F,
    ) -> Vec<ConversionResult>
    where
        F: FnMut(f64, usize, usize, &ConversionResult),
    {
        let total = inputs.len();
        tracing::info!(total, "Starting batch conversion");

        let mut results = Vec::with_capacity(total);
        for (i, input) in inputs.iter().enumerate() {
            let stem = psdforge_core::utils::file_stem_or(input, "converted");
            let output = output_dir.join(format!("{}.{}", stem, format.extension()));
            let result = self.convert_basic(input, &output, format, quality);

            let progress = (i + 1) as f64 / total as f64 * 100.0;
            callback(progress, i + 1, total, &result);
            results.push(result);
        }

        let successful = results.iter().filter(|r| r.success).count();
        tracing::info!(successful, total, "Batch conversion completed");
        results
    }

    /// Validate, decode, composite and orient the PSD at `input`.
    fn render(&self, input: &Path, original_size: &mut u64) -> Result<Rendered, AppError> {
        let data = match std::fs::read(input) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::InvalidInput(format!(
                    "PSD file not found: {}",
                    input.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        *original_size = data.len() as u64;
        self.validator.validate_source(&data)?;

        let header = PsdHeader::parse(&data)?;
        if !header.has_valid_dimensions() {
            return Err(AppError::DecodeFailure("PSD has invalid dimensions".to_string()));
        }
        tracing::debug!(
            width = header.width,
            height = header.height,
            color_mode = header.color_mode_name(),
            "PSD opened"
        );

        let Composite {
            image, was_empty, ..
        } = document::composite(&data)?;

        let image = match exif_orientation(&data) {
            Some(orientation) => apply_orientation(image, orientation),
            None => image,
        };

        Ok(Rendered {
            image,
            header,
            was_empty,
            original_size: data.len() as u64,
        })
    }

    /// Mean hash of the composite. A failure only drops the field.
    fn composite_hash(&self, image: &RgbImage) -> Option<String> {
        match self.hasher.average_hash(image) {
            Ok(hash) => Some(hash),
            Err(e) => {
                tracing::warn!(error = %e, "Could not hash composite");
                None
            }
        }
    }

    fn failure(&self, input: &Path, output: &Path, original_size: u64, err: AppError) -> ConversionResult {
        match err.log_level() {
            LogLevel::Error => {
                tracing::error!(input = %input.display(), error = %err, "Error converting PSD")
            }
            _ => tracing::warn!(input = %input.display(), error = %err, "PSD conversion rejected"),
        }
        ConversionResult::failure(
            Some(input.to_path_buf()),
            Some(output.to_path_buf()),
            original_size,
            &err,
        )
    }
}

impl Default for PsdConverter {
    fn default() -> Self {
        Self::new()
    }
}

/// Basic-mode pre-shrink for low qualities on large images
pub fn preshrink_for_quality(image: RgbImage, quality: u8) -> RgbImage {
    if quality >= PRESHRINK_QUALITY {
        return image;
    }
    let (w, h) = image.dimensions();
    if w <= PRESHRINK_TRIGGER_SIDE && h <= PRESHRINK_TRIGGER_SIDE {
        return image;
    }
    let side = if quality < PRESHRINK_LOW_QUALITY {
        PRESHRINK_LOW_SIDE
    } else {
        PRESHRINK_SIDE
    };
    tracing::info!(width = w, height = h, max_side = side, "Resizing for compression");
    optimizer::downscale(image, Resolution::new(side, side))
}

pub fn bytes_per_pixel(quality: u8) -> f64 {
    match quality {
        90.. => 3.0,
        75..=89 => 2.0,
        50..=74 => 1.5,
        _ => 1.0,
    }
}

fn retarget_paths(result: &mut ConversionResult, from: &Path, to: &Path) {
    if result.output_file.as_deref() == Some(from) {
        result.output_file = Some(to.to_path_buf());
    }
    for thumb in result.thumbnails.iter_mut().filter(|t| t.path == from) {
        thumb.path = to.to_path_buf();
    }
    if let Some(optimization) = result.optimization.as_mut() {
        if optimization.output_path == from {
            optimization.output_path = to.to_path_buf();
        }
        for thumb in optimization.thumbnails.iter_mut().filter(|t| t.path == from) {
            thumb.path = to.to_path_buf();
        }
    }
}

fn write_output(path: &Path, data: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
