use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::dedup::DeduplicationInfo;
use super::options::{OutputFormat, QualityProfile, Resolution, UseCase};
use crate::error::AppError;

/// Quality used by basic conversions when the caller gives none
pub const DEFAULT_QUALITY: u8 = 75;

/// Per-request conversion settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionOptions {
    pub format: OutputFormat,
    /// Explicit quality override. `None` uses the profile table.
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub quality_profile: QualityProfile,
    #[serde(default)]
    pub max_resolution: Option<Resolution>,
    pub strip_metadata: bool,
    pub generate_thumbnails: bool,
    #[serde(default)]
    pub use_case: UseCase,
    pub enable_deduplication: bool,
    /// `false` selects the basic conversion path.
    pub optimize_storage: bool,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Jpeg,
            quality: None,
            quality_profile: QualityProfile::StorageOptimized,
            max_resolution: None,
            strip_metadata: true,
            generate_thumbnails: true,
            use_case: UseCase::Web,
            enable_deduplication: true,
            optimize_storage: true,
        }
    }
}

impl ConversionOptions {
    /// Options for the basic path: fixed quality and format, no optimizer, no dedup.
    pub fn basic(format: OutputFormat, quality: u8) -> Self {
        Self {
            format,
            quality: Some(quality),
            generate_thumbnails: false,
            enable_deduplication: false,
            optimize_storage: false,
            ..Self::default()
        }
    }
}

/// Inbound conversion request: raw bytes plus options
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub source: Bytes,
    pub filename: String,
    pub options: ConversionOptions,
}

impl ConversionRequest {
    pub fn new(source: impl Into<Bytes>, filename: impl Into<String>, options: ConversionOptions) -> Self {
        Self {
            source: source.into(),
            filename: filename.into(),
            options,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThumbnailInfo {
    /// Requested bounding box
    pub target: Resolution,
    pub path: PathBuf,
    pub file_size: u64,
    /// Actual size after aspect-preserving fit
    pub dimensions: Resolution,
}

/// Output of the Image Optimizer for a single bitmap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub success: bool,
    pub output_path: PathBuf,
    pub original_dimensions: Resolution,
    pub final_dimensions: Resolution,
    pub format: OutputFormat,
    pub quality: u8,
    pub quality_profile: QualityProfile,
    /// width x height x 3 of the input bitmap
    pub estimated_uncompressed_size: u64,
    pub optimized_size: u64,
    /// Against the uncompressed estimate. Negative when the artifact is larger.
    pub compression_ratio: f64,
    pub metadata_stripped: bool,
    pub resolution_optimized: bool,
    pub techniques: Vec<String>,
    pub thumbnails: Vec<ThumbnailInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Output of the recommendation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub quality_profile: QualityProfile,
    pub should_downscale: bool,
    pub recommended_max_resolution: Option<Resolution>,
    pub recommended_formats: Vec<OutputFormat>,
    pub generate_thumbnails: bool,
    pub strip_metadata: bool,
    pub reasoning: Vec<String>,
}

/// Outcome of a single PSD conversion. Failures are values, not panics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionResult {
    pub success: bool,
    #[serde(default)]
    pub input_file: Option<PathBuf>,
    /// Final artifact location (after any hash-based rename)
    #[serde(default)]
    pub output_file: Option<PathBuf>,
    pub original_size: u64,
    pub optimized_size: u64,
    /// `(1 - optimized / original) * 100` against the PSD byte size
    pub compression_ratio: f64,
    #[serde(default)]
    pub format: Option<OutputFormat>,
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub dimensions: Option<Resolution>,
    /// Perceptual hash of the composited bitmap
    #[serde(default)]
    pub image_hash: Option<String>,
    /// SHA-256 of the output file bytes
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub psd_color_mode: Option<String>,
    #[serde(default)]
    pub composite_was_empty: bool,
    #[serde(default)]
    pub thumbnails: Vec<ThumbnailInfo>,
    #[serde(default)]
    pub techniques: Vec<String>,
    #[serde(default)]
    pub optimization: Option<OptimizationResult>,
    #[serde(default)]
    pub recommendations_used: Option<Recommendation>,
    #[serde(default)]
    pub deduplication: Option<DeduplicationInfo>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<String>,
}

impl ConversionResult {
    /// Failure result that keeps whatever was measured before the error.
    pub fn failure(input: Option<PathBuf>, output: Option<PathBuf>, original_size: u64, err: &AppError) -> Self {
        Self {
            success: false,
            input_file: input,
            output_file: output,
            original_size,
            error: Some(err.to_string()),
            error_kind: Some(err.kind().to_string()),
            ..Self::default()
        }
    }

    /// The typed error of a failed result
    pub fn to_error(&self) -> Option<AppError> {
        if self.success {
            return None;
        }
        let message = self.error.clone().unwrap_or_else(|| "Unknown error".to_string());
        Some(AppError::from_kind(
            self.error_kind.as_deref().unwrap_or("internal"),
            message,
        ))
    }

    /// Every artifact written by this conversion: primary output then thumbnails.
    pub fn artifacts(&self) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(1 + self.thumbnails.len());
        if let Some(output) = &self.output_file {
            paths.push(output.clone());
        }
        paths.extend(self.thumbnails.iter().map(|t| t.path.clone()));
        paths
    }
}

/// Compression ratio in percent, rounded to two decimals. May be negative.
pub fn compression_ratio(optimized: u64, baseline: u64) -> f64 {
    if baseline == 0 {
        return 0.0;
    }
    let ratio = (1.0 - optimized as f64 / baseline as f64) * 100.0;
    (ratio * 100.0).round() / 100.0
}
