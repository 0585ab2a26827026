//! Request validation.
//!
//! Everything here runs before any file I/O so a bad request never creates a
//! job, a temp file or an output directory.

use std::path::Path;

use crate::error::AppError;
use crate::models::{ConversionOptions, InputKind, OutputFormat, QualityProfile, Resolution, UseCase};

pub const MIN_QUALITY: i64 = 1;
pub const MAX_QUALITY: i64 = 100;
pub const MIN_DIMENSION: u32 = 100;
pub const MAX_DIMENSION: u32 = 16000;
/// Used for the missing side when only one of max width / max height is given
pub const DEFAULT_OTHER_DIMENSION: u32 = 8192;

/// Untyped conversion parameters as they arrive from a caller
#[derive(Debug, Clone)]
pub struct RawConversionParams {
    pub format: String,
    pub quality: Option<i64>,
    pub quality_profile: String,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub strip_metadata: bool,
    pub generate_thumbnails: bool,
    pub use_case: String,
    pub enable_deduplication: bool,
    pub optimize_storage: bool,
}

impl Default for RawConversionParams {
    fn default() -> Self {
        Self {
            format: "jpeg".to_string(),
            quality: None,
            quality_profile: "storage_optimized".to_string(),
            max_width: None,
            max_height: None,
            strip_metadata: true,
            generate_thumbnails: true,
            use_case: "web".to_string(),
            enable_deduplication: true,
            optimize_storage: true,
        }
    }
}

impl RawConversionParams {
    pub fn into_options(self) -> Result<ConversionOptions, AppError> {
        let quality = self.quality.map(validate_quality).transpose()?;
        let format: OutputFormat = self.format.parse()?;
        let quality_profile: QualityProfile = self.quality_profile.parse()?;
        let use_case: UseCase = self.use_case.parse()?;
        let max_resolution = resolve_max_resolution(self.max_width, self.max_height)?;

        Ok(ConversionOptions {
            format,
            quality,
            quality_profile,
            max_resolution,
            strip_metadata: self.strip_metadata,
            generate_thumbnails: self.generate_thumbnails,
            use_case,
            enable_deduplication: self.enable_deduplication,
            optimize_storage: self.optimize_storage,
        })
    }
}

pub fn validate_quality(quality: i64) -> Result<u8, AppError> {
    if !(MIN_QUALITY..=MAX_QUALITY).contains(&quality) {
        return Err(AppError::InvalidInput(format!(
            "Quality must be between {} and {}, got {}",
            MIN_QUALITY, MAX_QUALITY, quality
        )));
    }
    Ok(quality as u8)
}

/// Both sides unset means no ceiling. A single side gets the default for the other.
pub fn resolve_max_resolution(
    max_width: Option<u32>,
    max_height: Option<u32>,
) -> Result<Option<Resolution>, AppError> {
    for (name, value) in [("max_width", max_width), ("max_height", max_height)] {
        if let Some(v) = value {
            if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&v) {
                return Err(AppError::InvalidInput(format!(
                    "{} must be between {} and {}, got {}",
                    name, MIN_DIMENSION, MAX_DIMENSION, v
                )));
            }
        }
    }

    Ok(match (max_width, max_height) {
        (None, None) => None,
        (w, h) => Some(Resolution::new(
            w.unwrap_or(DEFAULT_OTHER_DIMENSION),
            h.unwrap_or(DEFAULT_OTHER_DIMENSION),
        )),
    })
}

/// Accept `.psd` and `.zip` uploads only.
pub fn input_kind_for(filename: &str) -> Result<InputKind, AppError> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    match extension.as_deref() {
        Some("psd") => Ok(InputKind::Psd),
        Some("zip") => Ok(InputKind::Zip),
        _ => Err(AppError::InvalidInput(format!(
            "Unsupported file type '{}', expected .psd or .zip",
            filename
        ))),
    }
}

pub fn validate_payload(filename: &str, len: u64, max_bytes: u64) -> Result<InputKind, AppError> {
    if filename.trim().is_empty() {
        return Err(AppError::InvalidInput("Filename is required".to_string()));
    }
    if len == 0 {
        return Err(AppError::InvalidInput(format!("File '{}' is empty", filename)));
    }
    if len > max_bytes {
        return Err(AppError::InvalidInput(format!(
            "File '{}' is {} bytes, maximum is {} bytes",
            filename, len, max_bytes
        )));
    }
    input_kind_for(filename)
}
