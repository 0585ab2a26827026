use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use crate::error::AppError;

/// Target encoding for a converted image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    WebP,
    Avif,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 3] = [OutputFormat::Jpeg, OutputFormat::WebP, OutputFormat::Avif];

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::WebP => "webp",
            OutputFormat::Avif => "avif",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::WebP => "image/webp",
            OutputFormat::Avif => "image/avif",
        }
    }
}

impl Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "webp" => Ok(OutputFormat::WebP),
            "avif" => Ok(OutputFormat::Avif),
            _ => Err(AppError::InvalidInput(format!(
                "Invalid output format '{}', expected one of: jpeg, webp, avif",
                s
            ))),
        }
    }
}

/// Named preset mapping an output format to a compression quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityProfile {
    #[default]
    StorageOptimized,
    WebOptimized,
    MaximumCompression,
    HighQuality,
    /// Resolved by the recommendation engine before use
    Auto,
}

impl QualityProfile {
    /// Quality for `format`, or `None` for the unresolved `Auto` profile.
    pub fn quality_for(self, format: OutputFormat) -> Option<u8> {
        let (jpeg, webp, avif) = match self {
            QualityProfile::WebOptimized => (85, 80, 75),
            QualityProfile::StorageOptimized => (75, 70, 65),
            QualityProfile::MaximumCompression => (65, 60, 55),
            QualityProfile::HighQuality => (95, 90, 85),
            QualityProfile::Auto => return None,
        };
        Some(match format {
            OutputFormat::Jpeg => jpeg,
            OutputFormat::WebP => webp,
            OutputFormat::Avif => avif,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityProfile::StorageOptimized => "storage_optimized",
            QualityProfile::WebOptimized => "web_optimized",
            QualityProfile::MaximumCompression => "maximum_compression",
            QualityProfile::HighQuality => "high_quality",
            QualityProfile::Auto => "auto",
        }
    }
}

impl Display for QualityProfile {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityProfile {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "storage_optimized" => Ok(QualityProfile::StorageOptimized),
            "web_optimized" => Ok(QualityProfile::WebOptimized),
            "maximum_compression" => Ok(QualityProfile::MaximumCompression),
            "high_quality" => Ok(QualityProfile::HighQuality),
            "auto" => Ok(QualityProfile::Auto),
            _ => Err(AppError::InvalidInput(format!("Invalid quality profile: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UseCase {
    #[default]
    Web,
    Archive,
    Print,
}

impl Display for UseCase {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            UseCase::Web => write!(f, "web"),
            UseCase::Archive => write!(f, "archive"),
            UseCase::Print => write!(f, "print"),
        }
    }
}

impl FromStr for UseCase {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "web" => Ok(UseCase::Web),
            "archive" => Ok(UseCase::Archive),
            "print" => Ok(UseCase::Print),
            _ => Err(AppError::InvalidInput(format!("Invalid use case: {}", s))),
        }
    }
}

/// How the orchestrator is allowed to run conversion work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyMode {
    Threading,
    Multiprocessing,
    Async,
    #[default]
    Hybrid,
}

impl Display for ConcurrencyMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ConcurrencyMode::Threading => write!(f, "threading"),
            ConcurrencyMode::Multiprocessing => write!(f, "multiprocessing"),
            ConcurrencyMode::Async => write!(f, "async"),
            ConcurrencyMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl FromStr for ConcurrencyMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "threading" => Ok(ConcurrencyMode::Threading),
            "multiprocessing" => Ok(ConcurrencyMode::Multiprocessing),
            "async" => Ok(ConcurrencyMode::Async),
            "hybrid" => Ok(ConcurrencyMode::Hybrid),
            _ => Err(AppError::InvalidInput(format!("Invalid concurrency mode: {}", s))),
        }
    }
}

/// Pixel dimensions (also used as a width x height ceiling)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn megapixels(self) -> f64 {
        self.pixels() as f64 / 1_000_000.0
    }

    /// True when both sides fit within `bound`.
    pub fn fits_within(self, bound: Resolution) -> bool {
        self.width <= bound.width && self.height <= bound.height
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

impl Display for Resolution {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}x{}", self.width, self.height)
    }
}
