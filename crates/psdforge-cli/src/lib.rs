//! Shared pieces of the `psdforge` binary: option parsing, converter setup and
//! the isolated worker entry point.

use anyhow::Context;
use clap::Args;
use psdforge_core::validation::RawConversionParams;
use psdforge_core::{ConversionOptions, Config};
use psdforge_infra::{init_telemetry, LogTarget, TelemetryConfig};
use psdforge_processing::{DuplicateDetector, PsdConverter};
use psdforge_worker::{execute_request, WorkerRequest};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Conversion flags shared by `convert`, `archive` and `batch`
#[derive(Args, Debug, Clone)]
pub struct ConversionArgs {
    /// Output format: jpeg, webp or avif
    #[arg(long, default_value = "jpeg")]
    pub format: String,
    /// Quality 1-100 (overrides the profile)
    #[arg(long)]
    pub quality: Option<i64>,
    /// web_optimized, storage_optimized, maximum_compression or high_quality
    #[arg(long, default_value = "storage_optimized")]
    pub profile: String,
    #[arg(long)]
    pub max_width: Option<u32>,
    #[arg(long)]
    pub max_height: Option<u32>,
    /// Keep EXIF and other metadata in the output
    #[arg(long)]
    pub keep_metadata: bool,
    #[arg(long)]
    pub no_thumbnails: bool,
    /// web, archive or print
    #[arg(long, default_value = "web")]
    pub use_case: String,
    #[arg(long)]
    pub no_dedup: bool,
    /// Fixed-quality conversion without the storage optimizer
    #[arg(long)]
    pub basic: bool,
}

impl ConversionArgs {
    pub fn into_options(self) -> Result<ConversionOptions, psdforge_core::AppError> {
        RawConversionParams {
            format: self.format,
            quality: self.quality,
            quality_profile: self.profile,
            max_width: self.max_width,
            max_height: self.max_height,
            strip_metadata: !self.keep_metadata,
            generate_thumbnails: !self.no_thumbnails,
            use_case: self.use_case,
            enable_deduplication: !self.no_dedup,
            optimize_storage: !self.basic,
        }
        .into_options()
    }
}

/// Logs go to stderr so stdout carries only JSON.
pub fn init_tracing() -> anyhow::Result<()> {
    init_telemetry(&TelemetryConfig::from_env("psdforge").with_target(LogTarget::Stderr))
}

pub fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize output")?;
    println!("{}", out);
    Ok(())
}

pub fn load_config() -> anyhow::Result<Config> {
    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate()?;
    Ok(config)
}

pub fn open_detector(config: &Config) -> DuplicateDetector {
    DuplicateDetector::new(config.hash_index_path(), config.similarity_threshold)
}

/// Converter wired to the configured hash index
pub fn build_converter(config: &Config) -> PsdConverter {
    PsdConverter::new()
        .with_detector(Arc::new(open_detector(config)))
        .with_max_file_size(config.max_upload_bytes)
}

/// `input` with its extension replaced by the format's
pub fn default_output_path(input: &Path, options: &ConversionOptions) -> PathBuf {
    input.with_extension(options.format.extension())
}

/// Body of the hidden `worker` subcommand: run one request and write the
/// result as a single JSON document.
pub fn run_worker(request_path: &Path, out: &mut impl Write) -> anyhow::Result<()> {
    let request = WorkerRequest::read_from(request_path)
        .with_context(|| format!("Failed to read worker request {}", request_path.display()))?;
    tracing::debug!(input = %request.input.display(), "Worker executing request");

    let result = execute_request(&request);
    serde_json::to_writer(&mut *out, &result).context("Write worker result")?;
    out.flush()?;
    Ok(())
}
