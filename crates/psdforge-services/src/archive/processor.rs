use futures::stream::{FuturesUnordered, StreamExt};
use psdforge_core::{compression_ratio, AppError, ConversionOptions, ConversionResult};
use psdforge_processing::PsdConverter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::extract::extract_psds;
use super::validate::validate_archive;
use super::{ArchiveError, ArchiveLimits};

/// Called after each file finishes: `(percent, completed, total, outcome)`
pub type ProgressCallback = Arc<dyn Fn(f64, usize, usize, &FileOutcome) + Send + Sync>;

/// Conversion outcome for one extracted entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    /// Sanitized file name the entry was extracted under
    pub entry: String,
    pub result: ConversionResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveSummary {
    pub success: bool,
    pub zip_file: PathBuf,
    pub total_files: usize,
    pub successful_conversions: usize,
    pub failed_conversions: usize,
    pub total_original_size: u64,
    pub total_converted_size: u64,
    /// From the aggregate byte totals of successful files
    pub overall_compression_ratio: f64,
    pub results: Vec<FileOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Set when the archive itself was rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ArchiveSummary {
    fn rejected(zip_file: &Path, error: impl ToString) -> Self {
        Self {
            success: false,
            zip_file: zip_file.to_path_buf(),
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn from_outcomes(zip_file: &Path, results: Vec<FileOutcome>) -> Self {
        let (ok, failed): (Vec<&FileOutcome>, Vec<&FileOutcome>) =
            results.iter().partition(|o| o.result.success);

        let total_original_size: u64 = ok.iter().map(|o| o.result.original_size).sum();
        let total_converted_size: u64 = ok.iter().map(|o| o.result.optimized_size).sum();
        let errors: Vec<String> = failed
            .iter()
            .map(|o| {
                o.result
                    .error
                    .clone()
                    .unwrap_or_else(|| "Unknown error".to_string())
            })
            .collect();

        Self {
            success: failed.is_empty(),
            zip_file: zip_file.to_path_buf(),
            total_files: results.len(),
            successful_conversions: ok.len(),
            failed_conversions: failed.len(),
            total_original_size,
            total_converted_size,
            overall_compression_ratio: compression_ratio(total_converted_size, total_original_size),
            errors,
            error: None,
            results,
        }
    }

    /// The rejection or first per-file error as a typed error
    pub fn to_error(&self) -> Option<AppError> {
        if let Some(error) = &self.error {
            return Some(AppError::InvalidInput(error.clone()));
        }
        self.results.iter().find_map(|o| o.result.to_error())
    }
}

/// Unpacks a ZIP archive and converts its PSD entries on a bounded pool.
pub struct ArchiveProcessor {
    converter: Arc<PsdConverter>,
    max_workers: usize,
    limits: ArchiveLimits,
}

impl ArchiveProcessor {
    pub fn new(converter: Arc<PsdConverter>, max_workers: usize) -> Self {
        Self {
            converter,
            max_workers: max_workers.max(1),
            limits: ArchiveLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: ArchiveLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &ArchiveLimits {
        &self.limits
    }

    /// Validate, extract and convert. Never returns an error: a rejected
    /// archive is a summary with `success = false` and `error` set.
    ///
    /// Extracted files live in a temp directory that is removed on return.
    pub async fn process_archive(
        &self,
        zip_path: &Path,
        out_dir: &Path,
        options: &ConversionOptions,
        callback: Option<ProgressCallback>,
    ) -> ArchiveSummary {
        self.process_archive_until(zip_path, out_dir, options, callback, &CancellationToken::new())
            .await
    }

    /// Like [`process_archive`](Self::process_archive), but entries not yet
    /// started when `cancel` fires are reported as cancelled. Entries already
    /// converting run to completion before this returns.
    #[tracing::instrument(skip(self, zip_path, out_dir, options, callback, cancel), fields(zip = %zip_path.display()))]
    pub async fn process_archive_until(
        &self,
        zip_path: &Path,
        out_dir: &Path,
        options: &ConversionOptions,
        callback: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> ArchiveSummary {
        match self.try_process(zip_path, out_dir, options, callback, cancel).await {
            Ok(summary) => {
                tracing::info!(
                    successful = summary.successful_conversions,
                    total = summary.total_files,
                    ratio = summary.overall_compression_ratio,
                    "Archive processing complete"
                );
                summary
            }
            Err(e) => {
                tracing::warn!(error = %e, "Archive rejected");
                ArchiveSummary::rejected(zip_path, e)
            }
        }
    }

    async fn try_process(
        &self,
        zip_path: &Path,
        out_dir: &Path,
        options: &ConversionOptions,
        callback: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ArchiveSummary> {
        let limits = self.limits;
        let zip = zip_path.to_path_buf();
        let validation = tokio::task::spawn_blocking(move || validate_archive(&zip, &limits)).await??;
        tracing::debug!(
            psd_count = validation.psd_count,
            total_files = validation.total_files,
            "Archive validated"
        );

        let scratch = tempfile::Builder::new().prefix("psd_zip_").tempdir()?;
        let zip = zip_path.to_path_buf();
        let dest = scratch.path().to_path_buf();
        let extracted =
            tokio::task::spawn_blocking(move || extract_psds(&zip, &dest, &limits)).await??;
        if extracted.is_empty() {
            return Err(ArchiveError::NoPsdFiles.into());
        }

        tokio::fs::create_dir_all(out_dir).await?;
        let results = self
            .convert_all(extracted, out_dir, options, callback, cancel)
            .await;
        drop(scratch);

        Ok(ArchiveSummary::from_outcomes(zip_path, results))
    }

    async fn convert_all(
        &self,
        inputs: Vec<PathBuf>,
        out_dir: &Path,
        options: &ConversionOptions,
        callback: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Vec<FileOutcome> {
        let total = inputs.len();
        let permits = Arc::new(Semaphore::new(self.max_workers));
        let options = Arc::new(options.clone());
        let extension = options.format.extension();

        let mut pending: FuturesUnordered<_> = inputs
            .into_iter()
            .map(|input| {
                let permits = Arc::clone(&permits);
                let cancel = cancel.clone();
                let converter = Arc::clone(&self.converter);
                let options = Arc::clone(&options);
                let entry = input
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let stem = psdforge_core::utils::file_stem_or(&input, "extracted");
                let output = out_dir.join(format!("{}.{}", stem, extension));

                async move {
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        permit = permits.acquire_owned() => permit.ok(),
                    };
                    let result = match permit {
                        Some(permit) if !cancel.is_cancelled() => {
                            let input_for_task = input.clone();
                            tokio::task::spawn_blocking(move || {
                                let _permit = permit;
                                converter.convert(&input_for_task, &output, &options)
                            })
                            .await
                            .unwrap_or_else(|e| {
                                let err = AppError::Internal(format!("Conversion task failed: {}", e));
                                ConversionResult::failure(Some(input), None, 0, &err)
                            })
                        }
                        _ => {
                            let err = AppError::Cancelled("Archive processing stopped".to_string());
                            ConversionResult::failure(Some(input), None, 0, &err)
                        }
                    };
                    FileOutcome { entry, result }
                }
            })
            .collect();

        let mut outcomes = Vec::with_capacity(total);
        while let Some(outcome) = pending.next().await {
            if !outcome.result.success {
                tracing::error!(
                    entry = %outcome.entry,
                    error = ?outcome.result.error,
                    "Archive entry failed to convert"
                );
            }
            let completed = outcomes.len() + 1;
            if let Some(callback) = &callback {
                let percent = completed as f64 / total as f64 * 100.0;
                callback(percent, completed, total, &outcome);
            }
            outcomes.push(outcome);
        }
        outcomes
    }
}
