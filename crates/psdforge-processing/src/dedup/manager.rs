use psdforge_core::{AppError, DuplicateCheckResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::detector::{DedupStatistics, DuplicateDetector};

/// Estimated size of one avoided duplicate, in MB
const ESTIMATED_DUPLICATE_MB: f64 = 2.5;
const HIGH_DUPLICATE_RATE: f64 = 20.0;
const LOW_DUPLICATE_RATE: f64 = 5.0;
const LARGE_INDEX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagedAction {
    DuplicateSkipped,
    UniqueStored,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedOutcome {
    pub action: ManagedAction,
    pub original_path: PathBuf,
    pub stored_path: Option<PathBuf>,
    pub hash_filename: Option<String>,
    pub dedup_info: Option<DuplicateCheckResult>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStructure {
    pub unique_images: usize,
    pub duplicate_records: usize,
    pub total_storage_saved_mb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeduplicationReport {
    pub deduplication_summary: DedupStatistics,
    pub storage_structure: StorageStructure,
    pub recommendations: Vec<String>,
}

/// Files unique images under `unique/` and duplicate records under
/// `duplicates/` inside a storage directory.
pub struct DeduplicationManager {
    detector: DuplicateDetector,
    unique_dir: PathBuf,
    duplicate_dir: PathBuf,
}

impl DeduplicationManager {
    /// Index defaults to `{storage_dir}/hash_database.json`.
    pub fn new(
        storage_dir: &Path,
        index_path: Option<PathBuf>,
        threshold: u32,
    ) -> Result<Self, AppError> {
        let index_path = index_path.unwrap_or_else(|| storage_dir.join("hash_database.json"));
        let unique_dir = storage_dir.join("unique");
        let duplicate_dir = storage_dir.join("duplicates");
        std::fs::create_dir_all(&unique_dir)?;
        std::fs::create_dir_all(&duplicate_dir)?;

        tracing::info!(storage_dir = %storage_dir.display(), "Deduplication manager initialized");
        Ok(Self {
            detector: DuplicateDetector::new(index_path, threshold),
            unique_dir,
            duplicate_dir,
        })
    }

    pub fn detector(&self) -> &DuplicateDetector {
        &self.detector
    }

    pub fn process_image_with_dedup(&self, image_path: &Path, job_id: &str) -> ManagedOutcome {
        match self.try_process(image_path, job_id) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(job_id, error = %e, "Error in deduplication processing");
                ManagedOutcome {
                    action: ManagedAction::Error,
                    original_path: image_path.to_path_buf(),
                    stored_path: None,
                    hash_filename: None,
                    dedup_info: None,
                    message: format!("Deduplication error: {}", e),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn try_process(&self, image_path: &Path, job_id: &str) -> Result<ManagedOutcome, AppError> {
        let result = self.detector.check_for_duplicate(image_path);
        if let Some(error) = &result.error {
            return Err(AppError::HashFailure(error.clone()));
        }

        if result.is_duplicate {
            let info_path = self
                .duplicate_dir
                .join(format!("{}_duplicate_info.json", job_id));
            std::fs::write(&info_path, serde_json::to_vec_pretty(&result)?)?;
            return Ok(ManagedOutcome {
                action: ManagedAction::DuplicateSkipped,
                original_path: image_path.to_path_buf(),
                stored_path: None,
                hash_filename: None,
                dedup_info: Some(result),
                message: "Image skipped as duplicate".to_string(),
                error: None,
            });
        }

        let hash_filename = result.recommended_filename.clone().ok_or_else(|| {
            AppError::Internal("Unique classification without a filename".to_string())
        })?;
        let stored_path = self.unique_dir.join(&hash_filename);
        std::fs::copy(image_path, &stored_path)?;

        Ok(ManagedOutcome {
            action: ManagedAction::UniqueStored,
            original_path: image_path.to_path_buf(),
            stored_path: Some(stored_path),
            hash_filename: Some(hash_filename),
            dedup_info: Some(result),
            message: "Unique image stored successfully".to_string(),
            error: None,
        })
    }

    pub fn report(&self) -> DeduplicationReport {
        let stats = self.detector.statistics();
        let recommendations = recommendations(&stats);
        DeduplicationReport {
            storage_structure: StorageStructure {
                unique_images: count_entries(&self.unique_dir),
                duplicate_records: count_entries(&self.duplicate_dir),
                total_storage_saved_mb: stats.efficiency.storage_saved as f64 * ESTIMATED_DUPLICATE_MB,
            },
            deduplication_summary: stats,
            recommendations,
        }
    }
}

fn recommendations(stats: &DedupStatistics) -> Vec<String> {
    let mut out = Vec::new();
    let rate = stats.efficiency.duplicate_rate;
    if rate > HIGH_DUPLICATE_RATE {
        out.push("High duplicate rate detected - consider reviewing source data".to_string());
    }
    if rate < LOW_DUPLICATE_RATE {
        out.push("Low duplicate rate - deduplication is working efficiently".to_string());
    }
    if stats.database_stats.total_hashes > LARGE_INDEX_ENTRIES {
        out.push("Large hash database - consider periodic cleanup".to_string());
    }
    out
}

fn count_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(Result::ok).count())
        .unwrap_or(0)
}
