use psdforge_core::{AppError, DedupStats, DuplicateAction, DuplicateCheckResult, HashRecord, SimilarImage};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::index::HashIndex;
use crate::hashing::{hamming_distance, PerceptualHasher};

/// Default Hamming threshold, about 92% similarity over 64 bits
pub const DEFAULT_SIMILARITY_THRESHOLD: u32 = 5;

/// Classifies images as duplicate or unique against a persisted hash index.
///
/// The lookup-decide-insert-persist sequence runs under one lock per
/// detector, which keeps the index file consistent. Two detectors over the
/// same file are not coordinated.
pub struct DuplicateDetector {
    hasher: PerceptualHasher,
    threshold: u32,
    index: Mutex<HashIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDedupEntry {
    pub path: String,
    pub result: DuplicateCheckResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDedupError {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchDedupSummary {
    pub total_processed: usize,
    pub duplicates_found: usize,
    pub unique_images: usize,
    pub errors: usize,
    pub duplicate_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchDedupReport {
    pub processed: Vec<BatchDedupEntry>,
    pub duplicates: Vec<String>,
    pub unique: Vec<String>,
    pub errors: Vec<BatchDedupError>,
    pub summary: BatchDedupSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub total_hashes: usize,
    pub database_size_mb: f64,
    pub threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Efficiency {
    pub duplicate_rate: f64,
    /// Number of duplicate artifacts that did not need storing
    pub storage_saved: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupStatistics {
    pub runtime_stats: DedupStats,
    pub database_stats: DatabaseStats,
    pub efficiency: Efficiency,
}

impl DuplicateDetector {
    /// Detector backed by the index file at `index_path`
    pub fn new(index_path: impl Into<PathBuf>, threshold: u32) -> Self {
        tracing::info!(threshold, "Deduplication system initialized");
        Self::with_index(HashIndex::load(index_path), threshold)
    }

    pub fn in_memory(threshold: u32) -> Self {
        Self::with_index(HashIndex::in_memory(), threshold)
    }

    pub fn with_index(index: HashIndex, threshold: u32) -> Self {
        Self {
            hasher: PerceptualHasher::new(),
            threshold,
            index: Mutex::new(index),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn index_path(&self) -> Option<PathBuf> {
        self.lock().path().map(Path::to_path_buf)
    }

    fn lock(&self) -> MutexGuard<'_, HashIndex> {
        // A panic while holding the lock leaves the map itself intact
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Index entries within the threshold of `target`, closest first
    pub fn find_similar(&self, target: &str) -> Vec<SimilarImage> {
        find_similar_in(&self.lock(), target, self.threshold)
    }

    /// Hash `path` and classify it. Unique images are written through to the
    /// index before returning. Errors fail open as `store_with_error`.
    #[tracing::instrument(skip(self, path), fields(path = %path.display()))]
    pub fn check_for_duplicate(&self, path: &Path) -> DuplicateCheckResult {
        let (phash, record) = match self.hasher.hash_image(path) {
            Ok(hashed) => hashed,
            Err(e) => {
                tracing::error!(error = %e, "Duplicate check failed");
                self.lock().stats_mut().total_processed += 1;
                return DuplicateCheckResult::failed_open(e.to_string());
            }
        };

        let mut index = self.lock();
        index.stats_mut().total_processed += 1;

        let similar = find_similar_in(&index, &phash, self.threshold);
        if let Some(closest) = similar.first().cloned() {
            index.stats_mut().duplicates_found += 1;
            tracing::info!(
                hash = %phash,
                matched = %closest.hash,
                distance = closest.distance,
                "Duplicate detected"
            );
            return DuplicateCheckResult {
                is_duplicate: true,
                phash: Some(phash),
                hash_info: Some(record),
                message: format!("Duplicate found with {} similar image(s)", similar.len()),
                similar_images: similar,
                closest_match: Some(closest),
                recommended_filename: None,
                action: DuplicateAction::SkipDuplicate,
                error: None,
            };
        }

        let filename = recommended_filename(&phash, path);
        if index.insert(phash.clone(), record.clone()) {
            index.stats_mut().hash_collisions += 1;
        }
        index.stats_mut().unique_images += 1;
        if let Err(e) = index.save() {
            tracing::error!(error = %e, "Failed to save hash database");
        }
        drop(index);

        tracing::info!(hash = %phash, filename = %filename, "Unique image registered");
        DuplicateCheckResult {
            is_duplicate: false,
            phash: Some(phash),
            hash_info: Some(record),
            similar_images: Vec::new(),
            closest_match: None,
            recommended_filename: Some(filename),
            action: DuplicateAction::StoreUnique,
            message: "Unique image - stored in database".to_string(),
            error: None,
        }
    }

    /// Remove entries older than `max_age_days`. Persists only when something was removed.
    pub fn cleanup(&self, max_age_days: u32) -> usize {
        let mut index = self.lock();
        let removed = index.remove_older_than(max_age_days);
        if removed > 0 {
            if let Err(e) = index.save() {
                tracing::error!(error = %e, "Failed to save hash database after cleanup");
            }
            tracing::info!(removed, "Cleaned up old hash database entries");
        }
        removed
    }

    pub fn batch_deduplicate(&self, paths: &[PathBuf]) -> BatchDedupReport {
        let mut report = BatchDedupReport::default();

        for path in paths {
            let display = path.display().to_string();
            if !path.exists() {
                report.errors.push(BatchDedupError {
                    path: display,
                    error: "File not found".to_string(),
                });
                continue;
            }

            let result = self.check_for_duplicate(path);
            if let Some(error) = &result.error {
                report.errors.push(BatchDedupError {
                    path: display.clone(),
                    error: error.clone(),
                });
            } else if result.is_duplicate {
                report.duplicates.push(display.clone());
            } else {
                report.unique.push(display.clone());
            }
            report.processed.push(BatchDedupEntry {
                path: display,
                result,
            });
        }

        report.summary = BatchDedupSummary {
            total_processed: report.processed.len(),
            duplicates_found: report.duplicates.len(),
            unique_images: report.unique.len(),
            errors: report.errors.len(),
            duplicate_rate: percent(report.duplicates.len() as u64, paths.len() as u64),
        };
        tracing::info!(
            processed = report.summary.total_processed,
            duplicates = report.summary.duplicates_found,
            errors = report.summary.errors,
            "Batch deduplication complete"
        );
        report
    }

    pub fn statistics(&self) -> DedupStatistics {
        let index = self.lock();
        let stats = index.stats();
        DedupStatistics {
            runtime_stats: stats,
            database_stats: DatabaseStats {
                total_hashes: index.len(),
                database_size_mb: index.file_size() as f64 / 1024.0 / 1024.0,
                threshold: self.threshold,
            },
            efficiency: Efficiency {
                duplicate_rate: percent(stats.duplicates_found, stats.total_processed.max(1)),
                storage_saved: stats.duplicates_found,
            },
        }
    }

    pub fn export(&self, target: &Path) -> Result<(), AppError> {
        self.lock().export(target)?;
        tracing::info!(target = %target.display(), "Hash database exported");
        Ok(())
    }

    /// Snapshot of a stored record
    pub fn record(&self, hash: &str) -> Option<HashRecord> {
        self.lock().get(hash).cloned()
    }
}

/// Linear scan for entries within `threshold` bits. Ties keep index order.
pub fn find_similar_in(index: &HashIndex, target: &str, threshold: u32) -> Vec<SimilarImage> {
    let mut similar: Vec<SimilarImage> = index
        .iter()
        .filter_map(|(hash, record)| {
            let distance = hamming_distance(target, hash);
            (distance <= threshold).then(|| SimilarImage {
                hash: hash.clone(),
                distance,
                record: record.clone(),
            })
        })
        .collect();
    similar.sort_by_key(|s| s.distance);
    similar
}

/// `{first 8 hash chars}_{stem}_{timestamp}{.ext}`
pub fn recommended_filename(phash: &str, original: &Path) -> String {
    let prefix: String = phash.chars().take(8).collect();
    let stem = psdforge_core::utils::file_stem_or(original, "image");
    let ext = original
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}_{}{}", prefix, stem, timestamp, ext)
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}
