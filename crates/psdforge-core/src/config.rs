use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::PathBuf;

use crate::models::ConcurrencyMode;

/// Environment variable prefix: `PSDFORGE_MAX_WORKERS`, `PSDFORGE_QUEUE_SIZE`, ...
pub const ENV_PREFIX: &str = "PSDFORGE_";

const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 300;
const DEFAULT_QUEUE_SIZE: usize = 100;
const DEFAULT_BATCH_SIZE: usize = 1;
const DEFAULT_LARGE_FILE_THRESHOLD_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3600;
const DEFAULT_JOB_RETENTION_HOURS: u64 = 24;
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 30;
const DEFAULT_METRICS_BACKOFF_SECS: u64 = 60;
const DEFAULT_SHUTDOWN_DRAIN_SECS: u64 = 10;
const DEFAULT_SIMILARITY_THRESHOLD: u32 = 5;
const DEFAULT_HASH_RETENTION_DAYS: i64 = 30;
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 500 * 1024 * 1024;
const DEFAULT_MAX_ARCHIVE_BYTES: u64 = 500 * 1024 * 1024;
const DEFAULT_MAX_ARCHIVE_ENTRIES: usize = 100;
const DEFAULT_MIN_ARCHIVE_ENTRY_BYTES: u64 = 1024;
const DEFAULT_STORAGE_BASE_URL: &str = "http://localhost:8000/assets";

/// Pipeline configuration, read from `PSDFORGE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub concurrency_mode: ConcurrencyMode,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_large_file_threshold_bytes")]
    pub large_file_threshold_bytes: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_job_retention_hours")]
    pub job_retention_hours: u64,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    #[serde(default = "default_metrics_backoff_secs")]
    pub metrics_backoff_secs: u64,
    #[serde(default = "default_shutdown_drain_secs")]
    pub shutdown_drain_secs: u64,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub hash_index_path: Option<PathBuf>,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: u32,
    #[serde(default = "default_hash_retention_days")]
    pub hash_retention_days: i64,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    #[serde(default = "default_max_archive_bytes")]
    pub max_archive_bytes: u64,
    #[serde(default = "default_max_archive_entries")]
    pub max_archive_entries: usize,
    #[serde(default = "default_min_archive_entry_bytes")]
    pub min_archive_entry_bytes: u64,
    /// Root directory of the local asset store. Storage hand-off is off when unset.
    #[serde(default)]
    pub storage_root: Option<PathBuf>,
    #[serde(default = "default_storage_base_url")]
    pub storage_base_url: String,
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}
fn default_job_timeout_secs() -> u64 {
    DEFAULT_JOB_TIMEOUT_SECS
}
fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_large_file_threshold_bytes() -> u64 {
    DEFAULT_LARGE_FILE_THRESHOLD_BYTES
}
fn default_cleanup_interval_secs() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}
fn default_job_retention_hours() -> u64 {
    DEFAULT_JOB_RETENTION_HOURS
}
fn default_metrics_interval_secs() -> u64 {
    DEFAULT_METRICS_INTERVAL_SECS
}
fn default_metrics_backoff_secs() -> u64 {
    DEFAULT_METRICS_BACKOFF_SECS
}
fn default_shutdown_drain_secs() -> u64 {
    DEFAULT_SHUTDOWN_DRAIN_SECS
}
fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("psdforge")
}
fn default_similarity_threshold() -> u32 {
    DEFAULT_SIMILARITY_THRESHOLD
}
fn default_hash_retention_days() -> i64 {
    DEFAULT_HASH_RETENTION_DAYS
}
fn default_max_upload_bytes() -> u64 {
    DEFAULT_MAX_UPLOAD_BYTES
}
fn default_max_archive_bytes() -> u64 {
    DEFAULT_MAX_ARCHIVE_BYTES
}
fn default_max_archive_entries() -> usize {
    DEFAULT_MAX_ARCHIVE_ENTRIES
}
fn default_min_archive_entry_bytes() -> u64 {
    DEFAULT_MIN_ARCHIVE_ENTRY_BYTES
}
fn default_storage_base_url() -> String {
    DEFAULT_STORAGE_BASE_URL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            concurrency_mode: ConcurrencyMode::default(),
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            queue_size: DEFAULT_QUEUE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            large_file_threshold_bytes: DEFAULT_LARGE_FILE_THRESHOLD_BYTES,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            job_retention_hours: DEFAULT_JOB_RETENTION_HOURS,
            metrics_interval_secs: DEFAULT_METRICS_INTERVAL_SECS,
            metrics_backoff_secs: DEFAULT_METRICS_BACKOFF_SECS,
            shutdown_drain_secs: DEFAULT_SHUTDOWN_DRAIN_SECS,
            work_dir: default_work_dir(),
            hash_index_path: None,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            hash_retention_days: DEFAULT_HASH_RETENTION_DAYS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_archive_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
            max_archive_entries: DEFAULT_MAX_ARCHIVE_ENTRIES,
            min_archive_entry_bytes: DEFAULT_MIN_ARCHIVE_ENTRY_BYTES,
            storage_root: None,
            storage_base_url: default_storage_base_url(),
        }
    }
}

impl Config {
    /// Load `.env` (if present) then `PSDFORGE_*` variables.
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        Self::from_iter(std::env::vars())
    }

    /// Build from an explicit variable list. Used by `from_env` and tests.
    pub fn from_iter<I>(vars: I) -> Result<Self, anyhow::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Config = envy::prefixed(ENV_PREFIX)
            .from_iter(vars)
            .context("Failed to parse PSDFORGE_* environment variables")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.max_workers == 0 {
            bail!("PSDFORGE_MAX_WORKERS must be at least 1");
        }
        if self.queue_size == 0 {
            bail!("PSDFORGE_QUEUE_SIZE must be at least 1");
        }
        if self.batch_size == 0 {
            bail!("PSDFORGE_BATCH_SIZE must be at least 1");
        }
        if self.job_timeout_secs == 0 {
            bail!("PSDFORGE_JOB_TIMEOUT_SECS must be at least 1");
        }
        if self.similarity_threshold > 64 {
            bail!(
                "PSDFORGE_SIMILARITY_THRESHOLD must be between 0 and 64, got {}",
                self.similarity_threshold
            );
        }
        if self.hash_retention_days < 0 {
            bail!("PSDFORGE_HASH_RETENTION_DAYS must not be negative");
        }
        Ok(())
    }

    pub fn hash_index_path(&self) -> PathBuf {
        self.hash_index_path
            .clone()
            .unwrap_or_else(|| self.work_dir.join("hash_database.json"))
    }

    /// Parent directory of per-job output directories
    pub fn jobs_dir(&self) -> PathBuf {
        self.work_dir.join("jobs")
    }

    /// Where uploaded payloads are spooled before conversion
    pub fn uploads_dir(&self) -> PathBuf {
        self.work_dir.join("uploads")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_when_no_vars() {
        let config = Config::from_iter(Vec::new()).unwrap();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.queue_size, 100);
        assert_eq!(config.job_timeout_secs, 300);
        assert_eq!(config.large_file_threshold_bytes, 50 * 1024 * 1024);
        assert_eq!(config.similarity_threshold, 5);
        assert_eq!(config.concurrency_mode, ConcurrencyMode::Hybrid);
        assert!(config.hash_index_path().ends_with("hash_database.json"));
    }

    #[test]
    fn test_prefixed_overrides() {
        let config = Config::from_iter(vars(&[
            ("PSDFORGE_MAX_WORKERS", "8"),
            ("PSDFORGE_CONCURRENCY_MODE", "threading"),
            ("PSDFORGE_WORK_DIR", "/var/lib/psdforge"),
            ("UNRELATED", "ignored"),
        ]))
        .unwrap();
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.concurrency_mode, ConcurrencyMode::Threading);
        assert_eq!(config.jobs_dir(), PathBuf::from("/var/lib/psdforge/jobs"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(Config::from_iter(vars(&[("PSDFORGE_MAX_WORKERS", "0")])).is_err());
        assert!(Config::from_iter(vars(&[("PSDFORGE_SIMILARITY_THRESHOLD", "65")])).is_err());
        assert!(Config::from_iter(vars(&[("PSDFORGE_QUEUE_SIZE", "abc")])).is_err());
    }
}
