//! ZIP archives of PSD files.
//!
//! Archive entries are untrusted. Every entry goes through three gates before
//! it reaches the converter:
//!
//! 1. [`validate::validate_archive`] rejects oversized, corrupt, empty or overfull archives.
//! 2. [`extract::is_candidate`] skips directories, OS metadata, hidden files,
//!    non-PSD names and entries under the minimum size.
//! 3. [`extract::extract_psds`] writes each entry under a flat sanitized name
//!    and discards it unless it starts with the PSD signature.

pub mod extract;
pub mod processor;
pub mod validate;

use psdforge_core::{AppError, Config};
use thiserror::Error;

pub use extract::{extract_psds, is_candidate, zip_info, EntryNamer, ZipEntryInfo, ZipInfo};
pub use processor::{ArchiveProcessor, ArchiveSummary, FileOutcome, ProgressCallback};
pub use validate::{validate_archive, ArchiveValidation};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("ZIP file too large: {size_mb:.1}MB (max: {max_mb:.1}MB)")]
    TooLarge { size_mb: f64, max_mb: f64 },

    #[error("Corrupted ZIP file: {0}")]
    Corrupted(String),

    #[error("Invalid ZIP file format: {0}")]
    InvalidFormat(#[from] zip::result::ZipError),

    #[error("No PSD files found in ZIP archive")]
    NoPsdFiles,

    #[error("Too many files: {count} (max: {max})")]
    TooManyFiles { count: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ArchiveError> for AppError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Io(e) => AppError::Io(e),
            other => AppError::InvalidInput(other.to_string()),
        }
    }
}

/// Size and count ceilings applied to an archive and its entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLimits {
    pub max_archive_bytes: u64,
    pub max_entries: usize,
    pub min_entry_bytes: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ArchiveLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_archive_bytes: config.max_archive_bytes,
            max_entries: config.max_archive_entries,
            min_entry_bytes: config.min_archive_entry_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_default_from_config() {
        let limits = ArchiveLimits::default();
        assert_eq!(limits.max_archive_bytes, 500 * 1024 * 1024);
        assert_eq!(limits.max_entries, 100);
        assert_eq!(limits.min_entry_bytes, 1024);
    }

    #[test]
    fn test_archive_errors_are_invalid_input() {
        let app: AppError = ArchiveError::NoPsdFiles.into();
        assert_eq!(app.kind(), "invalid_input");
        let app: AppError = ArchiveError::TooManyFiles { count: 101, max: 100 }.into();
        assert!(app.to_string().contains("Too many files: 101"));
    }
}
