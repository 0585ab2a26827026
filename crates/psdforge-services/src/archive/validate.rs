use std::fs::File;
use std::io;
use std::path::Path;
use zip::ZipArchive;

use super::extract::is_candidate;
use super::{ArchiveError, ArchiveLimits};

const MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveValidation {
    /// Entries that pass the PSD candidate filter
    pub psd_count: usize,
    pub total_files: usize,
    pub archive_size: u64,
}

/// Check size, integrity and entry counts before anything is extracted.
///
/// Integrity means every entry decompresses with a matching CRC.
pub fn validate_archive(path: &Path, limits: &ArchiveLimits) -> Result<ArchiveValidation, ArchiveError> {
    let archive_size = std::fs::metadata(path)?.len();
    if archive_size > limits.max_archive_bytes {
        return Err(ArchiveError::TooLarge {
            size_mb: archive_size as f64 / MB,
            max_mb: limits.max_archive_bytes as f64 / MB,
        });
    }

    let mut archive = ZipArchive::new(File::open(path)?)?;
    let total_files = archive.len();
    let mut psd_count = 0;

    for i in 0..total_files {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| ArchiveError::Corrupted(format!("entry {}: {}", i, e)))?;
        let name = entry.name().to_string();
        io::copy(&mut entry, &mut io::sink())
            .map_err(|e| ArchiveError::Corrupted(format!("{}: {}", name, e)))?;

        if is_candidate(&name, entry.is_dir(), entry.size(), limits.min_entry_bytes) {
            psd_count += 1;
        }
    }

    if psd_count == 0 {
        return Err(ArchiveError::NoPsdFiles);
    }
    if psd_count > limits.max_entries {
        return Err(ArchiveError::TooManyFiles {
            count: psd_count,
            max: limits.max_entries,
        });
    }

    Ok(ArchiveValidation {
        psd_count,
        total_files,
        archive_size,
    })
}
