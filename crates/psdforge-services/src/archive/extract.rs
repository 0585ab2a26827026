use psdforge_processing::validator::has_psd_signature;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use zip::ZipArchive;

use super::{ArchiveError, ArchiveLimits};

const PSD_EXTENSION: &str = ".psd";
const INVALID_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Whether an archive entry should be treated as a PSD to convert.
pub fn is_candidate(name: &str, is_dir: bool, size: u64, min_entry_bytes: u64) -> bool {
    if is_dir || name.ends_with('/') {
        return false;
    }

    let lower = name.to_lowercase();
    let base = lower.rsplit(['/', '\\']).next().unwrap_or(lower.as_str());
    if lower.starts_with("__macosx/")
        || lower.starts_with('.')
        || base.starts_with('.')
        || base == "thumbs.db"
    {
        return false;
    }

    if !lower.ends_with(PSD_EXTENSION) {
        return false;
    }

    if size < min_entry_bytes {
        tracing::warn!(entry = name, size_bytes = size, "Skipping tiny archive entry");
        return false;
    }

    true
}

/// Hands out flat, collision-free file names for extracted entries.
#[derive(Debug, Default)]
pub struct EntryNamer {
    used: HashSet<String>,
    fallback_counter: usize,
}

impl EntryNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name_for(&mut self, entry_name: &str) -> String {
        let base = entry_name.rsplit(['/', '\\']).next().unwrap_or_default();
        let mut safe: String = base
            .chars()
            .map(|c| if INVALID_NAME_CHARS.contains(&c) { '_' } else { c })
            .collect();

        if safe.is_empty() || safe.eq_ignore_ascii_case(PSD_EXTENSION) || safe == "." || safe == ".." {
            self.fallback_counter += 1;
            safe = format!("extracted_{}.psd", self.fallback_counter);
        }

        let mut candidate = safe.clone();
        let (stem, ext) = match safe.rfind('.') {
            Some(dot) if dot > 0 => (&safe[..dot], &safe[dot..]),
            _ => (safe.as_str(), ""),
        };
        let mut k = 1;
        while self.used.contains(&candidate.to_lowercase()) {
            candidate = format!("{}_{}{}", stem, k, ext);
            k += 1;
        }

        self.used.insert(candidate.to_lowercase());
        candidate
    }
}

/// Extract every candidate entry into `dest` and keep those with a PSD signature.
///
/// Per-entry failures are logged and skipped. Only opening the archive itself
/// is fatal.
pub fn extract_psds(zip_path: &Path, dest: &Path, limits: &ArchiveLimits) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut archive = ZipArchive::new(File::open(zip_path)?)?;
    let mut namer = EntryNamer::new();
    let mut extracted = Vec::new();
    std::fs::create_dir_all(dest)?;

    for i in 0..archive.len() {
        let mut entry = match archive.by_index(i) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(index = i, error = %e, "Failed to read archive entry");
                continue;
            }
        };
        let name = entry.name().to_string();
        if !is_candidate(&name, entry.is_dir(), entry.size(), limits.min_entry_bytes) {
            tracing::debug!(entry = %name, "Skipping archive entry");
            continue;
        }

        let target = dest.join(namer.name_for(&name));
        let written = File::create(&target).and_then(|mut out| io::copy(&mut entry, &mut out));
        if let Err(e) = written {
            tracing::error!(entry = %name, error = %e, "Error extracting archive entry");
            let _ = std::fs::remove_file(&target);
            continue;
        }

        if starts_with_psd_signature(&target) {
            tracing::debug!(entry = %name, path = %target.display(), "Extracted PSD entry");
            extracted.push(target);
        } else {
            tracing::warn!(entry = %name, "Extracted entry has no PSD signature, discarding");
            let _ = std::fs::remove_file(&target);
        }
    }

    tracing::info!(
        archive = %zip_path.display(),
        extracted = extracted.len(),
        "Archive extraction finished"
    );
    Ok(extracted)
}

fn starts_with_psd_signature(path: &Path) -> bool {
    let mut head = [0u8; 4];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut head))
        .map(|_| has_psd_signature(&head))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZipEntryInfo {
    pub name: String,
    pub size: u64,
    pub compressed_size: u64,
    pub compression_ratio: f64,
    /// Passes the PSD candidate filter
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZipInfo {
    pub total_files: usize,
    pub psd_files: usize,
    pub total_size: u64,
    pub compressed_size: u64,
    pub compression_ratio: f64,
    pub psd_filenames: Vec<String>,
    pub entries: Vec<ZipEntryInfo>,
}

fn ratio(compressed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((1.0 - compressed as f64 / total as f64) * 10000.0).round() / 100.0
}

/// Describe an archive without extracting it.
pub fn zip_info(path: &Path, limits: &ArchiveLimits) -> Result<ZipInfo, ArchiveError> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut entries = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i)?;
        entries.push(ZipEntryInfo {
            name: entry.name().to_string(),
            size: entry.size(),
            compressed_size: entry.compressed_size(),
            compression_ratio: ratio(entry.compressed_size(), entry.size()),
            valid: is_candidate(entry.name(), entry.is_dir(), entry.size(), limits.min_entry_bytes),
        });
    }

    let total_size = entries.iter().map(|e| e.size).sum();
    let compressed_size = entries.iter().map(|e| e.compressed_size).sum();
    let psd_filenames: Vec<String> = entries
        .iter()
        .filter(|e| e.name.to_lowercase().ends_with(PSD_EXTENSION))
        .map(|e| e.name.rsplit('/').next().unwrap_or(e.name.as_str()).to_string())
        .collect();

    Ok(ZipInfo {
        total_files: entries.len(),
        psd_files: psd_filenames.len(),
        total_size,
        compressed_size,
        compression_ratio: ratio(compressed_size, total_size),
        psd_filenames,
        entries,
    })
}
