//! Persisted hash index.
//!
//! The whole index lives in memory and is rewritten in full on every
//! mutation. Writes go through a temp file in the same directory followed by
//! a rename, so a crash mid-write never leaves a truncated index behind.

use chrono::{DateTime, Duration, Utc};
use psdforge_core::{AppError, DedupStats, HashRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const INDEX_VERSION: &str = "1.0";

/// On-disk layout of the index file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDocument {
    #[serde(default)]
    pub hashes: BTreeMap<String, HashRecord>,
    #[serde(default = "now_rfc3339")]
    pub created_at: String,
    #[serde(default = "now_rfc3339")]
    pub last_updated: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub stats: DedupStats,
    /// Top-level fields written by other versions
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for IndexDocument {
    fn default() -> Self {
        let now = now_rfc3339();
        Self {
            hashes: BTreeMap::new(),
            created_at: now.clone(),
            last_updated: now,
            version: default_version(),
            stats: DedupStats::default(),
            extra: Map::new(),
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn default_version() -> String {
    INDEX_VERSION.to_string()
}

/// In-memory hash index with optional file backing
#[derive(Debug)]
pub struct HashIndex {
    path: Option<PathBuf>,
    document: IndexDocument,
}

impl HashIndex {
    /// Index that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            document: IndexDocument::default(),
        }
    }

    /// Load from `path`. A missing or unreadable file starts an empty index.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let document = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<IndexDocument>(&bytes) {
                Ok(doc) => {
                    tracing::info!(
                        path = %path.display(),
                        entries = doc.hashes.len(),
                        "Loaded hash database"
                    );
                    doc
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Could not parse hash database, starting empty");
                    IndexDocument::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => IndexDocument::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Could not read hash database, starting empty");
                IndexDocument::default()
            }
        };

        Self {
            path: Some(path),
            document,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.document.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.document.hashes.is_empty()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.document.hashes.contains_key(hash)
    }

    pub fn get(&self, hash: &str) -> Option<&HashRecord> {
        self.document.hashes.get(hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HashRecord)> {
        self.document.hashes.iter()
    }

    /// Insert a record. Returns true when the key was already present.
    pub fn insert(&mut self, hash: String, record: HashRecord) -> bool {
        self.document.hashes.insert(hash, record).is_some()
    }

    pub fn stats(&self) -> DedupStats {
        self.document.stats
    }

    pub fn stats_mut(&mut self) -> &mut DedupStats {
        &mut self.document.stats
    }

    pub fn document(&self) -> &IndexDocument {
        &self.document
    }

    /// Drop entries created before `now - max_age_days`.
    ///
    /// Entries without a parseable `created_at` are kept.
    pub fn remove_older_than(&mut self, max_age_days: u32) -> usize {
        let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
        let before = self.document.hashes.len();
        self.document
            .hashes
            .retain(|_, record| match parse_timestamp(record.created_at.as_deref()) {
                Some(created) => created >= cutoff,
                None => true,
            });
        before - self.document.hashes.len()
    }

    /// Rewrite the backing file. No-op for in-memory indexes.
    pub fn save(&mut self) -> Result<(), AppError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        self.document.last_updated = now_rfc3339();
        write_document(&self.document, &path)?;
        tracing::debug!(path = %path.display(), entries = self.len(), "Hash database saved");
        Ok(())
    }

    /// Write a copy of the index to `target`
    pub fn export(&self, target: &Path) -> Result<(), AppError> {
        write_document(&self.document, target)
    }

    /// Size of the backing file in bytes, 0 when absent
    pub fn file_size(&self) -> u64 {
        self.path
            .as_deref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

fn write_document(document: &IndexDocument, path: &Path) -> Result<(), AppError> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => dir.to_path_buf(),
        None => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let json = serde_json::to_vec_pretty(document)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(&json)?;
    tmp.persist(path).map_err(|e| AppError::Io(e.error))?;
    Ok(())
}

/// RFC 3339 first, then the naive `YYYY-mm-ddTHH:MM:SS[.f]` form read as UTC.
fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
