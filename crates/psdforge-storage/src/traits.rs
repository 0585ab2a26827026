//! Storage abstraction traits
//!
//! The pipeline never talks to a concrete backend. It uploads through an
//! [`AssetStore`] and records through a [`MetadataStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use psdforge_core::AppError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Save failed: {0}")]
    SaveFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => AppError::NotFound(what),
            StorageError::InvalidKey(key) => AppError::InvalidInput(format!("Invalid storage key: {}", key)),
            other => AppError::StorageFailure(other.to_string()),
        }
    }
}

/// Placement hints for an upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// Folder inside the store, e.g. `products/shoes`
    pub folder: Option<String>,
    /// File name without extension. Defaults to a random id.
    pub base_name: Option<String>,
}

/// What the asset store reports back after an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedAsset {
    pub url: String,
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
    pub format: String,
}

/// A metadata record before the store has assigned an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecord {
    pub category: String,
    pub asset_url: String,
    pub asset_id: String,
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub id: String,
    #[serde(flatten)]
    pub record: NewRecord,
}

/// Holds uploaded image bytes and serves them under a URL.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Upload a local file. Returns the public URL and the asset id used for deletion.
    async fn upload(&self, local_path: &Path, options: &UploadOptions) -> StorageResult<UploadedAsset>;

    /// Delete an asset by id. Deleting a missing asset is not an error.
    async fn delete(&self, asset_id: &str) -> StorageResult<()>;

    async fn exists(&self, asset_id: &str) -> StorageResult<bool>;
}

/// Records which asset was stored for which category.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Persist a record and return its id
    async fn save(&self, record: NewRecord) -> StorageResult<String>;

    /// Records newest first, optionally restricted to one category
    async fn query(&self, category: Option<&str>, limit: usize) -> StorageResult<Vec<MetadataRecord>>;

    /// Returns whether a record was removed
    async fn delete(&self, record_id: &str) -> StorageResult<bool>;
}

/// Newest first, truncated to `limit`. Shared by the store implementations.
pub(crate) fn select_records<'a, I>(records: I, category: Option<&str>, limit: usize) -> Vec<MetadataRecord>
where
    I: IntoIterator<Item = &'a MetadataRecord>,
{
    let mut selected: Vec<MetadataRecord> = records
        .into_iter()
        .filter(|r| category.map_or(true, |c| r.record.category == c))
        .cloned()
        .collect();
    selected.sort_by(|a, b| b.record.uploaded_at.cmp(&a.record.uploaded_at));
    selected.truncate(limit);
    selected
}
