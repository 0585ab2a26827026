//! In-memory stores with failure injection, for tests and dry runs.

use crate::traits::{
    select_records, AssetStore, MetadataRecord, MetadataStore, NewRecord, StorageError,
    StorageResult, UploadOptions, UploadedAsset,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct MemoryAssetStore {
    assets: Mutex<HashMap<String, UploadedAsset>>,
    deleted: Mutex<Vec<String>>,
    counter: AtomicUsize,
    fail_uploads: AtomicBool,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Ids passed to `delete`, in call order
    pub fn deleted_ids(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.assets).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn upload(&self, local_path: &Path, options: &UploadOptions) -> StorageResult<UploadedAsset> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StorageError::UploadFailed("injected upload failure".to_string()));
        }

        let bytes = tokio::fs::metadata(local_path).await?.len();
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let base_name = options
            .base_name
            .clone()
            .unwrap_or_else(|| format!("asset_{}", n));
        let id = match &options.folder {
            Some(folder) => format!("{}/{}", folder, base_name),
            None => base_name,
        };
        let format = local_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_ascii_lowercase();

        let asset = UploadedAsset {
            url: format!("memory://{}", id),
            id: id.clone(),
            width: 0,
            height: 0,
            bytes,
            format,
        };
        lock(&self.assets).insert(id, asset.clone());
        Ok(asset)
    }

    async fn delete(&self, asset_id: &str) -> StorageResult<()> {
        lock(&self.deleted).push(asset_id.to_string());
        lock(&self.assets).remove(asset_id);
        Ok(())
    }

    async fn exists(&self, asset_id: &str) -> StorageResult<bool> {
        Ok(lock(&self.assets).contains_key(asset_id))
    }
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    records: Mutex<Vec<MetadataRecord>>,
    counter: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn save(&self, record: NewRecord) -> StorageResult<String> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::SaveFailed("injected save failure".to_string()));
        }
        let id = format!("rec_{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
        lock(&self.records).push(MetadataRecord {
            id: id.clone(),
            record,
        });
        Ok(id)
    }

    async fn query(&self, category: Option<&str>, limit: usize) -> StorageResult<Vec<MetadataRecord>> {
        let records = lock(&self.records);
        Ok(select_records(records.iter(), category, limit))
    }

    async fn delete(&self, record_id: &str) -> StorageResult<bool> {
        let mut records = lock(&self.records);
        let before = records.len();
        records.retain(|r| r.id != record_id);
        Ok(records.len() != before)
    }
}
