use crate::traits::{
    AssetStore, MetadataRecord, MetadataStore, NewRecord, StorageResult, UploadOptions,
    UploadedAsset,
};
use chrono::{DateTime, Utc};
use psdforge_core::utils::file_stem_or;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Default page size for [`ImageStorageService::list`]
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// A stored artifact: the uploaded asset plus its metadata record id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredImage {
    pub record_id: String,
    pub category: String,
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
    pub asset: UploadedAsset,
}

/// Two-phase storage: upload to the asset store, then record in the metadata store.
#[derive(Clone)]
pub struct ImageStorageService {
    assets: Arc<dyn AssetStore>,
    metadata: Arc<dyn MetadataStore>,
}

impl ImageStorageService {
    pub fn new(assets: Arc<dyn AssetStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { assets, metadata }
    }

    /// Upload `local_path` under `products/{category}` and record it.
    ///
    /// When the metadata save fails the uploaded asset is deleted again and
    /// the save error is returned.
    #[tracing::instrument(skip(self, local_path), fields(path = %local_path.display()))]
    pub async fn store(
        &self,
        local_path: &Path,
        category: &str,
        original_filename: &str,
    ) -> StorageResult<StoredImage> {
        let base = file_stem_or(Path::new(original_filename), "image");
        let options = UploadOptions {
            folder: Some(format!("products/{}", category)),
            base_name: Some(format!("product_{}", base)),
        };

        let asset = self.assets.upload(local_path, &options).await?;
        let filename = format!("{}.{}", base, asset.format);
        let uploaded_at = Utc::now();

        let record = NewRecord {
            category: category.to_string(),
            asset_url: asset.url.clone(),
            asset_id: asset.id.clone(),
            filename: filename.clone(),
            uploaded_at,
        };

        let record_id = match self.metadata.save(record).await {
            Ok(id) => id,
            Err(save_err) => {
                tracing::warn!(
                    asset_id = %asset.id,
                    error = %save_err,
                    "Metadata save failed, rolling back uploaded asset"
                );
                if let Err(rollback_err) = self.assets.delete(&asset.id).await {
                    tracing::error!(
                        asset_id = %asset.id,
                        error = %rollback_err,
                        "Rollback delete failed, asset is orphaned"
                    );
                }
                return Err(save_err);
            }
        };

        tracing::info!(
            record_id = %record_id,
            asset_id = %asset.id,
            size_bytes = asset.bytes,
            "Image stored"
        );

        Ok(StoredImage {
            record_id,
            category: category.to_string(),
            filename,
            uploaded_at,
            asset,
        })
    }

    pub async fn list(&self, category: Option<&str>, limit: usize) -> StorageResult<Vec<MetadataRecord>> {
        self.metadata.query(category, limit).await
    }

    /// Remove the metadata record, then the asset when its id is given.
    /// Returns whether the record existed.
    pub async fn delete(&self, record_id: &str, asset_id: Option<&str>) -> StorageResult<bool> {
        let removed = self.metadata.delete(record_id).await?;
        if let Some(asset_id) = asset_id {
            self.assets.delete(asset_id).await?;
        }
        tracing::info!(record_id, asset_id = ?asset_id, removed, "Stored image deleted");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryAssetStore, MemoryMetadataStore};
    use crate::traits::StorageError;
    use tempfile::tempdir;

    fn setup() -> (ImageStorageService, Arc<MemoryAssetStore>, Arc<MemoryMetadataStore>) {
        let assets = Arc::new(MemoryAssetStore::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let service = ImageStorageService::new(assets.clone(), metadata.clone());
        (service, assets, metadata)
    }

    #[tokio::test]
    async fn test_store_records_asset() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("converted.jpeg");
        std::fs::write(&file, b"jpeg bytes").unwrap();
        let (service, assets, metadata) = setup();

        let stored = service.store(&file, "shoes", "Red Shoe.psd").await.unwrap();

        assert_eq!(stored.asset.id, "products/shoes/product_Red Shoe");
        assert_eq!(stored.filename, "Red Shoe.jpeg");
        assert_eq!(stored.asset.bytes, 10);
        assert_eq!(assets.len(), 1);
        assert_eq!(metadata.len(), 1);

        let listed = service.list(Some("shoes"), DEFAULT_LIST_LIMIT).await.unwrap();
        assert_eq!(listed[0].id, stored.record_id);
        assert_eq!(listed[0].record.asset_id, stored.asset.id);
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back_upload() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("converted.webp");
        std::fs::write(&file, b"webp").unwrap();
        let (service, assets, metadata) = setup();
        metadata.fail_saves(true);

        let err = service.store(&file, "hats", "cap.psd").await.unwrap_err();

        assert!(matches!(err, StorageError::SaveFailed(_)));
        assert_eq!(assets.deleted_ids(), vec!["products/hats/product_cap".to_string()]);
        assert!(assets.is_empty());
        assert!(metadata.is_empty());
    }

    #[tokio::test]
    async fn test_failed_upload_skips_metadata() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("converted.jpeg");
        std::fs::write(&file, b"x").unwrap();
        let (service, assets, metadata) = setup();
        assets.fail_uploads(true);

        assert!(service.store(&file, "hats", "cap.psd").await.is_err());
        assert!(metadata.is_empty());
        assert!(assets.deleted_ids().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_record_and_asset() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("converted.jpeg");
        std::fs::write(&file, b"x").unwrap();
        let (service, assets, metadata) = setup();
        let stored = service.store(&file, "shoes", "a.psd").await.unwrap();

        assert!(service.delete(&stored.record_id, Some(&stored.asset.id)).await.unwrap());
        assert!(metadata.is_empty());
        assert!(assets.is_empty());

        assert!(!service.delete(&stored.record_id, None).await.unwrap());
    }
}
