use crate::traits::{AssetStore, StorageError, StorageResult, UploadOptions, UploadedAsset};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

/// Local filesystem asset store
#[derive(Clone)]
pub struct LocalAssetStore {
    base_path: PathBuf,
    base_url: String,
}

impl LocalAssetStore {
    /// # Arguments
    /// * `base_path` - Root directory for assets (e.g., "/var/lib/psdforge/assets")
    /// * `base_url` - Base URL the directory is served under (e.g., "http://localhost:8000/assets")
    pub async fn new(base_path: impl Into<PathBuf>, base_url: String) -> StorageResult<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(&base_path).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create storage directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        Ok(LocalAssetStore {
            base_path,
            base_url,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Convert an asset id to a filesystem path, refusing ids that escape the root
    fn key_to_path(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.contains("..") || key.starts_with('/') || key.contains('\\') {
            return Err(StorageError::InvalidKey(
                "Storage key contains invalid characters".to_string(),
            ));
        }

        let path = self.base_path.join(key);

        let base_canonical = self.base_path.canonicalize().map_err(|e| {
            StorageError::ConfigError(format!("Failed to canonicalize base path: {}", e))
        })?;

        if let Ok(canonical) = path.canonicalize() {
            if canonical.strip_prefix(&base_canonical).is_err() {
                return Err(StorageError::InvalidKey(
                    "Storage key resolves outside storage directory".to_string(),
                ));
            }
        } else if path.strip_prefix(&self.base_path).is_err() {
            return Err(StorageError::InvalidKey(
                "Storage key resolves outside storage directory".to_string(),
            ));
        }

        Ok(path)
    }

    fn generate_key(options: &UploadOptions, extension: &str) -> String {
        let base_name = options
            .base_name
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        match options.folder.as_deref().map(|f| f.trim_matches('/')) {
            Some(folder) if !folder.is_empty() => format!("{}/{}.{}", folder, base_name, extension),
            _ => format!("{}.{}", base_name, extension),
        }
    }

    fn generate_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key)
    }

    async fn ensure_parent_dir(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AssetStore for LocalAssetStore {
    async fn upload(&self, local_path: &Path, options: &UploadOptions) -> StorageResult<UploadedAsset> {
        let extension = local_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_else(|| "bin".to_string());
        let key = Self::generate_key(options, &extension);
        let path = self.key_to_path(&key)?;

        self.ensure_parent_dir(&path).await?;
        let start = std::time::Instant::now();

        let bytes = fs::copy(local_path, &path).await.map_err(|e| {
            StorageError::UploadFailed(format!(
                "Failed to copy {} to {}: {}",
                local_path.display(),
                path.display(),
                e
            ))
        })?;

        let probe = path.clone();
        let (width, height) = tokio::task::spawn_blocking(move || image::image_dimensions(&probe))
            .await
            .map_err(|e| StorageError::BackendError(format!("Dimension probe panicked: {}", e)))?
            .unwrap_or((0, 0));

        let url = self.generate_url(&key);

        tracing::info!(
            path = %path.display(),
            key = %key,
            size_bytes = bytes,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local asset upload successful"
        );

        Ok(UploadedAsset {
            url,
            id: key,
            width,
            height,
            bytes,
            format: extension,
        })
    }

    async fn delete(&self, asset_id: &str) -> StorageResult<()> {
        let path = self.key_to_path(asset_id)?;

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }

        fs::remove_file(&path).await.map_err(|e| {
            StorageError::DeleteFailed(format!("Failed to delete file {}: {}", path.display(), e))
        })?;

        tracing::info!(path = %path.display(), key = %asset_id, "Local asset delete successful");
        Ok(())
    }

    async fn exists(&self, asset_id: &str) -> StorageResult<bool> {
        let path = self.key_to_path(asset_id)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn store(root: &Path) -> LocalAssetStore {
        LocalAssetStore::new(root.join("assets"), "http://localhost:8000/assets/".to_string())
            .await
            .unwrap()
    }

    fn write_png(path: &Path) {
        image::RgbImage::from_pixel(12, 7, image::Rgb([10, 20, 30]))
            .save(path)
            .unwrap();
    }

    #[tokio::test]
    async fn test_upload_reports_dimensions_and_url() {
        let dir = tempdir().unwrap();
        let store = store(dir.path()).await;
        let source = dir.path().join("shoe.PNG");
        write_png(&source);

        let options = UploadOptions {
            folder: Some("products/shoes".to_string()),
            base_name: Some("product_shoe".to_string()),
        };
        let asset = store.upload(&source, &options).await.unwrap();

        assert_eq!(asset.id, "products/shoes/product_shoe.png");
        assert_eq!(asset.url, "http://localhost:8000/assets/products/shoes/product_shoe.png");
        assert_eq!((asset.width, asset.height), (12, 7));
        assert_eq!(asset.format, "png");
        assert!(asset.bytes > 0);
        assert!(store.exists(&asset.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_upload_without_options_uses_random_name() {
        let dir = tempdir().unwrap();
        let store = store(dir.path()).await;
        let source = dir.path().join("blob.dat");
        std::fs::write(&source, b"not an image").unwrap();

        let asset = store.upload(&source, &UploadOptions::default()).await.unwrap();
        assert!(asset.id.ends_with(".dat"));
        assert!(!asset.id.contains('/'));
        assert_eq!((asset.width, asset.height), (0, 0));
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempdir().unwrap();
        let store = store(dir.path()).await;

        let result = store.delete("../../../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = store.exists("/etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let source = dir.path().join("a.png");
        write_png(&source);
        let options = UploadOptions {
            folder: Some("../outside".to_string()),
            base_name: None,
        };
        let result = store.upload(&source, &options).await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = store(dir.path()).await;
        let source = dir.path().join("a.png");
        write_png(&source);

        let asset = store.upload(&source, &UploadOptions::default()).await.unwrap();
        store.delete(&asset.id).await.unwrap();
        assert!(!store.exists(&asset.id).await.unwrap());
        assert!(store.delete(&asset.id).await.is_ok());
    }
}
