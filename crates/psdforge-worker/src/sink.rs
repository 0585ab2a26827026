use async_trait::async_trait;
use psdforge_core::{AppError, Job};
use psdforge_storage::ImageStorageService;
use std::path::Path;

/// Receives each successful output artifact of a job.
///
/// The returned value is attached to the job result under `storage`. An error
/// fails the job.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn store(&self, job: &Job, artifact: &Path) -> Result<serde_json::Value, AppError>;
}

/// Sends artifacts through the two-phase storage service under one category.
pub struct StorageSink {
    service: ImageStorageService,
    category: String,
}

impl StorageSink {
    pub fn new(service: ImageStorageService, category: impl Into<String>) -> Self {
        Self {
            service,
            category: category.into(),
        }
    }
}

#[async_trait]
impl ResultSink for StorageSink {
    async fn store(&self, job: &Job, artifact: &Path) -> Result<serde_json::Value, AppError> {
        // Archive entries are stored under their own names
        let filename = match job.metadata.file_type {
            psdforge_core::InputKind::Psd => job.metadata.filename.clone(),
            psdforge_core::InputKind::Zip => artifact
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| job.metadata.filename.clone()),
        };

        let stored = self
            .service
            .store(artifact, &self.category, &filename)
            .await?;
        Ok(serde_json::to_value(stored)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psdforge_core::{ConversionOptions, InputKind, JobMetadata};
    use psdforge_storage::{MemoryAssetStore, MemoryMetadataStore};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn job(filename: &str, file_type: InputKind) -> Job {
        Job::new(
            "job_1".into(),
            JobMetadata {
                filename: filename.into(),
                file_type,
                file_size: 1,
                options: ConversionOptions::default(),
                strategy: None,
            },
        )
    }

    #[tokio::test]
    async fn test_storage_sink_records_artifact() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("hash_cap.jpeg");
        std::fs::write(&artifact, b"jpeg").unwrap();

        let assets = Arc::new(MemoryAssetStore::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let sink = StorageSink::new(ImageStorageService::new(assets.clone(), metadata), "hats");

        let value = sink.store(&job("cap.psd", InputKind::Psd), &artifact).await.unwrap();
        assert_eq!(value["category"], "hats");
        assert_eq!(value["asset"]["id"], "products/hats/product_cap");
        assert_eq!(assets.len(), 1);
    }

    #[tokio::test]
    async fn test_storage_sink_failure_is_storage_error() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("a.jpeg");
        std::fs::write(&artifact, b"jpeg").unwrap();

        let metadata = Arc::new(MemoryMetadataStore::new());
        metadata.fail_saves(true);
        let sink = StorageSink::new(
            ImageStorageService::new(Arc::new(MemoryAssetStore::new()), metadata),
            "hats",
        );

        let err = sink.store(&job("a.zip", InputKind::Zip), &artifact).await.unwrap_err();
        assert_eq!(err.kind(), "storage_failure");
    }
}
