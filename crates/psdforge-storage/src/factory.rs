use crate::{ImageStorageService, JsonMetadataStore, LocalAssetStore, StorageResult};
use psdforge_core::Config;
use std::sync::Arc;

/// Build the storage service from configuration.
///
/// Returns `None` when `PSDFORGE_STORAGE_ROOT` is unset, which turns the
/// storage hand-off off. Assets go to `{root}/assets`, records to
/// `{root}/metadata.json`.
pub async fn create_storage_service(config: &Config) -> StorageResult<Option<ImageStorageService>> {
    let Some(root) = config.storage_root.as_ref() else {
        return Ok(None);
    };

    let assets = LocalAssetStore::new(root.join("assets"), config.storage_base_url.clone()).await?;
    let metadata = JsonMetadataStore::open(root.join("metadata.json")).await?;

    tracing::info!(root = %root.display(), "Local storage service initialized");
    Ok(Some(ImageStorageService::new(
        Arc::new(assets),
        Arc::new(metadata),
    )))
}
