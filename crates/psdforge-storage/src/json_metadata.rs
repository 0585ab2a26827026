use crate::traits::{select_records, MetadataRecord, MetadataStore, NewRecord, StorageError, StorageResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Metadata store backed by a single JSON array file.
///
/// The whole file is rewritten on every change through a temp file and a
/// rename, so readers never observe a half-written document.
pub struct JsonMetadataStore {
    path: PathBuf,
    records: Mutex<Vec<MetadataRecord>>,
}

impl JsonMetadataStore {
    /// Open the store, creating an empty one when the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let records = match fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &[MetadataRecord]) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(records)?).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn save(&self, record: NewRecord) -> StorageResult<String> {
        let mut records = self.records.lock().await;
        let id = Uuid::new_v4().to_string();
        records.push(MetadataRecord {
            id: id.clone(),
            record,
        });

        if let Err(e) = self.persist(&records).await {
            records.pop();
            return Err(StorageError::SaveFailed(format!(
                "Failed to write {}: {}",
                self.path.display(),
                e
            )));
        }

        tracing::debug!(record_id = %id, path = %self.path.display(), "Metadata record saved");
        Ok(id)
    }

    async fn query(&self, category: Option<&str>, limit: usize) -> StorageResult<Vec<MetadataRecord>> {
        let records = self.records.lock().await;
        Ok(select_records(records.iter(), category, limit))
    }

    async fn delete(&self, record_id: &str) -> StorageResult<bool> {
        let mut records = self.records.lock().await;
        let Some(position) = records.iter().position(|r| r.id == record_id) else {
            return Ok(false);
        };
        let removed = records.remove(position);

        if let Err(e) = self.persist(&records).await {
            records.insert(position, removed);
            return Err(StorageError::DeleteFailed(e.to_string()));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn new_record(category: &str, filename: &str) -> NewRecord {
        NewRecord {
            category: category.to_string(),
            asset_url: format!("http://localhost/{}", filename),
            asset_id: filename.to_string(),
            filename: filename.to_string(),
            uploaded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta").join("records.json");

        let store = JsonMetadataStore::open(&path).await.unwrap();
        let id = store.save(new_record("shoes", "a.jpeg")).await.unwrap();
        store.save(new_record("hats", "b.jpeg")).await.unwrap();

        let reopened = JsonMetadataStore::open(&path).await.unwrap();
        let shoes = reopened.query(Some("shoes"), 100).await.unwrap();
        assert_eq!(shoes.len(), 1);
        assert_eq!(shoes[0].id, id);
        assert_eq!(reopened.query(None, 100).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_reports_presence() {
        let dir = tempdir().unwrap();
        let store = JsonMetadataStore::open(dir.path().join("records.json")).await.unwrap();
        let id = store.save(new_record("shoes", "a.jpeg")).await.unwrap();

        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
        assert!(store.query(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, b"{not json").unwrap();

        let result = JsonMetadataStore::open(&path).await;
        assert!(matches!(result, Err(StorageError::Serialization(_))));
    }
}
