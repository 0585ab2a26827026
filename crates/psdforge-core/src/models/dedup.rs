use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Fingerprint entry persisted in the hash index.
///
/// Unknown fields found on disk are carried in `extra` and written back
/// unchanged, so older binaries do not drop fields added by newer ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashRecord {
    pub phash: String,
    #[serde(default)]
    pub ahash: Option<String>,
    #[serde(default)]
    pub dhash: Option<String>,
    /// (width, height)
    pub image_size: (u32, u32),
    #[serde(default)]
    pub image_mode: String,
    #[serde(default)]
    pub file_size: u64,
    /// RFC 3339 timestamp. Kept as text so unparseable values survive cleanup.
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub source_path: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarImage {
    pub hash: String,
    pub distance: u32,
    pub record: HashRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateAction {
    StoreUnique,
    SkipDuplicate,
    StoreWithError,
}

impl Display for DuplicateAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            DuplicateAction::StoreUnique => write!(f, "store_unique"),
            DuplicateAction::SkipDuplicate => write!(f, "skip_duplicate"),
            DuplicateAction::StoreWithError => write!(f, "store_with_error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCheckResult {
    pub is_duplicate: bool,
    #[serde(default)]
    pub phash: Option<String>,
    #[serde(default)]
    pub hash_info: Option<HashRecord>,
    /// Ascending by distance
    #[serde(default)]
    pub similar_images: Vec<SimilarImage>,
    #[serde(default)]
    pub closest_match: Option<SimilarImage>,
    /// Only set for unique images
    #[serde(default)]
    pub recommended_filename: Option<String>,
    pub action: DuplicateAction,
    pub message: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl DuplicateCheckResult {
    /// Fail-open result used when hashing or lookup errors out.
    pub fn failed_open(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            is_duplicate: false,
            phash: None,
            hash_info: None,
            similar_images: Vec::new(),
            closest_match: None,
            recommended_filename: None,
            action: DuplicateAction::StoreWithError,
            message: format!("Error during duplicate check: {}", error),
            error: Some(error),
        }
    }
}

/// Pointer from a retained duplicate artifact to the index entry it matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateReference {
    pub original_path: String,
    pub existing_file: HashRecord,
    pub hash: String,
    pub distance: u32,
    pub action: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeduplicationInfo {
    pub enabled: bool,
    pub files_checked: usize,
    pub duplicates_found: usize,
    pub unique_files: usize,
    /// Keyed by artifact file name
    #[serde(default)]
    pub results: BTreeMap<String, DuplicateCheckResult>,
    #[serde(default)]
    pub duplicate_references: BTreeMap<String, DuplicateReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DeduplicationInfo {
    pub fn disabled() -> Self {
        Self {
            message: Some("Deduplication disabled or not available".to_string()),
            ..Self::default()
        }
    }
}

/// Running counters persisted alongside the index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    pub total_processed: u64,
    pub duplicates_found: u64,
    pub unique_images: u64,
    pub hash_collisions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_record_preserves_unknown_fields() {
        let raw = r#"{
            "phash": "ffee000011112222",
            "ahash": "0000000000000000",
            "image_size": [10, 20],
            "image_mode": "RGB",
            "file_size": 99,
            "created_at": "2024-01-01T00:00:00+00:00",
            "source_path": "/tmp/a.jpeg",
            "whash": "abcd",
            "tags": ["x"]
        }"#;
        let record: HashRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.image_size, (10, 20));
        assert_eq!(record.extra.get("whash").and_then(|v| v.as_str()), Some("abcd"));

        let written = serde_json::to_value(&record).unwrap();
        assert_eq!(written["whash"], "abcd");
        assert_eq!(written["tags"][0], "x");
    }

    #[test]
    fn test_failed_open_is_not_duplicate() {
        let result = DuplicateCheckResult::failed_open("cannot decode");
        assert!(!result.is_duplicate);
        assert_eq!(result.action, DuplicateAction::StoreWithError);
        assert_eq!(result.error.as_deref(), Some("cannot decode"));
    }

    #[test]
    fn test_action_serializes_snake_case() {
        let json = serde_json::to_string(&DuplicateAction::SkipDuplicate).unwrap();
        assert_eq!(json, "\"skip_duplicate\"");
    }
}
