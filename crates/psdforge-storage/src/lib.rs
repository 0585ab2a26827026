//! psdforge storage
//!
//! Converted artifacts are handed off to two collaborators: an [`AssetStore`]
//! that keeps the bytes and hands back a public URL, and a [`MetadataStore`]
//! that records what was stored under which category.
//!
//! [`ImageStorageService`] drives both as a two-phase operation. If the
//! metadata save fails after a successful upload, the uploaded asset is
//! deleted again so no orphaned asset is left behind.
//!
//! # Asset ids
//!
//! Local asset ids are relative keys of the form `{folder}/{base_name}.{ext}`.
//! Keys must not contain `..` or a leading `/`.

pub mod factory;
pub mod json_metadata;
pub mod local;
pub mod memory;
pub mod service;
pub mod traits;

pub use factory::create_storage_service;
pub use json_metadata::JsonMetadataStore;
pub use local::LocalAssetStore;
pub use memory::{MemoryAssetStore, MemoryMetadataStore};
pub use service::{ImageStorageService, StoredImage};
pub use traits::{
    AssetStore, MetadataRecord, MetadataStore, NewRecord, StorageError, StorageResult,
    UploadOptions, UploadedAsset,
};
