//! Object store capability consumed by the updater.
//!
//! The updater only needs three operations from a store: paginated listing by
//! prefix, fetching an object's metadata with its etag, and a conditional
//! in-place copy that replaces the metadata. [`s3::S3Store`] talks to S3 (or
//! any S3-compatible endpoint); [`memory::MemoryStore`] keeps everything in
//! process.

pub mod memory;
pub mod s3;

use crate::classifier::SystemField;
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

pub use memory::MemoryStore;
pub use s3::S3Store;

/// Errors returned by an [`ObjectStore`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Bucket not found: {0}")]
    NoSuchBucket(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object changed since it was read: {0}")]
    PreconditionFailed(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Object store request failed: {0}")]
    Request(String),
}

/// One raw page returned by [`ObjectStore::list_objects`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectListing {
    /// Keys on this page, in listing order
    pub keys: Vec<String>,
    /// Token for the following page; `None` when listing is exhausted
    pub next_token: Option<String>,
}

/// Current state of one object, fetched right before it is merged
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectRecord {
    pub key: String,
    /// Opaque version token
    pub etag: String,
    pub system: BTreeMap<SystemField, String>,
    pub user: BTreeMap<String, String>,
    pub attributes: ObjectAttributes,
}

/// Object settings a metadata-replacing copy would otherwise reset to the
/// bucket defaults
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectAttributes {
    /// `None` means the store default (STANDARD)
    pub storage_class: Option<String>,
    pub server_side_encryption: Option<String>,
    pub ssekms_key_id: Option<String>,
}

/// Complete metadata to write back for one object.
///
/// Replacing metadata is all-or-nothing at the store, so this always carries
/// the full set of system and user fields, not only the changed ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedMetadata {
    pub system: BTreeMap<SystemField, String>,
    pub user: BTreeMap<String, String>,
    /// Carried over unchanged from the object
    pub attributes: ObjectAttributes,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List up to `max_keys` keys under `prefix`, starting at
    /// `continuation_token` when given.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
        max_keys: i32,
    ) -> Result<ObjectListing, StoreError>;

    /// Fetch an object's metadata and etag
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectRecord, StoreError>;

    /// Copy an object onto itself with `metadata` replacing its current
    /// metadata. Fails with [`StoreError::PreconditionFailed`] unless the
    /// object's etag still equals `if_match`.
    async fn copy_object(
        &self,
        bucket: &str,
        key: &str,
        metadata: &MergedMetadata,
        if_match: &str,
    ) -> Result<(), StoreError>;
}
