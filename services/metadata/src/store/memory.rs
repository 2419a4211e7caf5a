//! In-process object store.
//!
//! Behaves like S3 for the three operations the updater uses, including
//! conditional copies, and can be told to fail in the ways a real bucket does:
//! objects disappearing between listing and fetch, listing errors, and another
//! writer changing an object between fetch and copy.

use super::{MergedMetadata, ObjectAttributes, ObjectListing, ObjectRecord, ObjectStore, StoreError};
use crate::classifier::SystemField;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct StoredObject {
    etag: String,
    system: BTreeMap<SystemField, String>,
    user: BTreeMap<String, String>,
    attributes: ObjectAttributes,
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    version: u64,
    missing_on_head: HashSet<String>,
    fail_listing: bool,
    concurrent_writes: HashMap<String, (String, String)>,
    copies: HashMap<String, usize>,
    list_calls: usize,
}

impl State {
    fn next_etag(&mut self) -> String {
        self.version += 1;
        format!("\"{:08x}\"", self.version)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every fetch and copy by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.state.lock().buckets.entry(bucket.to_string()).or_default();
    }

    /// Store an object with the given user metadata, creating the bucket if
    /// needed.
    pub fn put_object<I, K, V>(&self, bucket: &str, key: &str, user: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut state = self.state.lock();
        let etag = state.next_etag();
        let object = StoredObject {
            etag,
            system: BTreeMap::new(),
            user: user.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            attributes: ObjectAttributes::default(),
        };
        state
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
    }

    /// Set a system field on a stored object
    pub fn set_system_field(&self, bucket: &str, key: &str, field: SystemField, value: &str) {
        let mut state = self.state.lock();
        let etag = state.next_etag();
        if let Some(object) = state.buckets.get_mut(bucket).and_then(|b| b.get_mut(key)) {
            object.system.insert(field, value.to_string());
            object.etag = etag;
        }
    }

    /// Make `head_object` report `key` as missing while it is still listed
    pub fn fail_head(&self, key: &str) {
        self.state.lock().missing_on_head.insert(key.to_string());
    }

    /// Make every listing call fail
    pub fn fail_listing(&self) {
        self.state.lock().fail_listing = true;
    }

    /// Have another writer set `field=value` on `key` after it has been
    /// fetched but before the next copy lands.
    pub fn write_concurrently(&self, key: &str, field: &str, value: &str) {
        self.state
            .lock()
            .concurrent_writes
            .insert(key.to_string(), (field.to_string(), value.to_string()));
    }

    /// Current state of an object, if it exists
    pub fn object(&self, bucket: &str, key: &str) -> Option<ObjectRecord> {
        let state = self.state.lock();
        state
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|object| ObjectRecord {
                key: key.to_string(),
                etag: object.etag.clone(),
                system: object.system.clone(),
                user: object.user.clone(),
                attributes: object.attributes.clone(),
            })
    }

    /// Number of successful copies applied to `key`
    pub fn copy_count(&self, key: &str) -> usize {
        self.state.lock().copies.get(key).copied().unwrap_or(0)
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
        max_keys: i32,
    ) -> Result<ObjectListing, StoreError> {
        let mut state = self.state.lock();
        state.list_calls += 1;

        if state.fail_listing {
            return Err(StoreError::Request(format!(
                "Listing failed for bucket {}",
                bucket
            )));
        }

        let objects = state
            .buckets
            .get(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;

        // Tokens are the last key of the previous page
        let mut matching = objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .filter(|key| match continuation_token {
                Some(ref after) => key.as_str() > after.as_str(),
                None => true,
            });

        let limit = max_keys.max(1) as usize;
        let keys: Vec<String> = matching.by_ref().take(limit).cloned().collect();
        let next_token = if matching.next().is_some() {
            keys.last().cloned()
        } else {
            None
        };

        Ok(ObjectListing { keys, next_token })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectRecord, StoreError> {
        self.simulate_latency().await;

        if self.state.lock().missing_on_head.contains(key) {
            return Err(StoreError::NotFound(key.to_string()));
        }

        self.object(bucket, key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn copy_object(
        &self,
        bucket: &str,
        key: &str,
        metadata: &MergedMetadata,
        if_match: &str,
    ) -> Result<(), StoreError> {
        self.simulate_latency().await;

        let mut state = self.state.lock();

        if let Some((field, value)) = state.concurrent_writes.remove(key) {
            let etag = state.next_etag();
            if let Some(object) = state.buckets.get_mut(bucket).and_then(|b| b.get_mut(key)) {
                object.user.insert(field, value);
                object.etag = etag;
            }
        }

        let etag = state.next_etag();
        let object = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        if object.etag != if_match {
            return Err(StoreError::PreconditionFailed(key.to_string()));
        }

        object.system = metadata.system.clone();
        object.user = metadata.user.clone();
        object.attributes = metadata.attributes.clone();
        object.etag = etag;

        *state.copies.entry(key.to_string()).or_default() += 1;
        Ok(())
    }
}
