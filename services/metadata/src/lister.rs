use crate::store::{ObjectStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

/// Listing failures. These are never retried: a missing bucket or a
/// permissions problem will not fix itself.
#[derive(Error, Debug)]
#[error("Failed to list s3://{bucket}/{prefix}: {source}")]
pub struct ListError {
    pub bucket: String,
    pub prefix: String,
    #[source]
    pub source: StoreError,
}

/// One page of object keys.
///
/// `start_token` is the token this page was requested with (`None` for the
/// first page); requesting it again yields the same page. `next_token`
/// fetches the page after it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingPage {
    pub start_token: Option<String>,
    pub next_token: Option<String>,
    pub keys: Vec<String>,
}

/// Lazily pages through every key under a prefix
pub struct ObjectLister {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    page_size: i32,
    cursor: Option<String>,
    exhausted: bool,
}

impl ObjectLister {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: &str, prefix: &str, page_size: usize) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            page_size: page_size.clamp(1, i32::MAX as usize) as i32,
            cursor: None,
            exhausted: false,
        }
    }

    /// Start from a previously saved continuation token instead of the
    /// beginning of the listing
    pub fn resume_from(mut self, token: Option<String>) -> Self {
        self.cursor = token;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Token the next page will be requested with
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Fetch the next page, or `None` once the listing is exhausted
    #[instrument(skip(self), fields(bucket = %self.bucket, prefix = %self.prefix))]
    pub async fn next_page(&mut self) -> Result<Option<ListingPage>, ListError> {
        if self.exhausted {
            return Ok(None);
        }

        let start_token = self.cursor.clone();
        let listing = self
            .store
            .list_objects(&self.bucket, &self.prefix, start_token.clone(), self.page_size)
            .await
            .map_err(|source| ListError {
                bucket: self.bucket.clone(),
                prefix: self.prefix.clone(),
                source,
            })?;

        self.exhausted = listing.next_token.is_none();
        self.cursor = listing.next_token.clone();

        if listing.keys.is_empty() && self.exhausted {
            return Ok(None);
        }

        debug!(
            keys = listing.keys.len(),
            has_more = !self.exhausted,
            "Fetched listing page"
        );
        metrics::counter!("metadata.pages.listed").increment(1);

        Ok(Some(ListingPage {
            start_token,
            next_token: listing.next_token,
            keys: listing.keys,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::HashSet;

    fn populated(count: usize) -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.create_bucket("bucket");
        for i in 0..count {
            store.put_object("bucket", &format!("tiles/{:04}.png", i), [("z", "1")]);
        }
        // Outside the prefix
        store.put_object("bucket", "other/0000.png", [("z", "1")]);
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_stream_yields_every_key_once() {
        for (count, page_size) in [(0, 10), (1, 10), (10, 10), (25, 10), (1000, 7)] {
            let store = populated(count);
            let mut lister = ObjectLister::new(store, "bucket", "tiles/", page_size);

            let mut pages = Vec::new();
            while let Some(page) = lister.next_page().await.unwrap() {
                pages.push(page);
            }
            let keys: Vec<String> = pages.iter().flat_map(|p| p.keys.clone()).collect();
            let distinct: HashSet<&String> = keys.iter().collect();

            assert_eq!(keys.len(), count);
            assert_eq!(distinct.len(), count);
            assert_eq!(pages.len(), count.div_ceil(page_size));
            assert!(keys.iter().all(|k| k.starts_with("tiles/")));
        }
    }

    #[tokio::test]
    async fn test_page_tokens_chain() {
        let store = populated(5);
        let mut lister = ObjectLister::new(store, "bucket", "tiles/", 2);

        let first = lister.next_page().await.unwrap().unwrap();
        let second = lister.next_page().await.unwrap().unwrap();

        assert_eq!(first.start_token, None);
        assert!(first.next_token.is_some());
        assert_eq!(second.start_token, first.next_token);
        assert_ne!(second.start_token, second.next_token);
    }

    #[tokio::test]
    async fn test_resume_repeats_the_saved_page() {
        let store = populated(6);
        let mut lister = ObjectLister::new(store.clone(), "bucket", "tiles/", 2);
        lister.next_page().await.unwrap();
        let second = lister.next_page().await.unwrap().unwrap();

        let mut resumed =
            ObjectLister::new(store, "bucket", "tiles/", 2).resume_from(second.start_token.clone());
        let replayed = resumed.next_page().await.unwrap().unwrap();

        assert_eq!(replayed.keys, second.keys);
        let rest = resumed.next_page().await.unwrap().unwrap();
        assert_eq!(rest.keys, vec!["tiles/0004.png", "tiles/0005.png"]);
        assert!(resumed.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listing_failure_is_reported() {
        let store = populated(3);
        store.fail_listing();
        let mut lister = ObjectLister::new(store, "bucket", "tiles/", 2);

        let err = lister.next_page().await.unwrap_err();
        assert_eq!(err.bucket, "bucket");
        assert!(matches!(err.source, StoreError::Request(_)));
    }

    #[tokio::test]
    async fn test_missing_bucket() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let mut lister = ObjectLister::new(store, "absent", "", 10);
        let err = lister.next_page().await.unwrap_err();
        assert_eq!(err.source, StoreError::NoSuchBucket("absent".to_string()));
    }
}
