use crate::classifier::ClassifiedMetadata;
use crate::store::{MergedMetadata, ObjectRecord, ObjectStore, StoreError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Why a single object could not be updated
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeFailure {
    #[error("fetch failed: {0}")]
    Fetch(StoreError),

    #[error("object was modified by another writer")]
    ConcurrentModification,

    #[error("replace failed: {0}")]
    Replace(StoreError),
}

/// Per-object failure. Never fatal to a run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to update metadata for {key}: {cause}")]
pub struct MergeError {
    pub key: String,
    #[source]
    pub cause: MergeFailure,
}

/// Result of a successful merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Metadata was replaced
    Updated,
    /// Object already carried the requested metadata
    Unchanged,
    /// Dry run: the object would have been replaced
    WouldUpdate,
}

impl MergedMetadata {
    /// Overlay `updates` on an object's current metadata.
    ///
    /// New values win on collision. User field names are compared ignoring
    /// ASCII case, since stores fold user metadata names.
    pub fn merge(existing: &ObjectRecord, updates: &ClassifiedMetadata) -> Self {
        let mut system = existing.system.clone();
        system.extend(updates.system.iter().map(|(f, v)| (*f, v.clone())));

        let mut user = existing.user.clone();
        for (name, value) in &updates.user {
            user.retain(|existing_name, _| !existing_name.eq_ignore_ascii_case(name));
            user.insert(name.clone(), value.clone());
        }

        Self {
            system,
            user,
            attributes: existing.attributes.clone(),
        }
    }

    /// Whether writing this metadata would leave `record` as it is. User
    /// names are compared ignoring ASCII case since stores return them
    /// lowercased.
    pub fn matches(&self, record: &ObjectRecord) -> bool {
        self.system == record.system && fold_names(&self.user) == fold_names(&record.user)
    }
}

fn fold_names(user: &BTreeMap<String, String>) -> BTreeMap<String, &str> {
    user.iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
        .collect()
}

/// Applies a classified update to one object at a time with a conditional
/// copy, so a concurrent writer's change is never silently overwritten.
pub struct MetadataMerger {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    skip_unchanged: bool,
    dry_run: bool,
}

impl MetadataMerger {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: &str) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            skip_unchanged: true,
            dry_run: false,
        }
    }

    pub fn skip_unchanged(mut self, skip: bool) -> Self {
        self.skip_unchanged = skip;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Fetch, merge and conditionally replace the metadata of `key`
    #[instrument(skip(self, updates), fields(bucket = %self.bucket))]
    pub async fn merge(
        &self,
        key: &str,
        updates: &ClassifiedMetadata,
    ) -> Result<MergeOutcome, MergeError> {
        let started = Instant::now();
        let fail = |cause| MergeError {
            key: key.to_string(),
            cause,
        };

        let record = self
            .store
            .head_object(&self.bucket, key)
            .await
            .map_err(|e| fail(MergeFailure::Fetch(e)))?;

        let merged = MergedMetadata::merge(&record, updates);

        if self.skip_unchanged && merged.matches(&record) {
            debug!(key = %key, "Metadata already up to date");
            return Ok(MergeOutcome::Unchanged);
        }

        if self.dry_run {
            info!(
                key = %key,
                system = ?merged.system,
                user = ?merged.user,
                "Dry run: would replace metadata"
            );
            return Ok(MergeOutcome::WouldUpdate);
        }

        self.store
            .copy_object(&self.bucket, key, &merged, &record.etag)
            .await
            .map_err(|e| match e {
                StoreError::PreconditionFailed(_) => fail(MergeFailure::ConcurrentModification),
                other => fail(MergeFailure::Replace(other)),
            })?;

        metrics::histogram!("metadata.merge.duration_seconds")
            .record(started.elapsed().as_secs_f64());
        debug!(key = %key, etag = %record.etag, "Copy successful");

        Ok(MergeOutcome::Updated)
    }
}
