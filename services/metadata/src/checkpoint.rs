//! Resume checkpoints.
//!
//! Written once, when a run is interrupted. The file records the listing page
//! that was in progress so a later invocation can pick up at that page
//! instead of relisting the whole prefix. The JSON layout is internal and may
//! change between versions.

use crate::lister::ListingPage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Failed to write checkpoint {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read checkpoint {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid checkpoint {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub bucket: String,
    pub prefix: String,
    /// Last page whose keys were handed to the worker pool
    pub page: ListingPage,
    /// Whether every merge of `page` finished before the run stopped
    pub page_drained: bool,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(bucket: &str, prefix: &str, page: ListingPage, page_drained: bool) -> Self {
        Self {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            page,
            page_drained,
            saved_at: Utc::now(),
        }
    }

    /// Token to hand to the lister: the page after a drained page, otherwise
    /// the interrupted page itself.
    pub fn resume_token(&self) -> Option<String> {
        if self.page_drained {
            self.page.next_token.clone()
        } else {
            self.page.start_token.clone()
        }
    }

    /// True when the recorded page was the last one and it completed
    pub fn is_finished(&self) -> bool {
        self.page_drained && self.page.next_token.is_none()
    }

    fn file_name(&self) -> String {
        format!(
            "set-metadata-checkpoint-{}.json",
            self.saved_at.format("%Y%m%dT%H%M%S%.3fZ")
        )
    }
}

/// Write `checkpoint` into `dir`, returning the file path
pub fn save(dir: &Path, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
    let path = dir.join(checkpoint.file_name());
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(checkpoint)?;

    let write_err = |source| CheckpointError::Write {
        path: path.clone(),
        source,
    };

    fs::create_dir_all(dir).map_err(write_err)?;
    fs::write(&tmp, body).map_err(write_err)?;
    fs::rename(&tmp, &path).map_err(write_err)?;

    info!(
        path = %path.display(),
        bucket = %checkpoint.bucket,
        keys = checkpoint.page.keys.len(),
        "Checkpoint saved"
    );

    Ok(path)
}

/// Read a checkpoint written by [`save`]
pub fn load(path: &Path) -> Result<Checkpoint, CheckpointError> {
    let body = fs::read(path).map_err(|source| CheckpointError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_slice(&body).map_err(|source| CheckpointError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> ListingPage {
        ListingPage {
            start_token: Some("tiles/0099.png".to_string()),
            next_token: Some("tiles/0199.png".to_string()),
            keys: vec!["tiles/0100.png".to_string(), "tiles/0101.png".to_string()],
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::new("bucket", "tiles", page(), false);

        let path = save(dir.path(), &checkpoint).unwrap();
        assert!(path.starts_with(dir.path()));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("set-metadata-checkpoint-"));

        let loaded = load(&path).unwrap();
        assert_eq!(loaded, checkpoint);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_save_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("state/checkpoints");
        let path = save(&nested, &Checkpoint::new("b", "", page(), true)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_resume_token_redoes_undrained_page() {
        let checkpoint = Checkpoint::new("bucket", "tiles", page(), false);
        assert_eq!(checkpoint.resume_token().as_deref(), Some("tiles/0099.png"));
        assert!(!checkpoint.is_finished());
    }

    #[test]
    fn test_resume_token_skips_drained_page() {
        let checkpoint = Checkpoint::new("bucket", "tiles", page(), true);
        assert_eq!(checkpoint.resume_token().as_deref(), Some("tiles/0199.png"));
    }

    #[test]
    fn test_finished_when_last_page_drained() {
        let mut last = page();
        last.next_token = None;
        assert!(Checkpoint::new("bucket", "tiles", last.clone(), true).is_finished());
        assert!(!Checkpoint::new("bucket", "tiles", last, false).is_finished());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(load(&path), Err(CheckpointError::Parse { .. })));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load(&dir.path().join("absent.json")),
            Err(CheckpointError::Read { .. })
        ));
    }
}
