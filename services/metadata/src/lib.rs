//! Bulk Metadata Updater
//!
//! Merges a set of metadata fields into every object under one or more
//! S3 prefixes. Each object is read, its existing metadata merged with the
//! requested fields, and written back with an in-place conditional copy so
//! concurrent writers are never overwritten.
//!
//! ## Features
//!
//! - **Field Classification**: Recognized system fields (`Cache-Control`,
//!   `Content-Type`, ...) are matched regardless of casing or hyphenation;
//!   everything else becomes user metadata
//! - **Optimistic Concurrency**: Copies are conditional on the ETag that was
//!   read, so an object changed in between is reported instead of clobbered
//! - **Bounded Parallelism**: A fixed-size worker pool with page-level
//!   backpressure keeps memory flat regardless of prefix size
//! - **Interrupt and Resume**: A first interrupt drains the current page and
//!   writes a checkpoint; `--resume` picks up from it
//!
//! ## Architecture
//!
//! ```text
//!  --set KEY=VALUE          S3 Bucket
//! ┌──────────────┐         ┌──────────────┐
//! │ Classifier   │         │ ListObjectsV2│
//! └──────────────┘         └──────────────┘
//!        │                        │
//!        │                        ▼
//!        │                 ┌──────────────┐        ┌──────────────┐
//!        │                 │ Object       │───────▶│ Checkpoint   │
//!        │                 │ Lister       │ pages  │ (on interrupt│
//!        │                 └──────────────┘        └──────────────┘
//!        │                        │
//!        ▼                        ▼
//! ┌──────────────────────────────────────┐
//! │ Work Coordinator (N workers)         │
//! │  HeadObject ─▶ merge ─▶ CopyObject   │
//! │                        (If-Match)    │
//! └──────────────────────────────────────┘
//!                   │
//!                   ▼
//!            ┌──────────────┐
//!            │ Progress /   │
//!            │ Summary      │
//!            └──────────────┘
//! ```

pub mod app;
pub mod checkpoint;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod lister;
pub mod location;
pub mod merger;
pub mod progress;
pub mod store;

pub use app::{execute, AppError, Invocation, Outcome};
pub use checkpoint::{Checkpoint, CheckpointError};
pub use classifier::{classify, ClassifiedMetadata, MetadataUpdateRequest, ParseError, SystemField};
pub use cli::{CliArgs, Verbosity};
pub use config::{Config, ConfigError, GracePolicy};
pub use coordinator::{CoordinatorError, RunReport, RunStatus, WorkCoordinator};
pub use lister::{ListError, ListingPage, ObjectLister};
pub use location::{LocationError, StoreLocation};
pub use merger::{MergeError, MergeFailure, MergeOutcome, MetadataMerger};
pub use progress::{ProgressCounters, ProgressReporter, ProgressSnapshot};
pub use store::{
    MemoryStore, MergedMetadata, ObjectAttributes, ObjectRecord, ObjectStore, S3Store, StoreError,
};
