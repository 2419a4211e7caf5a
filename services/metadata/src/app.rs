//! Ties the command line to the coordinator: validates the invocation before
//! any network activity, then runs each location in order.

use crate::checkpoint::{self, Checkpoint, CheckpointError};
use crate::classifier::{classify, ClassifiedMetadata, MetadataUpdateRequest, ParseError};
use crate::cli::CliArgs;
use crate::config::{ConfigError, RunConfig};
use crate::coordinator::{CoordinatorError, RunReport, WorkCoordinator};
use crate::lister::ObjectLister;
use crate::location::{LocationError, StoreLocation};
use crate::merger::{MergeError, MetadataMerger};
use crate::progress::{ProgressCounters, ProgressSnapshot};
use crate::store::ObjectStore;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const EXIT_OK: u8 = 0;
pub const EXIT_FATAL: u8 = 1;
pub const EXIT_USAGE: u8 = 2;
pub const EXIT_INTERRUPTED: u8 = 130;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    InvalidMetadata(#[from] ParseError),

    #[error(transparent)]
    InvalidLocation(#[from] LocationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Checkpoint is for s3://{bucket}/{prefix}, which is not among the given locations")]
    ResumeMismatch { bucket: String, prefix: String },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Run(#[from] CoordinatorError),
}

impl AppError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::InvalidMetadata(_)
            | AppError::InvalidLocation(_)
            | AppError::Config(_)
            | AppError::ResumeMismatch { .. } => EXIT_USAGE,
            AppError::Checkpoint(_) | AppError::Run(_) => EXIT_FATAL,
        }
    }
}

/// A validated invocation: everything that can be rejected without touching
/// the network has been checked.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub locations: Vec<StoreLocation>,
    pub updates: Arc<ClassifiedMetadata>,
    pub resume: Option<Checkpoint>,
    pub dry_run: bool,
}

impl Invocation {
    pub fn from_args(args: &CliArgs) -> Result<Self, AppError> {
        let request = MetadataUpdateRequest::parse(&args.set)?;
        for (key, value) in request.fields() {
            debug!("will set '{}'='{}'", key, value);
        }

        let locations = args
            .locations
            .iter()
            .map(|url| StoreLocation::parse(url))
            .collect::<Result<Vec<_>, _>>()?;

        let resume = match args.resume {
            Some(ref path) => {
                let checkpoint = checkpoint::load(path)?;
                let known = locations
                    .iter()
                    .any(|l| l.bucket == checkpoint.bucket && l.prefix == checkpoint.prefix);
                if !known {
                    return Err(AppError::ResumeMismatch {
                        bucket: checkpoint.bucket,
                        prefix: checkpoint.prefix,
                    });
                }
                Some(checkpoint)
            }
            None => None,
        };

        Ok(Self {
            locations,
            updates: Arc::new(classify(&request)),
            resume,
            dry_run: args.dry_run,
        })
    }

    /// Index of the location the checkpoint belongs to. Locations run in
    /// order, so every one before it already finished.
    fn resume_position(&self) -> Option<usize> {
        let checkpoint = self.resume.as_ref()?;
        self.locations
            .iter()
            .position(|l| l.bucket == checkpoint.bucket && l.prefix == checkpoint.prefix)
    }

    /// Resume token for `location`, or `None` to start from the beginning.
    /// `Err(())` means the checkpoint says the location already finished.
    fn resume_token(&self, location: &StoreLocation) -> Result<Option<String>, ()> {
        match self.resume {
            Some(ref checkpoint)
                if checkpoint.bucket == location.bucket && checkpoint.prefix == location.prefix =>
            {
                if checkpoint.is_finished() {
                    Err(())
                } else {
                    Ok(checkpoint.resume_token())
                }
            }
            _ => Ok(None),
        }
    }
}

/// Reports for every location that was started
#[derive(Debug, Default)]
pub struct Outcome {
    pub reports: Vec<RunReport>,
}

impl Outcome {
    pub fn interrupted(&self) -> bool {
        self.reports.iter().any(RunReport::is_interrupted)
    }

    pub fn totals(&self) -> ProgressSnapshot {
        self.reports
            .iter()
            .fold(ProgressSnapshot::default(), |mut acc, report| {
                acc.total_seen += report.stats.total_seen;
                acc.completed += report.stats.completed;
                acc.updated += report.stats.updated;
                acc.unchanged += report.stats.unchanged;
                acc.failed += report.stats.failed;
                acc
            })
    }

    pub fn elapsed(&self) -> Duration {
        self.reports.iter().map(|r| r.elapsed).sum()
    }

    pub fn failures(&self) -> Vec<MergeError> {
        self.reports
            .iter()
            .flat_map(|r| r.failures.iter().cloned())
            .collect()
    }

    /// Per-object failures do not affect the exit code
    pub fn exit_code(&self) -> u8 {
        if self.interrupted() {
            EXIT_INTERRUPTED
        } else {
            EXIT_OK
        }
    }
}

/// Run every location of `invocation` in order, stopping after the first
/// interrupted one.
pub async fn execute(
    invocation: &Invocation,
    store: Arc<dyn ObjectStore>,
    run: &RunConfig,
    counters: Arc<ProgressCounters>,
    shutdown: CancellationToken,
    abort: CancellationToken,
) -> Result<Outcome, AppError> {
    let coordinator = WorkCoordinator::new(run, counters, shutdown).with_abort(abort);
    let mut outcome = Outcome::default();

    let first = invocation.resume_position().unwrap_or(0);
    for location in &invocation.locations[..first] {
        info!(location = %location, "Finished before the checkpoint; skipping");
    }

    for (index, location) in invocation.locations.iter().enumerate().skip(first) {
        let Ok(resume_token) = invocation.resume_token(location) else {
            info!(location = %location, "Checkpoint shows this location already finished");
            continue;
        };

        info!(
            location = %location,
            resumed = resume_token.is_some(),
            "Processing location"
        );

        let lister = ObjectLister::new(store.clone(), &location.bucket, &location.prefix, run.page_size)
            .resume_from(resume_token);
        let merger = Arc::new(
            MetadataMerger::new(store.clone(), &location.bucket)
                .skip_unchanged(run.skip_unchanged)
                .dry_run(invocation.dry_run),
        );

        let report = coordinator
            .run(lister, merger, invocation.updates.clone())
            .await?;
        let interrupted = report.is_interrupted();
        outcome.reports.push(report);

        if interrupted {
            let skipped = &invocation.locations[index + 1..];
            if !skipped.is_empty() {
                warn!(
                    skipped = skipped.len(),
                    "Locations after the interrupted one were not started"
                );
            }
            break;
        }
    }

    Ok(outcome)
}
