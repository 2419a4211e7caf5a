use crate::checkpoint::{self, Checkpoint, CheckpointError};
use crate::classifier::ClassifiedMetadata;
use crate::config::{GracePolicy, RunConfig};
use crate::lister::{ListError, ListingPage, ObjectLister};
use crate::merger::{MergeError, MergeOutcome, MetadataMerger};
use crate::progress::{ProgressCounters, ProgressSnapshot};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Failures kept in the run report; the rest are only logged
const MAX_REPORTED_FAILURES: usize = 100;

/// Errors that end a run early
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Listing(#[from] ListError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Listing,
    Dispatching,
    Draining,
    Completed,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Stopped on request. `checkpoint` is `None` only when nothing had been
    /// started yet.
    Interrupted { checkpoint: Option<PathBuf> },
}

/// Outcome of one coordinated run over a single bucket/prefix
#[derive(Debug)]
pub struct RunReport {
    pub bucket: String,
    pub prefix: String,
    pub status: RunStatus,
    pub pages: u64,
    pub stats: ProgressSnapshot,
    /// First failures, in completion order
    pub failures: Vec<MergeError>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_interrupted(&self) -> bool {
        matches!(self.status, RunStatus::Interrupted { .. })
    }

    pub fn checkpoint(&self) -> Option<&PathBuf> {
        match self.status {
            RunStatus::Interrupted { ref checkpoint } => checkpoint.as_ref(),
            RunStatus::Completed => None,
        }
    }
}

/// Per-run tallies, kept by the coordinator from joined results
#[derive(Default)]
struct Tally {
    stats: ProgressSnapshot,
    failures: Vec<MergeError>,
}

impl Tally {
    fn record(&mut self, result: Result<MergeOutcome, MergeError>) {
        self.stats.completed += 1;
        match result {
            Ok(MergeOutcome::Updated) | Ok(MergeOutcome::WouldUpdate) => {
                self.stats.updated += 1;
                metrics::counter!("metadata.objects.updated").increment(1);
            }
            Ok(MergeOutcome::Unchanged) => {
                self.stats.unchanged += 1;
                metrics::counter!("metadata.objects.unchanged").increment(1);
            }
            Err(e) => {
                error!(key = %e.key, error = %e.cause, "Failed to update object metadata");
                metrics::counter!("metadata.objects.failed").increment(1);
                self.stats.failed += 1;
                if self.failures.len() < MAX_REPORTED_FAILURES {
                    self.failures.push(e);
                }
            }
        }
    }
}

/// How a single page ended
struct PageOutcome {
    drained: bool,
}

/// Drives listing and fans merges out over a bounded worker pool, one page
/// at a time.
///
/// The next page is only requested once every merge of the current page has
/// finished, so in-flight work never exceeds one page. A shutdown request is
/// honored between pages (or right away under [`GracePolicy::Abandon`]); the
/// abort token always abandons in-flight merges.
pub struct WorkCoordinator {
    concurrency: usize,
    grace: GracePolicy,
    checkpoint_dir: PathBuf,
    counters: Arc<ProgressCounters>,
    shutdown: CancellationToken,
    abort: CancellationToken,
}

impl WorkCoordinator {
    pub fn new(run: &RunConfig, counters: Arc<ProgressCounters>, shutdown: CancellationToken) -> Self {
        Self {
            concurrency: run.concurrency.max(1),
            grace: run.grace,
            checkpoint_dir: run.checkpoint_dir.clone(),
            counters,
            shutdown,
            abort: CancellationToken::new(),
        }
    }

    /// Token that forces in-flight merges to be abandoned
    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    /// Run every page of `lister` through `merger`
    #[instrument(skip_all, fields(bucket = %lister.bucket(), prefix = %lister.prefix()))]
    pub async fn run(
        &self,
        mut lister: ObjectLister,
        merger: Arc<MetadataMerger>,
        updates: Arc<ClassifiedMetadata>,
    ) -> Result<RunReport, CoordinatorError> {
        let started = Instant::now();
        let resumed_from = lister.cursor().map(String::from);
        let mut tally = Tally::default();
        let mut pages = 0u64;
        let mut last_page: Option<(ListingPage, bool)> = None;
        let mut state = RunState::Listing;

        info!("Queueing tasks...");

        let status = loop {
            if self.shutdown.is_cancelled() {
                break RunStatus::Interrupted { checkpoint: None };
            }

            transition(&mut state, RunState::Listing);
            let page = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => continue,
                page = lister.next_page() => page?,
            };

            let Some(page) = page else {
                break RunStatus::Completed;
            };

            pages += 1;
            let count = page.keys.len() as u64;
            self.counters.add_seen(count);
            tally.stats.total_seen += count;
            debug!(page = pages, keys = count, "Dispatching page");

            let outcome = self
                .process_page(&page, &merger, &updates, &mut tally, &mut state)
                .await;

            let finished = outcome.drained && page.next_token.is_none();
            last_page = Some((page, outcome.drained));

            if finished {
                break RunStatus::Completed;
            }
        };

        let status = match status {
            RunStatus::Completed => {
                transition(&mut state, RunState::Completed);
                RunStatus::Completed
            }
            RunStatus::Interrupted { .. } => {
                transition(&mut state, RunState::Interrupted);
                warn!(pages, "Run interrupted");
                let checkpoint = self.save_checkpoint(&lister, last_page, resumed_from)?;
                RunStatus::Interrupted { checkpoint }
            }
        };

        info!(
            updated = tally.stats.updated,
            unchanged = tally.stats.unchanged,
            failed = tally.stats.failed,
            total = tally.stats.total_seen,
            "Run finished"
        );

        Ok(RunReport {
            bucket: lister.bucket().to_string(),
            prefix: lister.prefix().to_string(),
            status,
            pages,
            stats: tally.stats,
            failures: tally.failures,
            elapsed: started.elapsed(),
        })
    }

    /// Merge every key of `page` with at most `concurrency` merges running.
    /// Returns once all started merges have finished or been abandoned.
    async fn process_page(
        &self,
        page: &ListingPage,
        merger: &Arc<MetadataMerger>,
        updates: &Arc<ClassifiedMetadata>,
        tally: &mut Tally,
        state: &mut RunState,
    ) -> PageOutcome {
        let mut pending = page.keys.iter();
        let mut in_flight: JoinSet<Result<MergeOutcome, MergeError>> = JoinSet::new();
        let mut stopped_early = false;

        transition(state, RunState::Dispatching);

        loop {
            while in_flight.len() < self.concurrency {
                if self.shutdown.is_cancelled() {
                    stopped_early = stopped_early || pending.len() > 0;
                    break;
                }
                let Some(key) = pending.next() else {
                    break;
                };

                let key = key.clone();
                let merger = merger.clone();
                let updates = updates.clone();
                let counters = self.counters.clone();
                in_flight.spawn(async move {
                    let result = merger.merge(&key, &updates).await;
                    counters.record(&result);
                    result
                });
            }

            if pending.len() == 0 || self.shutdown.is_cancelled() {
                transition(state, RunState::Draining);
            }

            let abandon_on_shutdown = self.grace == GracePolicy::Abandon;
            let joined = tokio::select! {
                biased;
                _ = self.abort.cancelled() => None,
                _ = self.shutdown.cancelled(), if abandon_on_shutdown => None,
                joined = in_flight.join_next() => match joined {
                    Some(joined) => Some(joined),
                    None => break,
                },
            };

            match joined {
                Some(Ok(result)) => tally.record(result),
                Some(Err(e)) => {
                    error!(error = %e, "Merge task did not complete");
                    self.counters.record_lost();
                    tally.stats.completed += 1;
                    tally.stats.failed += 1;
                }
                None => {
                    let abandoned = in_flight.len();
                    in_flight.shutdown().await;
                    warn!(abandoned, "Abandoned in-flight merges");
                    return PageOutcome { drained: false };
                }
            }

            if in_flight.is_empty() && (pending.len() == 0 || self.shutdown.is_cancelled()) {
                break;
            }
        }

        PageOutcome {
            drained: !stopped_early && pending.len() == 0,
        }
    }

    fn save_checkpoint(
        &self,
        lister: &ObjectLister,
        last_page: Option<(ListingPage, bool)>,
        resumed_from: Option<String>,
    ) -> Result<Option<PathBuf>, CheckpointError> {
        let checkpoint = match (last_page, resumed_from) {
            (Some((page, drained)), _) => {
                Checkpoint::new(lister.bucket(), lister.prefix(), page, drained)
            }
            // Interrupted before the first page of a resumed run: keep the
            // position we were given
            (None, Some(token)) => {
                let page = ListingPage {
                    start_token: Some(token),
                    next_token: None,
                    keys: Vec::new(),
                };
                Checkpoint::new(lister.bucket(), lister.prefix(), page, false)
            }
            (None, None) => {
                info!("Nothing was started; no checkpoint needed");
                return Ok(None);
            }
        };

        checkpoint::save(&self.checkpoint_dir, &checkpoint).map(Some)
    }
}

fn transition(state: &mut RunState, next: RunState) {
    if *state != next {
        debug!(from = ?*state, to = ?next, "Coordinator state change");
        *state = next;
    }
}
