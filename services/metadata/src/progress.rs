//! Progress counters and live progress display.
//!
//! Workers bump [`ProgressCounters`] as merges finish; [`ProgressReporter`]
//! only reads them, on its own timer, and never feeds back into scheduling.

use crate::merger::{MergeError, MergeOutcome};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Process-wide tallies, shared by every worker
#[derive(Debug, Default)]
pub struct ProgressCounters {
    total_seen: AtomicU64,
    completed: AtomicU64,
    updated: AtomicU64,
    unchanged: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`ProgressCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total_seen: u64,
    pub completed: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
}

impl ProgressSnapshot {
    pub fn succeeded(&self) -> u64 {
        self.updated + self.unchanged
    }
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record newly listed objects
    pub fn add_seen(&self, count: u64) {
        self.total_seen.fetch_add(count, Ordering::SeqCst);
    }

    /// Record one finished merge attempt
    pub fn record(&self, result: &Result<MergeOutcome, MergeError>) {
        let counter = match result {
            Ok(MergeOutcome::Updated) | Ok(MergeOutcome::WouldUpdate) => &self.updated,
            Ok(MergeOutcome::Unchanged) => &self.unchanged,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a merge attempt that ended without a result (worker panic)
    pub fn record_lost(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        // completed before total_seen so a snapshot never shows completed > total
        let completed = self.completed.load(Ordering::SeqCst);
        ProgressSnapshot {
            total_seen: self.total_seen.load(Ordering::SeqCst),
            completed,
            updated: self.updated.load(Ordering::SeqCst),
            unchanged: self.unchanged.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// Live `completed / total` display refreshed on a timer
pub struct ProgressReporter {
    bar: ProgressBar,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
    counters: Arc<ProgressCounters>,
}

impl ProgressReporter {
    /// Start rendering. A hidden reporter still runs so callers need not
    /// special-case quiet mode.
    pub fn start(counters: Arc<ProgressCounters>, interval: Duration, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new(0)
        } else {
            ProgressBar::hidden()
        };

        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let stop = CancellationToken::new();
        let handle = tokio::spawn(Self::tick(
            bar.clone(),
            counters.clone(),
            interval,
            stop.clone(),
        ));

        Self {
            bar,
            stop,
            handle: Some(handle),
            counters,
        }
    }

    async fn tick(
        bar: ProgressBar,
        counters: Arc<ProgressCounters>,
        interval: Duration,
        stop: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => render(&bar, &counters.snapshot()),
            }
        }
    }

    /// Stop refreshing and leave the final count on screen
    pub async fn finish(mut self, message: &str) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        render(&self.bar, &self.counters.snapshot());
        let line = format!("{} ({})", progress_line(&self.counters.snapshot()), message);
        self.bar.finish_with_message(line);
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn render(bar: &ProgressBar, snapshot: &ProgressSnapshot) {
    // The total keeps growing while listing is still running
    bar.set_length(snapshot.total_seen.max(snapshot.completed));
    bar.set_position(snapshot.completed);
    bar.set_message(progress_line(snapshot));
}

/// `completed / total objects`, with failures when there are any
pub fn progress_line(snapshot: &ProgressSnapshot) -> String {
    let mut line = format!(
        "{} / {} objects",
        format_number(snapshot.completed),
        format_number(snapshot.total_seen)
    );
    if snapshot.failed > 0 {
        line.push_str(&format!(" ({} failed)", format_number(snapshot.failed)));
    }
    line
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Print the end-of-run summary
pub fn print_summary(
    snapshot: &ProgressSnapshot,
    duration: Duration,
    interrupted: bool,
    checkpoint: Option<&Path>,
    failures: &[MergeError],
) {
    let heading = if interrupted {
        style("Run Interrupted").yellow().bold()
    } else {
        style("Run Complete").green().bold()
    };

    println!();
    println!("{}", heading);
    println!("{}", style("─".repeat(50)).dim());
    println!(
        "  {} {}",
        style("Succeeded:").bold(),
        format_number(snapshot.succeeded())
    );
    if snapshot.unchanged > 0 {
        println!(
            "  {} {}",
            style("  unchanged:").dim(),
            format_number(snapshot.unchanged)
        );
    }
    let failed = format!("{} {}", style("Failed:").bold(), format_number(snapshot.failed));
    if snapshot.failed > 0 {
        println!("  {}", style(failed).yellow());
    } else {
        println!("  {}", failed);
    }
    println!(
        "  {} {}",
        style("Total:").bold(),
        format_number(snapshot.total_seen)
    );
    println!(
        "  {} {:.1}s",
        style("Duration:").bold(),
        duration.as_secs_f64()
    );
    if let Some(path) = checkpoint {
        println!("  {} {}", style("Checkpoint:").bold(), path.display());
    }
    for failure in failures.iter().take(10) {
        println!("  {} {}", style("✗").red(), failure);
    }
    if failures.len() > 10 {
        println!("  {} more failures in the log", failures.len() - 10);
    }
    println!();
}
