use anyhow::{Context, Result};
use clap::Parser;
use metadata_updater::app::{self, AppError, Invocation, EXIT_FATAL};
use metadata_updater::config::{Config, LogFormat};
use metadata_updater::progress::{self, ProgressCounters, ProgressReporter};
use metadata_updater::store::{ObjectStore, S3Store};
use metadata_updater::CliArgs;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors exit with status 2 from here
    let args = CliArgs::parse();

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let code = e
                .downcast_ref::<AppError>()
                .map(AppError::exit_code)
                .unwrap_or(EXIT_FATAL);
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(code)
        }
    }
}

async fn run(args: CliArgs) -> Result<u8> {
    let mut config = Config::load(args.config.as_deref()).map_err(AppError::from)?;
    args.apply_to(&mut config);
    config.validate().map_err(AppError::from)?;

    let verbosity = args.verbosity();
    init_tracing(
        &verbosity.log_level(&config.service.log_level),
        config.service.log_format,
    );

    // Everything that can be rejected offline is rejected before the first
    // request goes out
    let invocation = Invocation::from_args(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        locations = invocation.locations.len(),
        fields = invocation.updates.len(),
        concurrency = config.run.concurrency,
        dry_run = invocation.dry_run,
        "Starting metadata update"
    );

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let store: Arc<dyn ObjectStore> = Arc::new(S3Store::new(&config.s3).await);

    let shutdown = CancellationToken::new();
    let abort = CancellationToken::new();
    spawn_signal_handler(shutdown.clone(), abort.clone());

    let counters = Arc::new(ProgressCounters::new());
    let reporter = ProgressReporter::start(
        counters.clone(),
        config.progress_interval(),
        verbosity.show_progress(),
    );

    let result = app::execute(
        &invocation,
        store,
        &config.run,
        counters,
        shutdown,
        abort,
    )
    .await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            reporter.finish("failed").await;
            return Err(e.into());
        }
    };

    let interrupted = outcome.interrupted();
    reporter
        .finish(if interrupted { "interrupted" } else { "done" })
        .await;

    let checkpoint = outcome.reports.iter().find_map(|r| r.checkpoint());
    if let Some(path) = checkpoint {
        warn!(checkpoint = %path.display(), "Run interrupted; pass --resume to continue");
    }

    let totals = outcome.totals();
    info!(
        succeeded = totals.succeeded(),
        updated = totals.updated,
        unchanged = totals.unchanged,
        failed = totals.failed,
        total = totals.total_seen,
        "Metadata update finished"
    );

    progress::print_summary(
        &totals,
        outcome.elapsed(),
        interrupted,
        checkpoint.map(|p| p.as_path()),
        &outcome.failures(),
    );

    Ok(outcome.exit_code())
}

/// Initialize tracing/logging. `RUST_LOG` takes precedence over `level`.
fn init_tracing(level: &str, format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    // stdout is reserved for the summary
    match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => subscriber
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// First signal stops new work; a second one abandons work in flight
fn spawn_signal_handler(shutdown: CancellationToken, abort: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = interrupt_signal().await {
            warn!(error = %e, "Failed to install signal handlers");
            return;
        }
        warn!("Interrupt received; finishing current work (interrupt again to abandon it)");
        shutdown.cancel();

        if let Err(e) = interrupt_signal().await {
            warn!(error = %e, "Failed to install signal handlers");
            return;
        }
        warn!("Second interrupt received; abandoning in-flight work");
        abort.cancel();
    });
}

/// Wait for SIGINT or SIGTERM
async fn interrupt_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}
