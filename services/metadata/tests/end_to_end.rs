use async_trait::async_trait;
use clap::Parser;
use metadata_updater::app::{self, Invocation, Outcome, EXIT_INTERRUPTED, EXIT_OK};
use metadata_updater::checkpoint::{self, Checkpoint};
use metadata_updater::config::RunConfig;
use metadata_updater::progress::ProgressCounters;
use metadata_updater::store::{
    MemoryStore, MergedMetadata, ObjectListing, ObjectRecord, ObjectStore, StoreError,
};
use metadata_updater::{CliArgs, ListingPage, MergeFailure, SystemField};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Cancels `token` once `after` copies have landed
struct InterruptAfterCopies {
    inner: Arc<MemoryStore>,
    token: CancellationToken,
    after: usize,
    copies: AtomicUsize,
}

#[async_trait]
impl ObjectStore for InterruptAfterCopies {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
        max_keys: i32,
    ) -> Result<ObjectListing, StoreError> {
        self.inner
            .list_objects(bucket, prefix, continuation_token, max_keys)
            .await
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectRecord, StoreError> {
        self.inner.head_object(bucket, key).await
    }

    async fn copy_object(
        &self,
        bucket: &str,
        key: &str,
        metadata: &MergedMetadata,
        if_match: &str,
    ) -> Result<(), StoreError> {
        let result = self.inner.copy_object(bucket, key, metadata, if_match).await;
        if self.copies.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.token.cancel();
        }
        result
    }
}

fn invocation(args: &[&str]) -> Invocation {
    let args = CliArgs::try_parse_from(std::iter::once("set-metadata").chain(args.iter().copied()))
        .unwrap();
    Invocation::from_args(&args).unwrap()
}

fn run_config(checkpoint_dir: &Path, concurrency: usize, page_size: usize) -> RunConfig {
    RunConfig {
        concurrency,
        page_size,
        checkpoint_dir: checkpoint_dir.to_path_buf(),
        ..RunConfig::default()
    }
}

async fn execute(
    invocation: &Invocation,
    store: Arc<dyn ObjectStore>,
    run: &RunConfig,
    shutdown: CancellationToken,
) -> Outcome {
    app::execute(
        invocation,
        store,
        run,
        Arc::new(ProgressCounters::new()),
        shutdown,
        CancellationToken::new(),
    )
    .await
    .unwrap()
}

fn tiles(count: usize) -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    store.create_bucket("tiles");
    for i in 0..count {
        store.put_object("tiles", &format!("osm/{:05}.png", i), [("source", "render")]);
    }
    Arc::new(store)
}

#[tokio::test]
async fn test_partial_failure_still_completes() {
    let dir = tempfile::tempdir().unwrap();
    let store = tiles(3);
    store.fail_head("osm/00001.png");

    let invocation = invocation(&[
        "s3://tiles/osm/",
        "--set",
        "CacheControl=max-age=3600",
        "--set",
        "team=platform",
    ]);
    let outcome = execute(
        &invocation,
        store.clone(),
        &run_config(dir.path(), 4, 1000),
        CancellationToken::new(),
    )
    .await;

    let totals = outcome.totals();
    assert_eq!(outcome.exit_code(), EXIT_OK);
    assert_eq!(totals.succeeded(), 2);
    assert_eq!(totals.failed, 1);
    assert_eq!(totals.total_seen, 3);

    let failures = outcome.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].key, "osm/00001.png");
    assert!(matches!(
        failures[0].cause,
        MergeFailure::Fetch(StoreError::NotFound(_))
    ));

    for key in ["osm/00000.png", "osm/00002.png"] {
        let object = store.object("tiles", key).unwrap();
        assert_eq!(
            object.system.get(&SystemField::CacheControl).map(String::as_str),
            Some("max-age=3600")
        );
        assert_eq!(object.user.get("team").map(String::as_str), Some("platform"));
        assert_eq!(object.user.get("source").map(String::as_str), Some("render"));
    }
}

#[tokio::test]
async fn test_later_spelling_of_system_field_wins() {
    let dir = tempfile::tempdir().unwrap();
    let store = tiles(2);

    let invocation = invocation(&[
        "s3://tiles/osm/",
        "-s",
        "Cache-Control=a",
        "-s",
        "cachecontrol=b",
    ]);
    execute(
        &invocation,
        store.clone(),
        &run_config(dir.path(), 2, 1000),
        CancellationToken::new(),
    )
    .await;

    let object = store.object("tiles", "osm/00000.png").unwrap();
    assert_eq!(
        object.system.get(&SystemField::CacheControl).map(String::as_str),
        Some("b")
    );
    assert!(!object.user.contains_key("Cache-Control"));
    assert!(!object.user.contains_key("cachecontrol"));
}

#[tokio::test]
async fn test_second_run_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = tiles(10);
    let invocation = invocation(&["s3://tiles/osm/", "-s", "ContentType=image/png"]);
    let run = run_config(dir.path(), 3, 4);

    let first = execute(&invocation, store.clone(), &run, CancellationToken::new()).await;
    let after_first = store.object("tiles", "osm/00007.png").unwrap();

    let second = execute(&invocation, store.clone(), &run, CancellationToken::new()).await;
    let after_second = store.object("tiles", "osm/00007.png").unwrap();

    assert_eq!(first.totals().updated, 10);
    assert_eq!(second.totals().updated, 0);
    assert_eq!(second.totals().unchanged, 10);
    assert_eq!(after_first, after_second);
    assert_eq!(store.copy_count("osm/00007.png"), 1);
}

#[tokio::test]
async fn test_every_object_is_visited_across_pages() {
    let dir = tempfile::tempdir().unwrap();
    let store = tiles(2500);
    store.put_object("tiles", "raster/00000.png", [("source", "render")]);

    let invocation = invocation(&["s3://tiles/osm/", "-s", "team=platform"]);
    let outcome = execute(
        &invocation,
        store.clone(),
        &run_config(dir.path(), 16, 1000),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome.totals().total_seen, 2500);
    assert_eq!(outcome.totals().updated, 2500);
    assert_eq!(outcome.reports[0].pages, 3);
    assert_eq!(store.list_calls(), 3);
    for i in 0..2500 {
        assert_eq!(store.copy_count(&format!("osm/{:05}.png", i)), 1);
    }
    assert_eq!(store.copy_count("raster/00000.png"), 0);
}

#[tokio::test]
async fn test_interrupted_run_resumes_without_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let memory = tiles(12);
    let shutdown = CancellationToken::new();
    let store = Arc::new(InterruptAfterCopies {
        inner: memory.clone(),
        token: shutdown.clone(),
        after: 6,
        copies: AtomicUsize::new(0),
    });
    let run = run_config(dir.path(), 1, 4);

    let args = ["s3://tiles/osm/", "-s", "team=platform"];
    let outcome = execute(&invocation(&args), store, &run, shutdown).await;

    assert!(outcome.interrupted());
    assert_eq!(outcome.exit_code(), EXIT_INTERRUPTED);
    assert_eq!(outcome.totals().updated, 6);
    let checkpoint = outcome.reports[0].checkpoint().unwrap().clone();
    assert!(checkpoint.starts_with(dir.path()));

    let mut resume_args = args.to_vec();
    resume_args.extend(["--resume", checkpoint.to_str().unwrap()]);
    let resumed = execute(
        &invocation(&resume_args),
        memory.clone(),
        &run,
        CancellationToken::new(),
    )
    .await;

    assert_eq!(resumed.exit_code(), EXIT_OK);
    // The interrupted page is replayed; its finished keys are left alone
    assert_eq!(resumed.totals().updated, 6);
    assert_eq!(resumed.totals().unchanged, 2);
    for i in 0..12 {
        let key = format!("osm/{:05}.png", i);
        assert_eq!(memory.copy_count(&key), 1, "{}", key);
        let object = memory.object("tiles", &key).unwrap();
        assert_eq!(object.user.get("team").map(String::as_str), Some("platform"));
    }
}

#[tokio::test]
async fn test_locations_run_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = tiles(3);
    store.put_object("tiles", "raster/00000.png", [("source", "render")]);

    let invocation = invocation(&["s3://tiles/osm/", "s3://tiles/raster/", "-s", "team=platform"]);
    let outcome = execute(
        &invocation,
        store.clone(),
        &run_config(dir.path(), 2, 1000),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome.reports.len(), 2);
    assert_eq!(outcome.reports[0].prefix, "osm/");
    assert_eq!(outcome.reports[1].prefix, "raster/");
    assert_eq!(outcome.totals().updated, 4);
}

#[tokio::test]
async fn test_dry_run_copies_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = tiles(5);

    let invocation = invocation(&["s3://tiles/osm/", "-s", "team=platform", "--dry-run"]);
    let outcome = execute(
        &invocation,
        store.clone(),
        &run_config(dir.path(), 2, 1000),
        CancellationToken::new(),
    )
    .await;

    // Counted as would-be updates
    assert_eq!(outcome.totals().completed, 5);
    assert_eq!(outcome.totals().updated, 5);
    assert_eq!(store.copy_count("osm/00000.png"), 0);
    assert!(store.object("tiles", "osm/00000.png").unwrap().user.get("team").is_none());
}

#[tokio::test]
async fn test_resume_skips_locations_before_the_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let store = tiles(3);
    store.put_object("tiles", "raster/00000.png", [("source", "render")]);
    store.put_object("tiles", "raster/00001.png", [("source", "render")]);

    let page = ListingPage {
        start_token: Some("raster/00000.png".to_string()),
        next_token: None,
        keys: vec!["raster/00001.png".to_string()],
    };
    let path = checkpoint::save(dir.path(), &Checkpoint::new("tiles", "raster/", page, false))
        .unwrap();

    let invocation = invocation(&[
        "s3://tiles/osm/",
        "s3://tiles/raster/",
        "-s",
        "team=platform",
        "--resume",
        path.to_str().unwrap(),
    ]);
    let outcome = execute(
        &invocation,
        store.clone(),
        &run_config(dir.path(), 2, 1000),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome.exit_code(), EXIT_OK);
    assert_eq!(outcome.reports.len(), 1);
    assert_eq!(outcome.reports[0].prefix, "raster/");
    for i in 0..3 {
        assert_eq!(store.copy_count(&format!("osm/{:05}.png", i)), 0);
    }
    assert_eq!(store.copy_count("raster/00000.png"), 0);
    assert_eq!(store.copy_count("raster/00001.png"), 1);
}

