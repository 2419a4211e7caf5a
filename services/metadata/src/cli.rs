//! Command-line surface for the `set-metadata` binary.

use crate::config::{Config, GracePolicy};
use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// Merge metadata into every object under one or more S3 prefixes
#[derive(Parser, Debug, Clone)]
#[command(
    name = "set-metadata",
    version,
    about = "Merge metadata into every object under one or more S3 prefixes",
    long_about = "Lists every object under each location and merges the given fields into its \
                  existing metadata with a conditional in-place copy. Objects changed by another \
                  writer in the meantime are reported and left alone.\n\n\
                  Recognized system fields (Cache-Control, Content-Type, ...) may be spelled with \
                  any casing or hyphenation; every other key is stored as user metadata.",
    after_help = "EXAMPLES:\n    \
        set-metadata s3://tiles/osm/ --set Cache-Control=max-age=3600\n    \
        set-metadata s3://tiles/osm/ -s team=platform -s ContentType=image/png -c 32\n    \
        set-metadata s3://tiles/osm/ -s team=platform --resume set-metadata-checkpoint-20240115T103045.123Z.json"
)]
pub struct CliArgs {
    /// Locations to update (s3://bucket/prefix)
    #[arg(value_name = "LOCATION", required = true)]
    pub locations: Vec<String>,

    /// Metadata field to set (can be repeated)
    #[arg(
        short = 's',
        long = "set",
        value_name = "KEY=VALUE",
        action = ArgAction::Append,
        required = true
    )]
    pub set: Vec<String>,

    /// Turn on debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Only log errors and hide the progress bar
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Resume from a checkpoint written by an interrupted run
    #[arg(long, value_name = "FILE")]
    pub resume: Option<PathBuf>,

    /// Number of concurrent merges
    #[arg(short = 'c', long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Keys requested per listing page (1-1000)
    #[arg(long, value_name = "NUM")]
    pub page_size: Option<usize>,

    /// Directory checkpoints are written to
    #[arg(long, value_name = "DIR")]
    pub checkpoint_dir: Option<PathBuf>,

    /// What to do with running merges on interrupt
    #[arg(long, value_enum, value_name = "POLICY")]
    pub grace: Option<GracePolicy>,

    /// Copy objects even when their metadata would not change
    #[arg(long)]
    pub no_skip_unchanged: bool,

    /// List and fetch, but never copy
    #[arg(long)]
    pub dry_run: bool,

    /// S3-compatible endpoint URL
    #[arg(long, value_name = "URL")]
    pub endpoint_url: Option<String>,

    /// AWS region
    #[arg(long, value_name = "REGION")]
    pub region: Option<String>,
}

/// Logging verbosity. `--debug` raises it and `--quiet` lowers it; given
/// together they cancel out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Quiet,
    Normal,
    Debug,
}

impl Verbosity {
    /// Log level directive for this verbosity
    pub fn log_level(&self, configured: &str) -> String {
        match self {
            Verbosity::Quiet => "error".to_string(),
            Verbosity::Normal => configured.to_string(),
            Verbosity::Debug => "debug".to_string(),
        }
    }

    pub fn show_progress(&self) -> bool {
        *self != Verbosity::Quiet
    }
}

impl CliArgs {
    pub fn verbosity(&self) -> Verbosity {
        match (self.debug, self.quiet) {
            (true, false) => Verbosity::Debug,
            (false, true) => Verbosity::Quiet,
            _ => Verbosity::Normal,
        }
    }

    /// Override loaded configuration with the flags that were given
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(concurrency) = self.concurrency {
            config.run.concurrency = concurrency;
        }
        if let Some(page_size) = self.page_size {
            config.run.page_size = page_size;
        }
        if let Some(ref dir) = self.checkpoint_dir {
            config.run.checkpoint_dir = dir.clone();
        }
        if let Some(grace) = self.grace {
            config.run.grace = grace;
        }
        if self.no_skip_unchanged {
            config.run.skip_unchanged = false;
        }
        if let Some(ref endpoint_url) = self.endpoint_url {
            config.s3.endpoint_url = Some(endpoint_url.clone());
        }
        if let Some(ref region) = self.region {
            config.s3.region = region.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Result<CliArgs, clap::Error> {
        CliArgs::try_parse_from(std::iter::once("set-metadata").chain(args.iter().copied()))
    }

    #[test]
    fn test_cli_definition() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_repeated_set_keeps_order() {
        let args = parse(&[
            "s3://b/p",
            "--set",
            "CacheControl=max-age=3600",
            "-s",
            "team=platform",
        ])
        .unwrap();
        assert_eq!(args.set, vec!["CacheControl=max-age=3600", "team=platform"]);
        assert_eq!(args.locations, vec!["s3://b/p"]);
    }

    #[test]
    fn test_location_and_set_are_required() {
        assert!(parse(&["--set", "a=b"]).is_err());
        assert!(parse(&["s3://b/p"]).is_err());
    }

    #[test]
    fn test_verbosity() {
        let base = ["s3://b/p", "-s", "a=b"];
        let with = |flags: &[&str]| {
            let mut all: Vec<&str> = base.to_vec();
            all.extend_from_slice(flags);
            parse(&all).unwrap().verbosity()
        };

        assert_eq!(with(&[]), Verbosity::Normal);
        assert_eq!(with(&["--debug"]), Verbosity::Debug);
        assert_eq!(with(&["-q"]), Verbosity::Quiet);
        assert_eq!(with(&["-d", "-q"]), Verbosity::Normal);
        assert_eq!(Verbosity::Quiet.log_level("info"), "error");
        assert_eq!(Verbosity::Normal.log_level("warn"), "warn");
        assert!(!Verbosity::Quiet.show_progress());
    }

    #[test]
    fn test_flags_override_config() {
        let args = parse(&[
            "s3://b/p",
            "-s",
            "a=b",
            "-c",
            "64",
            "--grace",
            "abandon",
            "--no-skip-unchanged",
            "--endpoint-url",
            "http://localhost:9000",
        ])
        .unwrap();

        let mut config = Config::default();
        args.apply_to(&mut config);

        assert_eq!(config.run.concurrency, 64);
        assert_eq!(config.run.page_size, 1000);
        assert_eq!(config.run.grace, GracePolicy::Abandon);
        assert!(!config.run.skip_unchanged);
        assert_eq!(config.s3.endpoint_url.as_deref(), Some("http://localhost:9000"));
    }
}
