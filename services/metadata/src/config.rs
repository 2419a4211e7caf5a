use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the metadata updater
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 client configuration
    #[serde(default)]
    pub s3: S3Config,
    /// Run tuning
    #[serde(default)]
    pub run: RunConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
    /// Prometheus exporter port; no exporter is started when unset
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// S3 client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// What to do with in-flight merges when a run is interrupted
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum GracePolicy {
    /// Let the current page's merges finish
    #[default]
    Drain,
    /// Drop in-flight merges immediately
    Abandon,
}

/// Run tuning
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Worker pool size (concurrent merges)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Maximum keys requested per listing page
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Directory checkpoints are written to on interruption
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    /// Interruption grace policy
    #[serde(default)]
    pub grace: GracePolicy,
    /// Progress refresh interval in milliseconds
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Skip the copy when the merged metadata equals the existing metadata
    #[serde(default = "default_true")]
    pub skip_unchanged: bool,
}

/// Largest page S3 will return from a single ListObjectsV2 call
pub const MAX_PAGE_SIZE: usize = 1000;

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_concurrency() -> usize {
    16
}

fn default_page_size() -> usize {
    MAX_PAGE_SIZE
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_progress_interval_ms() -> u64 {
    250
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from defaults, config files and the environment.
    ///
    /// `explicit` names a file that must exist; the standard locations are
    /// optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/set-metadata").required(false))
            .add_source(config::File::with_name("/etc/set-metadata/config").required(false));

        if let Some(path) = explicit {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        // SET_METADATA__RUN__CONCURRENCY -> run.concurrency
        let config = builder
            .add_source(
                config::Environment::with_prefix("SET_METADATA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Check value ranges the deserializer cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "run.concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.run.page_size == 0 || self.run.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::InvalidValue {
                key: "run.page_size".to_string(),
                message: format!("must be between 1 and {}", MAX_PAGE_SIZE),
            });
        }

        if self.run.progress_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "run.progress_interval_ms".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Get progress refresh interval as Duration
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.run.progress_interval_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_port: None,
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            page_size: default_page_size(),
            checkpoint_dir: default_checkpoint_dir(),
            grace: GracePolicy::default(),
            progress_interval_ms: default_progress_interval_ms(),
            skip_unchanged: default_true(),
        }
    }
}
