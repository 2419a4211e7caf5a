use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("Invalid location '{url}': {reason}")]
    Invalid { url: String, reason: String },

    #[error("Unsupported scheme '{scheme}' in '{url}' (expected s3://)")]
    UnsupportedScheme { url: String, scheme: String },
}

/// A bucket and key prefix given as `s3://bucket/prefix`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLocation {
    pub bucket: String,
    /// Key prefix, without a leading `/`. A trailing `/` is kept so
    /// `s3://bucket/tiles/` does not also match `tiles-old/`.
    pub prefix: String,
}

impl StoreLocation {
    /// Parse a location string
    ///
    /// Accepts formats:
    /// - s3://bucket
    /// - s3://bucket/prefix
    /// - s3://bucket/prefix/
    pub fn parse(url: &str) -> Result<Self, LocationError> {
        let url = url.trim();
        let invalid = |reason: &str| LocationError::Invalid {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| invalid("expected scheme://bucket/prefix"))?;

        if !scheme.eq_ignore_ascii_case("s3") {
            return Err(LocationError::UnsupportedScheme {
                url: url.to_string(),
                scheme: scheme.to_string(),
            });
        }

        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(invalid("missing bucket name"));
        }

        Ok(Self {
            bucket: bucket.to_string(),
            prefix: prefix.trim_start_matches('/').to_string(),
        })
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.prefix)
    }
}
