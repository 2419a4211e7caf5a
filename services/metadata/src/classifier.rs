//! Metadata update requests and their classification.
//!
//! A request is the flat list of `KEY=VALUE` pairs supplied on the command
//! line. Before any merge it is split into the fields the object store treats
//! specially (content type, cache control, ...) and free-form user fields.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors raised while parsing `KEY=VALUE` entries
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid metadata entry '{0}': expected KEY=VALUE")]
    MissingSeparator(String),

    #[error("Invalid metadata entry '{0}': key is empty")]
    EmptyKey(String),
}

/// Metadata fields the object store recognizes and stores outside the
/// user-defined namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SystemField {
    CacheControl,
    ContentDisposition,
    ContentEncoding,
    ContentLanguage,
    ContentType,
    Expires,
    WebsiteRedirectLocation,
}

impl SystemField {
    pub const ALL: [SystemField; 7] = [
        SystemField::CacheControl,
        SystemField::ContentDisposition,
        SystemField::ContentEncoding,
        SystemField::ContentLanguage,
        SystemField::ContentType,
        SystemField::Expires,
        SystemField::WebsiteRedirectLocation,
    ];

    /// Canonical, case-sensitive name used when talking to the store
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemField::CacheControl => "CacheControl",
            SystemField::ContentDisposition => "ContentDisposition",
            SystemField::ContentEncoding => "ContentEncoding",
            SystemField::ContentLanguage => "ContentLanguage",
            SystemField::ContentType => "ContentType",
            SystemField::Expires => "Expires",
            SystemField::WebsiteRedirectLocation => "WebsiteRedirectLocation",
        }
    }

    /// Resolve a caller-supplied field name to a system field, if it is one.
    ///
    /// Matching ignores surrounding whitespace, hyphens and case, so
    /// `Cache-Control`, `cache-control` and `cachecontrol` all resolve to
    /// [`SystemField::CacheControl`].
    pub fn from_name(name: &str) -> Option<Self> {
        match normalize_name(name).as_str() {
            "cachecontrol" => Some(SystemField::CacheControl),
            "contentdisposition" => Some(SystemField::ContentDisposition),
            "contentencoding" => Some(SystemField::ContentEncoding),
            "contentlanguage" => Some(SystemField::ContentLanguage),
            "contenttype" => Some(SystemField::ContentType),
            "expires" => Some(SystemField::Expires),
            "websiteredirectlocation" | "xamzwebsiteredirectlocation" => {
                Some(SystemField::WebsiteRedirectLocation)
            }
            _ => None,
        }
    }
}

impl fmt::Display for SystemField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercase, hyphen-free form of a field name used for system field lookup
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .chars()
        .filter(|c| *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// The caller's requested metadata changes, in argument order.
///
/// Keys are unique; a repeated key keeps the value supplied last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataUpdateRequest {
    fields: Vec<(String, String)>,
}

impl MetadataUpdateRequest {
    /// Parse `KEY=VALUE` entries. The entry is split on the first `=`, so
    /// values may themselves contain `=` (`CacheControl=max-age=3600`).
    pub fn parse<I, S>(entries: I) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut request = Self::default();

        for entry in entries {
            let entry = entry.as_ref();
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| ParseError::MissingSeparator(entry.to_string()))?;

            let key = key.trim();
            if key.is_empty() {
                return Err(ParseError::EmptyKey(entry.to_string()));
            }

            request.insert(key, value);
        }

        Ok(request)
    }

    fn insert(&mut self, key: &str, value: &str) {
        self.fields.retain(|(existing, _)| existing != key);
        self.fields.push((key.to_string(), value.to_string()));
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A request split into store-recognized and user-defined fields.
///
/// Every requested field lands in exactly one of the two maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifiedMetadata {
    pub system: BTreeMap<SystemField, String>,
    pub user: BTreeMap<String, String>,
}

impl ClassifiedMetadata {
    pub fn len(&self) -> usize {
        self.system.len() + self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.system.is_empty() && self.user.is_empty()
    }
}

/// Split a request into system and user fields.
///
/// Fields are applied in request order, so when two spellings resolve to the
/// same system field, or two user names differ only in case, the later one
/// wins.
pub fn classify(request: &MetadataUpdateRequest) -> ClassifiedMetadata {
    let mut classified = ClassifiedMetadata::default();

    for (name, value) in request.fields() {
        match SystemField::from_name(name) {
            Some(field) => {
                classified.system.insert(field, value.to_string());
            }
            None => {
                // Stores fold user names, so `team` and `Team` are one field
                let name = name.trim();
                classified
                    .user
                    .retain(|existing, _| !existing.eq_ignore_ascii_case(name));
                classified.user.insert(name.to_string(), value.to_string());
            }
        }
    }

    classified
}
