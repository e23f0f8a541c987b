//! Records owned by the content store

use crate::store::blob::BlobRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Logical identity of a cached item: `(repository, path)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub repository: String,
    /// Repository-relative path, without a leading slash
    pub path: String,
}

impl ArtifactKey {
    pub fn new(repository: impl Into<String>, path: &str) -> Self {
        Self {
            repository: repository.into(),
            path: normalize_path(path),
        }
    }
}

/// Collapse a client path to its canonical form: no leading, trailing or
/// repeated `/`, and no `.` segments
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repository, self.path)
    }
}

/// Upstream validators used for conditional fetches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    /// Opaque entity tag, quotes included
    pub etag: Option<String>,
    /// Raw `Last-Modified` header value
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn etag(value: impl Into<String>) -> Self {
        Self {
            etag: Some(value.into()),
            last_modified: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }

    /// Combine with validators from a newer response; newer values win
    pub fn refreshed(&self, newer: &Validators) -> Validators {
        Validators {
            etag: newer.etag.clone().or_else(|| self.etag.clone()),
            last_modified: newer
                .last_modified
                .clone()
                .or_else(|| self.last_modified.clone()),
        }
    }
}

/// Cache bookkeeping for one resolved key, positive or negative
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fetched_at: DateTime<Utc>,
    pub validators: Validators,
    pub expires_at: DateTime<Utc>,
    pub is_negative: bool,
}

impl CacheEntry {
    pub fn positive(
        fetched_at: DateTime<Utc>,
        validators: Validators,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            fetched_at,
            validators,
            expires_at,
            is_negative: false,
        }
    }

    pub fn negative(
        fetched_at: DateTime<Utc>,
        validators: Validators,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            fetched_at,
            validators,
            expires_at,
            is_negative: true,
        }
    }
}

/// Persisted payload description; bytes live in the blob store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub key: ArtifactKey,
    pub size_bytes: u64,
    /// Hex SHA-256 of the stored bytes
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub blob_ref: BlobRef,
    pub content_type: String,
    /// Incremented every time a new payload replaces the previous one
    pub generation: u64,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// One row per artifact key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub key: ArtifactKey,
    /// Absent for negative entries
    pub artifact: Option<StoredArtifact>,
    pub entry: CacheEntry,
}

impl ArtifactRecord {
    /// Positive record whose payload can be served
    pub fn stored(&self) -> Option<&StoredArtifact> {
        if self.entry.is_negative {
            None
        } else {
            self.artifact.as_ref()
        }
    }
}

/// Attributes of a new payload generation
#[derive(Debug, Clone, Default)]
pub struct NewArtifact {
    pub content_type: String,
    pub validators: Validators,
    pub expires_at: DateTime<Utc>,
    pub attributes: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_collapse_equivalent_spellings() {
        let canonical = ArtifactKey::new("r1", "a/b");
        for spelling in ["a//b", "a/b/", "/a/./b", "//a///b//"] {
            assert_eq!(ArtifactKey::new("r1", spelling), canonical, "{spelling}");
        }
        assert_eq!(normalize_path(""), "");
        assert_eq!(normalize_path("///"), "");
    }

    #[test]
    fn key_strips_leading_slash() {
        let key = ArtifactKey::new("r1", "/pkg/a");
        assert_eq!(key.path, "pkg/a");
        assert_eq!(key.to_string(), "r1/pkg/a");
        assert_eq!(key, ArtifactKey::new("r1", "pkg/a"));
    }

    #[test]
    fn refreshed_validators_prefer_newer() {
        let old = Validators {
            etag: Some("\"v1\"".to_string()),
            last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
        };
        let newer = Validators::etag("\"v2\"");
        let merged = old.refreshed(&newer);
        assert_eq!(merged.etag.as_deref(), Some("\"v2\""));
        assert_eq!(
            merged.last_modified.as_deref(),
            Some("Mon, 01 Jan 2024 00:00:00 GMT")
        );
    }

    #[test]
    fn negative_record_is_not_stored() {
        let now = Utc::now();
        let record = ArtifactRecord {
            key: ArtifactKey::new("r1", "missing"),
            artifact: None,
            entry: CacheEntry::negative(now, Validators::default(), now),
        };
        assert!(record.stored().is_none());
    }
}
