//! Multi-version metadata documents and the overlay merge
//!
//! A document aggregates every known version of one package. Overlay
//! merging unions the version maps, so two writers contributing disjoint
//! versions both survive regardless of commit order. Scalar descriptive
//! fields (description, keywords) are last-write-wins: the outcome of two
//! racing publishes depends on which generation commits last.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a metadata document: `(repository, package name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    pub repository: String,
    pub name: String,
}

impl DocumentKey {
    pub fn new(repository: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repository, self.name)
    }
}

/// One document per `(repository, package name)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub repository: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, rename = "dist-tags")]
    pub dist_tags: BTreeMap<String, String>,
    /// Version string to the format's version manifest
    #[serde(default)]
    pub versions: BTreeMap<String, serde_json::Value>,
    /// `created`, `modified` and one timestamp per version, RFC 3339
    #[serde(default)]
    pub time: BTreeMap<String, String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MetadataDocument {
    pub const LATEST: &'static str = "latest";
    pub const CREATED: &'static str = "created";
    pub const MODIFIED: &'static str = "modified";

    /// Empty document for a key
    pub fn empty(key: &DocumentKey) -> Self {
        Self {
            repository: key.repository.clone(),
            name: key.name.clone(),
            description: None,
            keywords: vec![],
            dist_tags: BTreeMap::new(),
            versions: BTreeMap::new(),
            time: BTreeMap::new(),
            attributes: BTreeMap::new(),
            updated_at: None,
        }
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(&self.repository, &self.name)
    }

    pub fn latest(&self) -> Option<&str> {
        self.dist_tags.get(Self::LATEST).map(String::as_str)
    }

    /// Merge `incoming` into this document.
    ///
    /// Versions, dist-tags, attributes and per-version times are unioned
    /// with `incoming` winning on equal keys. `latest` is the highest
    /// semver of both sides, `created` the earliest and `modified` the
    /// latest timestamp. Scalars are replaced when `incoming` sets them.
    pub fn overlay(&mut self, incoming: MetadataDocument) {
        let latest = match (self.latest(), incoming.latest()) {
            (Some(a), Some(b)) => Some(max_version(a, b).to_string()),
            (a, b) => a.or(b).map(str::to_string),
        };
        let created = pick_time(
            self.time.get(Self::CREATED),
            incoming.time.get(Self::CREATED),
            Ordering::Less,
        );
        let modified = pick_time(
            self.time.get(Self::MODIFIED),
            incoming.time.get(Self::MODIFIED),
            Ordering::Greater,
        );

        if incoming.description.is_some() {
            self.description = incoming.description;
        }
        if !incoming.keywords.is_empty() {
            self.keywords = incoming.keywords;
        }

        self.versions.extend(incoming.versions);
        self.dist_tags.extend(incoming.dist_tags);
        self.attributes.extend(incoming.attributes);
        self.time.extend(incoming.time);

        if let Some(latest) = latest {
            self.dist_tags.insert(Self::LATEST.to_string(), latest);
        }
        if let Some(created) = created {
            self.time.insert(Self::CREATED.to_string(), created);
        }
        if let Some(modified) = modified {
            self.time.insert(Self::MODIFIED.to_string(), modified);
        }
    }

    /// Record a change at `now`: sets `modified` and, on first write, `created`
    pub fn touch(&mut self, now: DateTime<Utc>) {
        let stamp = now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        self.time
            .entry(Self::CREATED.to_string())
            .or_insert_with(|| stamp.clone());
        self.time.insert(Self::MODIFIED.to_string(), stamp);
    }

    /// Point `latest` at the highest semver among the known versions
    pub fn recompute_latest(&mut self) {
        let best = self
            .versions
            .keys()
            .filter_map(|v| semver::Version::parse(v).ok())
            .filter(|v| v.pre.is_empty())
            .max();
        if let Some(best) = best {
            self.dist_tags
                .insert(Self::LATEST.to_string(), best.to_string());
        }
    }
}

/// Higher of two version strings; semver first, then lexical
fn max_version<'a>(a: &'a str, b: &'a str) -> &'a str {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(va), Ok(vb)) => {
            if vb > va {
                b
            } else {
                a
            }
        }
        (Ok(_), Err(_)) => a,
        (Err(_), Ok(_)) => b,
        (Err(_), Err(_)) => a.max(b),
    }
}

fn pick_time(a: Option<&String>, b: Option<&String>, prefer: Ordering) -> Option<String> {
    match (a, b) {
        (Some(a), Some(b)) => {
            let ordering = match (
                DateTime::parse_from_rfc3339(a),
                DateTime::parse_from_rfc3339(b),
            ) {
                (Ok(ta), Ok(tb)) => tb.cmp(&ta),
                _ => b.cmp(a),
            };
            Some(if ordering == prefer { b.clone() } else { a.clone() })
        }
        (a, b) => a.or(b).cloned(),
    }
}
