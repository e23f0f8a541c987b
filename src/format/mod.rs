//! Per-format capabilities
//!
//! Everything the engine and the browse index need to know about a package
//! format sits behind [`Format`]: how paths split into browse segments,
//! which paths are metadata, how upstream payloads are rewritten before
//! storage, and how package roots map onto metadata documents. Formats are
//! looked up by name in a [`FormatRegistry`] built at startup.

pub mod npm;
pub mod raw;

pub use npm::NpmFormat;
pub use raw::RawFormat;

use crate::error::{DepotError, DepotResult};
use crate::store::metadata::{DocumentKey, MetadataDocument};
use crate::store::model::normalize_path;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// Which lifetime applies to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    /// Immutable content such as tarballs
    Content,
    /// Indexes and package roots that change as versions are published
    Metadata,
}

impl AssetKind {
    pub fn is_metadata(&self) -> bool {
        matches!(self, Self::Metadata)
    }
}

/// One segment of a browse chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowsePath {
    /// Segment shown to users
    pub name: String,
    /// Client-visible path that resolves to this segment, if any
    pub request_path: Option<String>,
}

impl BrowsePath {
    pub fn new(name: impl Into<String>, request_path: Option<String>) -> Self {
        Self {
            name: name.into(),
            request_path,
        }
    }
}

/// Component a path belongs to, with its browse chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentPath {
    /// Stable component identifier, e.g. `@scope/name@1.0.0`
    pub id: String,
    pub segments: Vec<BrowsePath>,
}

/// Inputs to payload transforms that depend on deployment, not content
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformContext {
    pub repository: String,
    /// Externally visible base URL of this registry
    pub base_url: Option<String>,
}

/// Capabilities of one package format.
///
/// Every method is pure: the same inputs always yield the same output, so
/// a rebuild reproduces exactly what the request path stored.
pub trait Format: Send + Sync {
    fn name(&self) -> &'static str;

    fn asset_kind(&self, path: &str) -> AssetKind;

    /// Canonical repository path for a client path
    fn canonical_path(&self, path: &str) -> String {
        normalize_path(path)
    }

    /// Path to request from the remote for a repository path
    fn upstream_path(&self, path: &str) -> String {
        path.to_string()
    }

    /// Browse chain of the asset stored at `path`, root first
    fn browse_paths(&self, path: &str) -> Vec<BrowsePath> {
        split_segments(path)
    }

    /// Component chain for `path`, when the path belongs to a component
    fn component_path(&self, _path: &str) -> Option<ComponentPath> {
        None
    }

    /// Content type used when upstream does not send one
    fn content_type(&self, path: &str) -> &'static str;

    /// Rewrite an upstream payload before it is stored
    fn transform_payload(
        &self,
        _path: &str,
        payload: Bytes,
        _context: &TransformContext,
    ) -> DepotResult<Bytes> {
        Ok(payload)
    }

    /// Metadata document described by a stored payload, if any
    fn metadata_document(
        &self,
        _key: &DocumentKey,
        _path: &str,
        _payload: &[u8],
    ) -> DepotResult<Option<MetadataDocument>> {
        Ok(None)
    }

    /// Package-root key for a path, if the path is a package root
    fn document_key(&self, _repository: &str, _path: &str) -> Option<DocumentKey> {
        None
    }

    /// Serialize a merged metadata document back into the stored payload
    fn render_document(&self, _document: &MetadataDocument) -> DepotResult<Option<Bytes>> {
        Ok(None)
    }
}

/// Split a `/`-separated path into browse segments with cumulative
/// request paths
pub fn split_segments(path: &str) -> Vec<BrowsePath> {
    let mut prefix = String::new();
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            BrowsePath::new(segment, Some(prefix.clone()))
        })
        .collect()
}

/// Formats keyed by name
#[derive(Clone)]
pub struct FormatRegistry {
    formats: HashMap<&'static str, Arc<dyn Format>>,
}

impl FormatRegistry {
    pub fn empty() -> Self {
        Self {
            formats: HashMap::new(),
        }
    }

    pub fn register(&mut self, format: Arc<dyn Format>) {
        self.formats.insert(format.name(), format);
    }

    pub fn get(&self, name: &str) -> DepotResult<Arc<dyn Format>> {
        self.formats
            .get(name)
            .cloned()
            .ok_or_else(|| DepotError::UnknownFormat(name.to_string()))
    }

    /// Registered format names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.formats.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(RawFormat));
        registry.register(Arc::new(NpmFormat));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_builds_cumulative_request_paths() {
        let segments = split_segments("/a/b/c.jar");
        let names: Vec<_> = segments.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c.jar"]);
        assert_eq!(segments[2].request_path.as_deref(), Some("a/b/c.jar"));
        assert_eq!(segments[0].request_path.as_deref(), Some("a"));
    }

    #[test]
    fn split_ignores_empty_segments() {
        assert_eq!(split_segments("a//b/").len(), 2);
        assert!(split_segments("").is_empty());
    }

    #[test]
    fn canonical_paths_collapse_slashes() {
        let registry = FormatRegistry::default();
        let raw = registry.get("raw").unwrap();
        assert_eq!(raw.canonical_path("/a//b/"), "a/b");
        let npm = registry.get("npm").unwrap();
        assert_eq!(npm.canonical_path("/@acme%2fwidget/"), "@acme/widget");
    }

    #[test]
    fn registry_defaults() {
        let registry = FormatRegistry::default();
        assert_eq!(registry.names(), ["npm", "raw"]);
        assert_eq!(registry.get("npm").unwrap().name(), "npm");
        assert!(matches!(
            registry.get("cocoapods"),
            Err(DepotError::UnknownFormat(_))
        ));
    }
}
