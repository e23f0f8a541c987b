//! npm format
//!
//! Package roots live at `name` or `@scope/name` and hold the JSON
//! document listing every version. Tarballs live at
//! `name/-/name-1.0.0.tgz`. Roots are mirrored into a metadata document so
//! that versions published from different sources accumulate.

use super::{split_segments, AssetKind, BrowsePath, ComponentPath, Format, TransformContext};
use crate::error::{DepotError, DepotResult};
use crate::store::metadata::{DocumentKey, MetadataDocument};
use crate::store::model::normalize_path;
use bytes::Bytes;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// npm registry format
pub struct NpmFormat;

/// A path split into package coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
struct NpmPath<'a> {
    scope: Option<&'a str>,
    name: &'a str,
    /// Tarball file name, for `/-/` paths
    tarball: Option<&'a str>,
}

impl<'a> NpmPath<'a> {
    fn parse(path: &'a str) -> Option<Self> {
        let (package, tarball) = match path.split_once("/-/") {
            Some((package, file)) if !file.is_empty() && !file.contains('/') => {
                (package, Some(file))
            }
            Some(_) => return None,
            None => (path, None),
        };

        let (scope, name) = match package.split_once('/') {
            Some((scope, name)) if scope.starts_with('@') && scope.len() > 1 => {
                (Some(scope), name)
            }
            Some(_) => return None,
            None if package.starts_with('@') => return None,
            None => (None, package),
        };
        if name.is_empty() || name.contains('/') || name.starts_with('-') {
            return None;
        }

        Some(Self {
            scope,
            name,
            tarball,
        })
    }

    fn package(&self) -> String {
        match self.scope {
            Some(scope) => format!("{}/{}", scope, self.name),
            None => self.name.to_string(),
        }
    }

    /// Version encoded in a tarball name: `name-1.2.3.tgz` -> `1.2.3`
    fn version(&self) -> Option<&'a str> {
        self.tarball?
            .strip_suffix(".tgz")?
            .strip_prefix(self.name)?
            .strip_prefix('-')
            .filter(|v| !v.is_empty())
    }

    fn is_root(&self) -> bool {
        self.tarball.is_none()
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

impl Format for NpmFormat {
    fn name(&self) -> &'static str {
        "npm"
    }

    fn asset_kind(&self, path: &str) -> AssetKind {
        match NpmPath::parse(path) {
            Some(p) if !p.is_root() => AssetKind::Content,
            _ => AssetKind::Metadata,
        }
    }

    fn canonical_path(&self, path: &str) -> String {
        normalize_path(&path.replace("%2f", "/").replace("%2F", "/"))
    }

    fn upstream_path(&self, path: &str) -> String {
        match NpmPath::parse(path) {
            Some(NpmPath {
                scope: Some(scope),
                name,
                tarball: None,
            }) => format!("{}%2f{}", scope, name),
            _ => path.to_string(),
        }
    }

    fn browse_paths(&self, path: &str) -> Vec<BrowsePath> {
        split_segments(path)
    }

    fn component_path(&self, path: &str) -> Option<ComponentPath> {
        let parsed = NpmPath::parse(path)?;
        let version = parsed.version()?;

        let mut segments = vec![];
        if let Some(scope) = parsed.scope {
            segments.push(BrowsePath::new(scope, Some(scope.to_string())));
        }
        segments.push(BrowsePath::new(parsed.name, Some(parsed.package())));
        segments.push(BrowsePath::new(version, None));

        Some(ComponentPath {
            id: format!("{}@{}", parsed.package(), version),
            segments,
        })
    }

    fn content_type(&self, path: &str) -> &'static str {
        match self.asset_kind(path) {
            AssetKind::Content => "application/x-tgz",
            AssetKind::Metadata => "application/json",
        }
    }

    /// Point every version's tarball URL back at this registry.
    ///
    /// Only package roots are touched, and only when a base URL is
    /// configured. Roots must be JSON objects.
    fn transform_payload(
        &self,
        path: &str,
        payload: Bytes,
        context: &TransformContext,
    ) -> DepotResult<Bytes> {
        let Some(parsed) = NpmPath::parse(path).filter(NpmPath::is_root) else {
            return Ok(payload);
        };

        let mut root: Value = serde_json::from_slice(&payload)
            .map_err(|e| DepotError::invalid_upstream(path, e))?;
        if !root.is_object() {
            return Err(DepotError::invalid_upstream(
                path,
                "package root is not a JSON object",
            ));
        }

        let Some(base_url) = context.base_url.as_deref() else {
            return Ok(payload);
        };
        let prefix = format!(
            "{}/repository/{}/{}/-/",
            base_url.trim_end_matches('/'),
            context.repository,
            parsed.package()
        );

        if let Some(versions) = root.get_mut("versions").and_then(Value::as_object_mut) {
            for manifest in versions.values_mut() {
                let Some(tarball) = manifest.pointer_mut("/dist/tarball") else {
                    continue;
                };
                let file = tarball
                    .as_str()
                    .and_then(|url| url.rsplit('/').next())
                    .map(str::to_string);
                if let Some(file) = file {
                    *tarball = Value::String(format!("{}{}", prefix, file));
                }
            }
        }

        Ok(Bytes::from(serde_json::to_vec(&root)?))
    }

    fn document_key(&self, repository: &str, path: &str) -> Option<DocumentKey> {
        let parsed = NpmPath::parse(path).filter(NpmPath::is_root)?;
        Some(DocumentKey::new(repository, parsed.package()))
    }

    fn metadata_document(
        &self,
        key: &DocumentKey,
        path: &str,
        payload: &[u8],
    ) -> DepotResult<Option<MetadataDocument>> {
        if NpmPath::parse(path).filter(NpmPath::is_root).is_none() {
            return Ok(None);
        }

        let root: Value =
            serde_json::from_slice(payload).map_err(|e| DepotError::invalid_upstream(path, e))?;

        let mut document = MetadataDocument::empty(key);
        document.description = root
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);
        document.keywords = root
            .get("keywords")
            .and_then(Value::as_array)
            .map(|k| {
                k.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        document.dist_tags = string_map(root.get("dist-tags"));
        document.time = string_map(root.get("time"));
        document.versions = root
            .get("versions")
            .and_then(Value::as_object)
            .map(|v| v.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        Ok(Some(document))
    }

    fn render_document(&self, document: &MetadataDocument) -> DepotResult<Option<Bytes>> {
        let mut root = Map::new();
        root.insert("name".to_string(), json!(document.name));
        if let Some(description) = &document.description {
            root.insert("description".to_string(), json!(description));
        }
        if !document.keywords.is_empty() {
            root.insert("keywords".to_string(), json!(document.keywords));
        }
        root.insert("dist-tags".to_string(), json!(document.dist_tags));
        root.insert("versions".to_string(), json!(document.versions));
        root.insert("time".to_string(), json!(document.time));

        Ok(Some(Bytes::from(serde_json::to_vec(&Value::Object(root))?)))
    }
}
