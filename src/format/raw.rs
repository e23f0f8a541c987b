//! Raw format: opaque files addressed by path

use super::{AssetKind, Format};

/// Files are stored as-is; every path is content
pub struct RawFormat;

impl Format for RawFormat {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn asset_kind(&self, _path: &str) -> AssetKind {
        AssetKind::Content
    }

    fn content_type(&self, path: &str) -> &'static str {
        let extension = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
        match extension.to_ascii_lowercase().as_str() {
            "json" => "application/json",
            "xml" | "pom" => "application/xml",
            "txt" | "md" => "text/plain",
            "html" | "htm" => "text/html",
            "jar" | "war" | "zip" => "application/zip",
            "tgz" | "gz" => "application/gzip",
            _ => "application/octet-stream",
        }
    }
}
