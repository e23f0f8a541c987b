//! Configuration schema for depot
//!
//! Configuration is stored at `~/.config/depot/config.toml`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Persistence backends
    pub storage: StorageConfig,

    /// Cache lifetimes
    pub cache: CacheConfig,

    /// Upstream HTTP client
    pub upstream: UpstreamConfig,

    /// Metadata document writes
    pub metadata: MetadataConfig,

    /// Browse index
    pub browse: BrowseConfig,

    /// Repositories keyed by name
    pub repositories: BTreeMap<String, RepositoryConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let mut repositories = BTreeMap::new();
        repositories.insert(
            "npmjs".to_string(),
            RepositoryConfig {
                format: "npm".to_string(),
                remote_url: Some("https://registry.npmjs.org".to_string()),
                ..RepositoryConfig::default()
            },
        );

        Self {
            general: GeneralConfig::default(),
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            upstream: UpstreamConfig::default(),
            metadata: MetadataConfig::default(),
            browse: BrowseConfig::default(),
            repositories,
        }
    }
}

impl Config {
    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), String> {
        if self.browse.page_size == 0 {
            return Err("browse.page_size must be at least 1".to_string());
        }
        if self.browse.workers == 0 {
            return Err("browse.workers must be at least 1".to_string());
        }
        if self.metadata.max_attempts == 0 {
            return Err("metadata.max_attempts must be at least 1".to_string());
        }

        for (name, repo) in &self.repositories {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
            if !valid {
                return Err(format!(
                    "repository name '{}' may only contain letters, digits, '.', '_' and '-'",
                    name
                ));
            }
            // Names become directory names under the storage root
            if name.starts_with('.') {
                return Err(format!("repository name '{}' may not start with '.'", name));
            }
            if !matches!(repo.format.as_str(), "raw" | "npm") {
                return Err(format!(
                    "repository '{}' has unknown format '{}'",
                    name, repo.format
                ));
            }
        }

        Ok(())
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,

    /// Externally visible base URL, used to rewrite upstream links
    pub base_url: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
            base_url: None,
        }
    }
}

/// Which persistence backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// JSON records and blob files on local disk
    File,
    /// Process memory, lost on exit
    Memory,
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind
    pub backend: StorageBackend,

    /// Root directory (defaults to the state directory)
    pub root: Option<PathBuf>,

    /// Keep serving from upstream when the local store fails
    pub tolerate_outage: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            root: None,
            tolerate_outage: false,
        }
    }
}

/// Cache lifetimes, overridable per repository
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Max age of cached content (tarballs, jars)
    pub content_ttl_secs: u64,

    /// Max age of cached metadata (package roots, indexes)
    pub metadata_ttl_secs: u64,

    /// How long a confirmed upstream 404 is remembered
    pub negative_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            content_ttl_secs: 24 * 60 * 60,
            metadata_ttl_secs: 30 * 60,
            negative_ttl_secs: 60 * 60,
        }
    }
}

/// Upstream HTTP client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Whole-request timeout in seconds
    pub timeout_secs: u64,

    /// Largest payload accepted from upstream, in MB
    pub max_payload_mb: u64,

    /// User-Agent header sent upstream
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_payload_mb: 512,
            user_agent: format!("depot/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Metadata document write settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Read-merge-write attempts before giving up on a conflicting document
    pub max_attempts: u32,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Browse index settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowseConfig {
    /// Artifacts per page during rebuild
    pub page_size: usize,

    /// Index update workers
    pub workers: usize,

    /// Pending store events before publishers back off
    pub queue_capacity: usize,
}

impl Default for BrowseConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

/// A single repository
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Package format (raw, npm)
    pub format: String,

    /// Upstream base URL; hosted repository when absent
    pub remote_url: Option<String>,

    /// Never contact upstream, serve whatever is cached
    pub offline: bool,

    /// Remember upstream 404s
    pub negative_cache: bool,

    /// Override of cache.content_ttl_secs
    pub content_ttl_secs: Option<u64>,

    /// Override of cache.metadata_ttl_secs
    pub metadata_ttl_secs: Option<u64>,

    /// Override of cache.negative_ttl_secs
    pub negative_ttl_secs: Option<u64>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            format: "raw".to_string(),
            remote_url: None,
            offline: false,
            negative_cache: true,
            content_ttl_secs: None,
            metadata_ttl_secs: None,
            negative_ttl_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[repositories.npmjs]"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.metadata.max_attempts, 3);
        assert_eq!(config.browse.page_size, 1000);
        assert!(config.repositories.contains_key("npmjs"));
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [cache]
            negative_ttl_secs = 60

            [repositories.central]
            remote_url = "https://repo1.maven.org/maven2"
            content_ttl_secs = 10
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.cache.negative_ttl_secs, 60);
        assert_eq!(config.cache.content_ttl_secs, 86400); // default preserved
        let central = &config.repositories["central"];
        assert_eq!(central.format, "raw");
        assert!(central.negative_cache);
        assert_eq!(central.content_ttl_secs, Some(10));
    }

    #[test]
    fn validate_rejects_bad_names() {
        let mut config = Config::default();
        config
            .repositories
            .insert("../etc".to_string(), RepositoryConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_dot_names() {
        for name in [".", "..", ".hidden"] {
            let mut config = Config::default();
            config
                .repositories
                .insert(name.to_string(), RepositoryConfig::default());
            let err = config.validate().unwrap_err();
            assert!(err.contains("may not start with '.'"), "{}", name);
        }

        let mut config = Config::default();
        config
            .repositories
            .insert("maven.central".to_string(), RepositoryConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_format() {
        let mut config = Config::default();
        config.repositories.insert(
            "pods".to_string(),
            RepositoryConfig {
                format: "cocoapods".to_string(),
                ..RepositoryConfig::default()
            },
        );
        let err = config.validate().unwrap_err();
        assert!(err.contains("cocoapods"));
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let mut config = Config::default();
        config.metadata.max_attempts = 0;
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }
}
