//! Error types for depot
//!
//! All modules use `DepotResult<T>` as their return type. The first group of
//! variants is the taxonomy surfaced to request routing; the rest are
//! operator-facing (configuration, local I/O, serialization).

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for depot operations
pub type DepotResult<T> = Result<T, DepotError>;

/// All errors that can occur in depot
#[derive(Error, Debug)]
pub enum DepotError {
    // Request taxonomy
    #[error("Not found: {repository}/{path}")]
    NotFound { repository: String, path: String },

    #[error("Upstream unavailable for {url}: {reason}")]
    UpstreamUnavailable { url: String, reason: String },

    #[error("Storage unavailable while {context}: {reason}")]
    StorageUnavailable { context: String, reason: String },

    #[error("Concurrent modification of {document}, gave up after {attempts} attempts")]
    ConcurrencyExhausted { document: String, attempts: u32 },

    #[error("Invalid upstream response for {path}: {reason}")]
    InvalidUpstreamResponse { path: String, reason: String },

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    // Repository errors
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Unknown repository format: {0}")]
    UnknownFormat(String),

    #[error("Repository {0} is a proxy and does not accept uploads")]
    ProxyReadOnly(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DepotError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a storage backend error with context
    pub fn storage(context: impl Into<String>, reason: impl ToString) -> Self {
        Self::StorageUnavailable {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a not-found error for a repository path
    pub fn not_found(repository: impl Into<String>, path: impl Into<String>) -> Self {
        Self::NotFound {
            repository: repository.into(),
            path: path.into(),
        }
    }

    /// Create an upstream transport error
    pub fn upstream(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::UpstreamUnavailable {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an invalid upstream payload error
    pub fn invalid_upstream(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUpstreamResponse {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error came from the local persistence layer
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }

    /// Whether the error came from the upstream transport
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable { .. })
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable { .. } | Self::StorageUnavailable { .. }
        )
    }

    /// HTTP status a routing layer should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. }
            | Self::InvalidUpstreamResponse { .. }
            | Self::RepositoryNotFound(_) => 404,
            Self::ConcurrencyExhausted { .. } => 409,
            Self::ProxyReadOnly(_) => 405,
            Self::Cancelled(_) => 499,
            Self::UpstreamUnavailable { .. } => 502,
            Self::StorageUnavailable { .. } => 503,
            _ => 500,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::RepositoryNotFound(_) => Some("Run: depot repos"),
            Self::UnknownFormat(_) => Some("Supported formats: raw, npm"),
            Self::ConfigNotFound(_) => Some("Run: depot config init"),
            Self::UpstreamUnavailable { .. } => {
                Some("Check the repository remote_url and network access")
            }
            Self::ConcurrencyExhausted { .. } => Some("Retry the publish"),
            Self::ProxyReadOnly(_) => Some("Publish to a hosted repository (no remote_url)"),
            _ => None,
        }
    }
}
