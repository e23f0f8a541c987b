//! Repositories: a name bound to a format, an optional upstream and cache
//! lifetimes

use crate::cache::CacheTtls;
use crate::config::schema::RepositoryConfig;
use crate::config::Config;
use crate::error::{DepotError, DepotResult};
use crate::format::{Format, FormatRegistry};
use crate::upstream::{HttpUpstream, UpstreamClient};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A configured repository
#[derive(Clone)]
pub struct Repository {
    pub name: String,
    pub format: Arc<dyn Format>,
    /// Remote source; `None` for hosted repositories
    pub upstream: Option<Arc<dyn UpstreamClient>>,
    pub ttls: CacheTtls,
    /// Serve only what is cached, never contact upstream
    pub offline: bool,
    /// Remember confirmed upstream absence
    pub negative_cache: bool,
}

impl Repository {
    /// Repository holding only published content
    pub fn hosted(name: impl Into<String>, format: Arc<dyn Format>) -> Self {
        Self {
            name: name.into(),
            format,
            upstream: None,
            ttls: CacheTtls::default(),
            offline: false,
            negative_cache: true,
        }
    }

    /// Caching proxy in front of `upstream`
    pub fn proxy(
        name: impl Into<String>,
        format: Arc<dyn Format>,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self {
            upstream: Some(upstream),
            ..Self::hosted(name, format)
        }
    }

    pub fn with_ttls(mut self, ttls: CacheTtls) -> Self {
        self.ttls = ttls;
        self
    }

    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn with_negative_cache(mut self, enabled: bool) -> Self {
        self.negative_cache = enabled;
        self
    }

    pub fn is_proxy(&self) -> bool {
        self.upstream.is_some()
    }

    /// `proxy` or `hosted`
    pub fn kind(&self) -> &'static str {
        if self.is_proxy() {
            "proxy"
        } else {
            "hosted"
        }
    }

    pub fn remote_url(&self) -> Option<&str> {
        self.upstream.as_ref().map(|u| u.remote_url())
    }

    fn from_config(
        name: &str,
        repo: &RepositoryConfig,
        config: &Config,
        formats: &FormatRegistry,
    ) -> DepotResult<Self> {
        let format = formats.get(&repo.format)?;
        let ttls = CacheTtls::from_secs(
            repo.content_ttl_secs.unwrap_or(config.cache.content_ttl_secs),
            repo.metadata_ttl_secs.unwrap_or(config.cache.metadata_ttl_secs),
            repo.negative_ttl_secs.unwrap_or(config.cache.negative_ttl_secs),
        );

        let repository = match &repo.remote_url {
            Some(url) => {
                let upstream: Arc<dyn UpstreamClient> =
                    Arc::new(HttpUpstream::new(url.as_str(), &config.upstream));
                Self::proxy(name, format, upstream)
            }
            None => Self::hosted(name, format),
        };

        Ok(repository
            .with_ttls(ttls)
            .with_offline(repo.offline)
            .with_negative_cache(repo.negative_cache))
    }
}

/// Repositories keyed by name
#[derive(Clone, Default)]
pub struct RepositoryRegistry {
    repositories: BTreeMap<String, Arc<Repository>>,
}

impl RepositoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every repository in the configuration
    pub fn from_config(config: &Config, formats: &FormatRegistry) -> DepotResult<Self> {
        let mut registry = Self::new();
        for (name, repo) in &config.repositories {
            registry.insert(Repository::from_config(name, repo, config, formats)?);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, repository: Repository) {
        self.repositories
            .insert(repository.name.clone(), Arc::new(repository));
    }

    pub fn get(&self, name: &str) -> DepotResult<Arc<Repository>> {
        self.repositories
            .get(name)
            .cloned()
            .ok_or_else(|| DepotError::RepositoryNotFound(name.to_string()))
    }

    /// Repositories in name order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Repository>> {
        self.repositories.values()
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}
