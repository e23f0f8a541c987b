//! HTTP upstream over a blocking `ureq` agent
//!
//! Requests run on the blocking pool so the async request path never
//! stalls on socket I/O. Bodies are handed back unread and are consumed
//! on the blocking pool by whoever stores them. The whole request, body
//! included, is bounded by the configured timeout, and reading past the
//! configured payload cap fails the read.

use super::{classify_status, StatusClass, UpstreamBody, UpstreamClient, UpstreamResponse};
use crate::config::schema::UpstreamConfig;
use crate::error::{DepotError, DepotResult};
use crate::store::model::Validators;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use ureq::Agent;

/// Conditional GETs against one remote base URL
#[derive(Clone)]
pub struct HttpUpstream {
    base_url: String,
    agent: Agent,
    user_agent: String,
    max_payload: u64,
}

impl HttpUpstream {
    pub fn new(base_url: impl Into<String>, config: &UpstreamConfig) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
            .http_status_as_error(false)
            .build()
            .into();

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent,
            user_agent: config.user_agent.clone(),
            max_payload: config.max_payload_mb.saturating_mul(1024 * 1024),
        }
    }

    /// Absolute URL for a repository-relative path
    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn get(&self, url: &str, validators: Option<&Validators>) -> DepotResult<UpstreamResponse> {
        let mut request = self
            .agent
            .get(url)
            .header("User-Agent", &self.user_agent);
        if let Some(validators) = validators {
            if let Some(etag) = &validators.etag {
                request = request.header("If-None-Match", etag);
            }
            if let Some(last_modified) = &validators.last_modified {
                request = request.header("If-Modified-Since", last_modified);
            }
        }

        let response = request.call().map_err(|e| DepotError::upstream(url, e))?;
        let status = response.status().as_u16();
        debug!(url = %url, status, "Upstream responded");

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let validators = Validators {
            etag: header("etag"),
            last_modified: header("last-modified"),
        };
        let content_type = header("content-type");

        match classify_status(status) {
            StatusClass::Ok => {
                let reader = response
                    .into_body()
                    .into_with_config()
                    .limit(self.max_payload)
                    .reader();
                Ok(UpstreamResponse::Fetched {
                    body: UpstreamBody::from_reader(reader),
                    validators,
                    content_type,
                })
            }
            StatusClass::NotModified => Ok(UpstreamResponse::NotModified { validators }),
            StatusClass::NotFound => Ok(UpstreamResponse::NotFound),
            StatusClass::Unavailable => Err(DepotError::upstream(
                url,
                format!("unexpected status {}", status),
            )),
        }
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn fetch(
        &self,
        path: &str,
        validators: Option<&Validators>,
    ) -> DepotResult<UpstreamResponse> {
        let client = self.clone();
        let url = self.url_for(path);
        let validators = validators.cloned();

        tokio::task::spawn_blocking(move || client.get(&url, validators.as_ref()))
            .await
            .map_err(|e| DepotError::Internal(format!("upstream task failed: {}", e)))?
    }

    fn remote_url(&self) -> &str {
        &self.base_url
    }
}
