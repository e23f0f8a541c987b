//! Request-scoped context
//!
//! Carries the caller identity used for audit logging and the cancellation
//! signal honoured by the proxy engine. Passed explicitly through every call
//! rather than kept in task-local state.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Context for a single client request or administrative task
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: Uuid,
    client: Option<String>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Create a context for an anonymous request
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Context for internal work (rebuilds, batch imports)
    pub fn system() -> Self {
        Self::new().with_client("system")
    }

    /// Attach the authenticated client identity
    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancel the context automatically after `timeout`
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let token = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => token.cancel(),
                _ = token.cancelled() => {}
            }
        });
        self
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Client identity, `anonymous` when unauthenticated
    pub fn client(&self) -> &str {
        self.client.as_deref().unwrap_or("anonymous")
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the context is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Cancel the request
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_by_default() {
        let ctx = RequestContext::new();
        assert_eq!(ctx.client(), "anonymous");
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn shared_cancellation() {
        let token = CancellationToken::new();
        let ctx = RequestContext::new()
            .with_client("ci-bot")
            .with_cancellation(token.clone());
        token.cancel();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.client(), "ci-bot");
    }

    #[tokio::test]
    async fn timeout_cancels() {
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(2), ctx.cancelled())
            .await
            .unwrap();
        assert!(ctx.is_cancelled());
    }
}
