//! Proxy-cache engine
//!
//! One fetch walks a small state machine:
//!
//! | State | Next |
//! |-------|------|
//! | CHECK_CACHE | SERVE_CACHED when fresh, FAIL when fresh-negative, else FETCH_UPSTREAM |
//! | FETCH_UPSTREAM | STORE on 200, NEGATIVE_STORE on 404, SERVE_CACHED on 304 or stale-while-error |
//! | STORE | SERVE_FETCHED |
//! | NEGATIVE_STORE | FAIL |
//!
//! Store events are handed to the browse index queue after every committed
//! write; responses never wait for the index.
//!
//! Content payloads are never held in memory whole: the upstream body is
//! copied into the blob store as it arrives and the response reads back
//! from the stored blob. Only metadata, which formats rewrite, is buffered.

use crate::audit::AuditLog;
use crate::browse::{StoreEvent, StoreEventPublisher};
use crate::cache::{classify, Freshness};
use crate::config::Config;
use crate::context::RequestContext;
use crate::error::{DepotError, DepotResult};
use crate::format::{FormatRegistry, TransformContext};
use crate::repository::{Repository, RepositoryRegistry};
use crate::store::model::{ArtifactKey, ArtifactRecord, NewArtifact, StoredArtifact, Validators};
use crate::store::{BlobReader, ContentStore, Invalidation};
use crate::upstream::{UpstreamBody, UpstreamClient, UpstreamResponse};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// States of a single fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    CheckCache,
    FetchUpstream,
    Store,
    NegativeStore,
    ServeCached,
    ServeFetched,
    Fail,
}

impl fmt::Display for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CheckCache => "CHECK_CACHE",
            Self::FetchUpstream => "FETCH_UPSTREAM",
            Self::Store => "STORE",
            Self::NegativeStore => "NEGATIVE_STORE",
            Self::ServeCached => "SERVE_CACHED",
            Self::ServeFetched => "SERVE_FETCHED",
            Self::Fail => "FAIL",
        };
        write!(f, "{}", name)
    }
}

/// How a successful fetch was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    /// Served from the store without contacting upstream
    Cached,
    /// Fetched from upstream and stored
    Fetched,
    /// Upstream confirmed the cached copy is current
    Revalidated,
    /// Upstream failed; a stale cached copy was served
    StaleWhileError,
    /// Served from upstream while the store was unavailable
    Uncached,
}

impl fmt::Display for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cached => "cached",
            Self::Fetched => "fetched",
            Self::Revalidated => "revalidated",
            Self::StaleWhileError => "stale_while_error",
            Self::Uncached => "uncached",
        };
        write!(f, "{}", name)
    }
}

enum Body {
    Buffered(Bytes),
    Stream(BlobReader),
}

/// Payload returned to the caller
pub struct FetchedContent {
    body: Body,
    pub content_type: String,
    pub outcome: FetchOutcome,
    /// Stored artifact backing the payload; `None` when served uncached
    pub artifact: Option<StoredArtifact>,
}

impl FetchedContent {
    /// Payload size, when known without reading the payload
    pub fn size(&self) -> Option<u64> {
        match &self.body {
            Body::Buffered(bytes) => Some(bytes.len() as u64),
            Body::Stream(_) => self.artifact.as_ref().map(|a| a.size_bytes),
        }
    }

    /// Payload as a blocking reader
    pub fn into_reader(self) -> BlobReader {
        match self.body {
            Body::Buffered(bytes) => Box::new(io::Cursor::new(bytes)),
            Body::Stream(reader) => reader,
        }
    }

    /// Read the whole payload into memory
    pub async fn into_bytes(self) -> DepotResult<Bytes> {
        let reader = match self.body {
            Body::Buffered(bytes) => return Ok(bytes),
            Body::Stream(reader) => reader,
        };
        UpstreamBody::from_reader(reader)
            .read_all()
            .await
            .map_err(|e| DepotError::storage("reading payload", e))
    }
}

impl fmt::Debug for FetchedContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedContent")
            .field("size", &self.size())
            .field("content_type", &self.content_type)
            .field("outcome", &self.outcome)
            .field("artifact", &self.artifact)
            .finish()
    }
}

/// Reader that remembers whether the remote side failed, so a failed copy
/// can be blamed on the upstream rather than the blob store
struct SourceReader {
    inner: BlobReader,
    failed: Arc<AtomicBool>,
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).inspect_err(|_| {
            self.failed.store(true, Ordering::SeqCst);
        })
    }
}

/// A 200 response on its way into the store
struct Fetched<'a> {
    body: UpstreamBody,
    validators: Validators,
    content_type: Option<String>,
    /// Remote base URL, for errors
    source: &'a str,
}

fn enter(key: &ArtifactKey, state: FetchState) {
    debug!(repository = %key.repository, path = %key.path, state = %state, "Fetch state");
}

/// Orchestrates cache policy, upstream fetches, storage and index events
pub struct ProxyEngine {
    store: Arc<ContentStore>,
    repositories: RepositoryRegistry,
    events: Option<StoreEventPublisher>,
    audit: Arc<AuditLog>,
    base_url: Option<String>,
    tolerate_store_outage: bool,
}

impl ProxyEngine {
    pub fn new(store: Arc<ContentStore>, repositories: RepositoryRegistry) -> Self {
        Self {
            store,
            repositories,
            events: None,
            audit: Arc::new(AuditLog::disabled()),
            base_url: None,
            tolerate_store_outage: false,
        }
    }

    /// Engine wired from configuration: storage backend, repositories,
    /// audit log and public base URL
    pub fn from_config(config: &Config) -> DepotResult<Self> {
        let store = Arc::new(ContentStore::from_config(config));
        let repositories = RepositoryRegistry::from_config(config, &FormatRegistry::default())?;

        Ok(Self::new(store, repositories)
            .with_audit(Arc::new(AuditLog::new(config)))
            .with_base_url(config.general.base_url.clone())
            .with_store_outage_tolerance(config.storage.tolerate_outage))
    }

    /// Publish store events to the browse index queue
    pub fn with_events(mut self, events: StoreEventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    /// Externally visible base URL used by payload transforms
    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }

    /// Serve from upstream without caching when the store fails
    pub fn with_store_outage_tolerance(mut self, tolerate: bool) -> Self {
        self.tolerate_store_outage = tolerate;
        self
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn repositories(&self) -> &RepositoryRegistry {
        &self.repositories
    }

    /// Resolve `path` in `repository`, from cache or upstream
    pub async fn fetch(
        &self,
        repository: &str,
        path: &str,
        ctx: &RequestContext,
    ) -> DepotResult<FetchedContent> {
        let result = match self.repositories.get(repository) {
            Ok(repo) => {
                let key = ArtifactKey::new(repository, &repo.format.canonical_path(path));
                self.fetch_key(&repo, &key, ctx).await
            }
            Err(e) => Err(e),
        };

        let data = match &result {
            Ok(content) => serde_json::json!({
                "repository": repository,
                "path": path,
                "outcome": content.outcome,
                "size": content.size(),
            }),
            Err(e) => serde_json::json!({
                "repository": repository,
                "path": path,
                "status": e.http_status(),
                "error": e.to_string(),
            }),
        };
        self.audit.log("proxy.fetch", ctx, &data).await;

        result
    }

    async fn fetch_key(
        &self,
        repo: &Repository,
        key: &ArtifactKey,
        ctx: &RequestContext,
    ) -> DepotResult<FetchedContent> {
        if ctx.is_cancelled() {
            return Err(DepotError::Cancelled(key.to_string()));
        }

        enter(key, FetchState::CheckCache);
        let record = match self.store.get(key).await {
            Ok(record) => record,
            Err(e) if self.tolerates(&e) => {
                warn!(key = %key, error = %e, "Content store unavailable, bypassing cache");
                return self.fetch_uncached(repo, key, ctx, e).await;
            }
            Err(e) => return Err(e),
        };

        let now = Utc::now();
        let freshness = classify(record.as_ref().map(|r| &r.entry), now);
        let had_artifact = record.as_ref().is_some_and(|r| r.stored().is_some());
        let mut cached = record.as_ref().and_then(ArtifactRecord::stored);
        debug!(key = %key, freshness = %freshness, "Classified cache entry");

        match freshness {
            Freshness::Fresh => {
                if let Some(content) = self.load_cached(cached, FetchOutcome::Cached).await? {
                    enter(key, FetchState::ServeCached);
                    return Ok(content);
                }
                cached = None;
            }
            Freshness::FreshNegative => {
                enter(key, FetchState::Fail);
                return Err(DepotError::not_found(&key.repository, &key.path));
            }
            Freshness::Missing | Freshness::Stale => {}
        }

        let Some(upstream) = repo.upstream.as_ref().filter(|_| !repo.offline) else {
            // Hosted or offline: serve whatever is stored, however old
            if let Some(content) = self.load_cached(cached, FetchOutcome::Cached).await? {
                enter(key, FetchState::ServeCached);
                return Ok(content);
            }
            enter(key, FetchState::Fail);
            return Err(DepotError::not_found(&key.repository, &key.path));
        };

        let upstream_path = repo.format.upstream_path(&key.path);
        let mut validators = cached
            .and(record.as_ref())
            .map(|r| r.entry.validators.clone())
            .filter(|v| !v.is_empty());

        loop {
            enter(key, FetchState::FetchUpstream);
            let response = self
                .call_upstream(upstream.as_ref(), &upstream_path, validators.as_ref(), key, ctx)
                .await;

            match response {
                Ok(UpstreamResponse::Fetched {
                    body,
                    validators,
                    content_type,
                }) => {
                    let fetched = Fetched {
                        body,
                        validators,
                        content_type,
                        source: upstream.remote_url(),
                    };
                    return match self.store_fetched(repo, key, fetched, now, ctx).await {
                        Err(e) if e.is_upstream() => self.serve_stale(key, cached, e).await,
                        result => result,
                    };
                }
                Ok(UpstreamResponse::NotModified { validators: fresh }) => {
                    let Some(artifact) = cached else {
                        return Err(DepotError::upstream(
                            upstream.remote_url(),
                            format!("not modified for {} without a cached copy", key),
                        ));
                    };
                    let expires_at = repo
                        .ttls
                        .positive_expiry(now, repo.format.asset_kind(&key.path).is_metadata());
                    match self.store.mark_verified(key, &fresh, expires_at).await {
                        Ok(_) => {}
                        Err(e) if self.tolerates(&e) => {
                            warn!(key = %key, error = %e, "Could not record revalidation");
                        }
                        Err(e) => return Err(e),
                    }
                    if let Some(content) = self
                        .load_cached(Some(artifact), FetchOutcome::Revalidated)
                        .await?
                    {
                        enter(key, FetchState::ServeCached);
                        return Ok(content);
                    }
                    // Blob vanished under us; ask again without validators
                    cached = None;
                    validators = None;
                }
                Ok(UpstreamResponse::NotFound) => {
                    return self.store_negative(repo, key, had_artifact, now).await;
                }
                Err(e) if e.is_upstream() => return self.serve_stale(key, cached, e).await,
                Err(e) => {
                    enter(key, FetchState::Fail);
                    return Err(e);
                }
            }
        }
    }

    /// Stale copy after an upstream failure, or the failure itself
    async fn serve_stale(
        &self,
        key: &ArtifactKey,
        cached: Option<&StoredArtifact>,
        cause: DepotError,
    ) -> DepotResult<FetchedContent> {
        if let Some(content) = self
            .load_cached(cached, FetchOutcome::StaleWhileError)
            .await?
        {
            warn!(
                key = %key,
                error = %cause,
                "Upstream unavailable, serving stale content"
            );
            enter(key, FetchState::ServeCached);
            return Ok(content);
        }
        enter(key, FetchState::Fail);
        Err(cause)
    }

    /// Upstream call that gives up as soon as the request is cancelled
    async fn call_upstream(
        &self,
        upstream: &dyn UpstreamClient,
        path: &str,
        validators: Option<&Validators>,
        key: &ArtifactKey,
        ctx: &RequestContext,
    ) -> DepotResult<UpstreamResponse> {
        tokio::select! {
            _ = ctx.cancelled() => {
                debug!(key = %key, "Request cancelled during upstream fetch");
                Err(DepotError::Cancelled(key.to_string()))
            }
            response = upstream.fetch(path, validators) => response,
        }
    }

    async fn store_fetched(
        &self,
        repo: &Repository,
        key: &ArtifactKey,
        fetched: Fetched<'_>,
        now: DateTime<Utc>,
        ctx: &RequestContext,
    ) -> DepotResult<FetchedContent> {
        enter(key, FetchState::Store);
        let Fetched {
            body,
            validators,
            content_type,
            source,
        } = fetched;
        let content_type =
            content_type.unwrap_or_else(|| repo.format.content_type(&key.path).to_string());
        let kind = repo.format.asset_kind(&key.path);

        let new = NewArtifact {
            content_type: content_type.clone(),
            validators,
            expires_at: repo.ttls.positive_expiry(now, kind.is_metadata()),
            attributes: BTreeMap::from([(
                "format".to_string(),
                repo.format.name().to_string(),
            )]),
        };

        if kind.is_metadata() {
            let payload = body
                .read_all()
                .await
                .map_err(|e| DepotError::upstream(source, e))?;
            let payload = self.transform(repo, key, payload)?;
            return match self.store.put(key, payload.clone(), new).await {
                Ok(artifact) => {
                    self.publish_event(StoreEvent::stored(key.clone()));
                    self.mirror_document(repo, key, &payload).await;
                    enter(key, FetchState::ServeFetched);
                    Ok(FetchedContent {
                        body: Body::Buffered(payload),
                        content_type,
                        outcome: FetchOutcome::Fetched,
                        artifact: Some(artifact),
                    })
                }
                Err(e) if self.tolerates(&e) => {
                    warn!(key = %key, error = %e, "Could not cache upstream payload");
                    Ok(FetchedContent {
                        body: Body::Buffered(payload),
                        content_type,
                        outcome: FetchOutcome::Uncached,
                        artifact: None,
                    })
                }
                Err(e) => {
                    enter(key, FetchState::Fail);
                    Err(e)
                }
            };
        }

        let failed = Arc::new(AtomicBool::new(false));
        let reader = SourceReader {
            inner: body.into_reader(),
            failed: failed.clone(),
        };
        match self.store.put_stream(key, Box::new(reader), new).await {
            Ok(artifact) => {
                self.publish_event(StoreEvent::stored(key.clone()));
                enter(key, FetchState::ServeFetched);
                match self
                    .load_cached(Some(&artifact), FetchOutcome::Fetched)
                    .await?
                {
                    Some(content) => Ok(content),
                    None => Err(DepotError::storage(
                        format!("serving {}", key),
                        "stored blob disappeared",
                    )),
                }
            }
            Err(e) if failed.load(Ordering::SeqCst) => {
                warn!(key = %key, error = %e, "Upstream body failed mid-transfer");
                Err(DepotError::upstream(source, e))
            }
            Err(e) if self.tolerates(&e) => {
                // The body is partly consumed; ask again and pass it through
                warn!(key = %key, error = %e, "Could not cache upstream payload");
                self.fetch_uncached(repo, key, ctx, e).await
            }
            Err(e) => {
                enter(key, FetchState::Fail);
                Err(e)
            }
        }
    }

    async fn store_negative(
        &self,
        repo: &Repository,
        key: &ArtifactKey,
        had_artifact: bool,
        now: DateTime<Utc>,
    ) -> DepotResult<FetchedContent> {
        if repo.negative_cache {
            enter(key, FetchState::NegativeStore);
            let expires_at = repo.ttls.negative_expiry(now);
            match self
                .store
                .put_negative(key, Validators::default(), expires_at)
                .await
            {
                Ok(_) => {
                    if had_artifact {
                        self.publish_event(StoreEvent::deleted(key.clone()));
                    }
                }
                Err(e) if self.tolerates(&e) => {
                    warn!(key = %key, error = %e, "Could not record negative cache entry");
                }
                Err(e) => {
                    enter(key, FetchState::Fail);
                    return Err(e);
                }
            }
        }

        enter(key, FetchState::Fail);
        Err(DepotError::not_found(&key.repository, &key.path))
    }

    /// Upstream-only path used while the store is down
    async fn fetch_uncached(
        &self,
        repo: &Repository,
        key: &ArtifactKey,
        ctx: &RequestContext,
        cause: DepotError,
    ) -> DepotResult<FetchedContent> {
        let Some(upstream) = repo.upstream.as_ref().filter(|_| !repo.offline) else {
            return Err(cause);
        };

        enter(key, FetchState::FetchUpstream);
        let upstream_path = repo.format.upstream_path(&key.path);
        match self
            .call_upstream(upstream.as_ref(), &upstream_path, None, key, ctx)
            .await?
        {
            UpstreamResponse::Fetched {
                body,
                content_type,
                ..
            } => {
                let body = if repo.format.asset_kind(&key.path).is_metadata() {
                    let payload = body
                        .read_all()
                        .await
                        .map_err(|e| DepotError::upstream(upstream.remote_url(), e))?;
                    Body::Buffered(self.transform(repo, key, payload)?)
                } else {
                    Body::Stream(body.into_reader())
                };
                enter(key, FetchState::ServeFetched);
                Ok(FetchedContent {
                    body,
                    content_type: content_type
                        .unwrap_or_else(|| repo.format.content_type(&key.path).to_string()),
                    outcome: FetchOutcome::Uncached,
                    artifact: None,
                })
            }
            UpstreamResponse::NotFound => Err(DepotError::not_found(&key.repository, &key.path)),
            UpstreamResponse::NotModified { .. } => Err(DepotError::upstream(
                upstream.remote_url(),
                format!("not modified for {} without a cached copy", key),
            )),
        }
    }

    fn transform(&self, repo: &Repository, key: &ArtifactKey, payload: Bytes) -> DepotResult<Bytes> {
        let context = TransformContext {
            repository: key.repository.clone(),
            base_url: self.base_url.clone(),
        };
        repo.format
            .transform_payload(&key.path, payload, &context)
            .map_err(|e| {
                if matches!(e, DepotError::InvalidUpstreamResponse { .. }) {
                    error!(key = %key, error = %e, "Upstream payload rejected");
                }
                enter(key, FetchState::Fail);
                e
            })
    }

    /// Mirror a stored package root into its metadata document.
    ///
    /// Failures are skipped and logged; the payload is already stored.
    async fn mirror_document(&self, repo: &Repository, key: &ArtifactKey, payload: &[u8]) {
        let Some(doc_key) = repo.format.document_key(&key.repository, &key.path) else {
            return;
        };
        let document = match repo.format.metadata_document(&doc_key, &key.path, payload) {
            Ok(Some(document)) => document,
            Ok(None) => return,
            Err(e) => {
                warn!(document = %doc_key, error = %e, "Could not derive metadata document");
                return;
            }
        };

        if let Err(e) = self
            .store
            .update_metadata_document(&doc_key, false, |_| document.clone())
            .await
        {
            warn!(document = %doc_key, error = %e, "Skipping metadata document update");
        }
    }

    /// Cached payload for a positive entry; `None` when the blob is gone
    async fn load_cached(
        &self,
        artifact: Option<&StoredArtifact>,
        outcome: FetchOutcome,
    ) -> DepotResult<Option<FetchedContent>> {
        let Some(artifact) = artifact else {
            return Ok(None);
        };

        let reader = match self.store.open_payload(artifact).await {
            Ok(reader) => reader,
            Err(e) if self.tolerates(&e) => {
                warn!(key = %artifact.key, error = %e, "Could not read cached payload");
                None
            }
            Err(e) => return Err(e),
        };

        match reader {
            Some(reader) => Ok(Some(FetchedContent {
                body: Body::Stream(reader),
                content_type: artifact.content_type.clone(),
                outcome,
                artifact: Some(artifact.clone()),
            })),
            None => {
                warn!(
                    key = %artifact.key,
                    blob = %artifact.blob_ref,
                    "Stored blob is missing, treating entry as missing"
                );
                Ok(None)
            }
        }
    }

    /// Expire every cached entry of a repository
    pub async fn invalidate(
        &self,
        repository: &str,
        ctx: &RequestContext,
    ) -> DepotResult<Invalidation> {
        self.repositories.get(repository)?;
        let summary = self.store.expire_all(repository).await?;
        info!(
            repository = %repository,
            expired = summary.expired,
            dropped_negative = summary.dropped_negative,
            "Invalidated cache"
        );
        self.audit
            .log(
                "proxy.invalidate",
                ctx,
                &serde_json::json!({
                    "repository": repository,
                    "expired": summary.expired,
                    "dropped_negative": summary.dropped_negative,
                }),
            )
            .await;
        Ok(summary)
    }

    /// Remove one artifact (and the package document it roots)
    pub async fn delete(
        &self,
        repository: &str,
        path: &str,
        ctx: &RequestContext,
    ) -> DepotResult<bool> {
        let repo = self.repositories.get(repository)?;
        let key = ArtifactKey::new(repository, &repo.format.canonical_path(path));

        let removed = self.store.delete(&key).await?;
        let existed = removed.is_some();
        if removed.is_some_and(|r| r.stored().is_some()) {
            self.publish_event(StoreEvent::deleted(key.clone()));
        }
        if let Some(doc_key) = repo.format.document_key(repository, &key.path) {
            self.store.delete_metadata_document(&doc_key).await?;
        }

        self.audit
            .log(
                "proxy.delete",
                ctx,
                &serde_json::json!({ "repository": repository, "path": key.path, "existed": existed }),
            )
            .await;
        Ok(existed)
    }

    /// Upload an artifact to a hosted repository.
    ///
    /// Package roots are overlaid onto the existing metadata document and
    /// the merged document is what gets stored. A document that keeps
    /// losing the write race fails the publish with
    /// `ConcurrencyExhausted`.
    pub async fn publish(
        &self,
        repository: &str,
        path: &str,
        payload: Bytes,
        ctx: &RequestContext,
    ) -> DepotResult<StoredArtifact> {
        let repo = self.repositories.get(repository)?;
        if repo.is_proxy() {
            return Err(DepotError::ProxyReadOnly(repository.to_string()));
        }

        let key = ArtifactKey::new(repository, &repo.format.canonical_path(path));
        let now = Utc::now();
        let new = NewArtifact {
            content_type: repo.format.content_type(&key.path).to_string(),
            validators: Validators::default(),
            expires_at: repo
                .ttls
                .positive_expiry(now, repo.format.asset_kind(&key.path).is_metadata()),
            attributes: BTreeMap::from([
                ("format".to_string(), repo.format.name().to_string()),
                ("published_by".to_string(), ctx.client().to_string()),
            ]),
        };

        let document = match repo.format.document_key(repository, &key.path) {
            Some(doc_key) => repo
                .format
                .metadata_document(&doc_key, &key.path, &payload)?
                .map(|doc| (doc_key, doc)),
            None => None,
        };

        let result = match document {
            Some((doc_key, mut update)) => {
                update.touch(now);
                let format = repo.format.clone();
                self.store
                    .publish_document(&key, &doc_key, update, new, |merged| {
                        Ok(format
                            .render_document(merged)?
                            .unwrap_or_else(|| payload.clone()))
                    })
                    .await
                    .map(|(_, artifact)| artifact)
            }
            None => self.store.put(&key, payload.clone(), new).await,
        };

        let data = match &result {
            Ok(artifact) => serde_json::json!({
                "repository": repository,
                "path": key.path,
                "generation": artifact.generation,
                "size": artifact.size_bytes,
            }),
            Err(e) => serde_json::json!({
                "repository": repository,
                "path": key.path,
                "status": e.http_status(),
                "error": e.to_string(),
            }),
        };
        self.audit.log("proxy.publish", ctx, &data).await;

        let artifact = result?;
        self.publish_event(StoreEvent::stored(key));
        Ok(artifact)
    }

    fn tolerates(&self, error: &DepotError) -> bool {
        self.tolerate_store_outage && error.is_storage()
    }

    fn publish_event(&self, event: StoreEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}
