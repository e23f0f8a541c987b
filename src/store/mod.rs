//! Content store: artifacts, cache entries and metadata documents
//!
//! Artifact rows and metadata documents live in a [`RecordStore`] that
//! supports conditional writes; payload bytes live in a [`BlobStore`] and
//! are only referenced by handle. Writes for one artifact key or one
//! document key are serialized in-process, and the record store's
//! compare-and-swap catches writers in other processes.
//!
//! Blobs that no row references any more are recorded in the orphan table
//! of their repository, so the queue survives restarts until
//! [`ContentStore::collect_garbage`] deletes them.

pub mod blob;
pub mod locks;
pub mod metadata;
pub mod model;
pub mod records;

pub use blob::{BlobReader, BlobRef, BlobStore, FileBlobStore, MemoryBlobStore, WrittenBlob};
pub use metadata::{DocumentKey, MetadataDocument};
pub use model::{ArtifactKey, ArtifactRecord, CacheEntry, NewArtifact, StoredArtifact, Validators};
pub use records::{FileRecordStore, MemoryRecordStore, RecordStore, Table, Versioned, WriteOutcome};

use crate::config::schema::StorageBackend;
use crate::config::{Config, ConfigManager};
use crate::error::{DepotError, DepotResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use locks::KeyedLocks;
use sha2::{Digest, Sha256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default bound on read-modify-write attempts
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A page of artifact records in path order
#[derive(Debug, Clone)]
pub struct ArtifactPage {
    pub records: Vec<ArtifactRecord>,
    /// Continuation token; `None` on the last page
    pub next: Option<String>,
}

/// Outcome of a repository-wide invalidation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Invalidation {
    pub expired: u64,
    pub dropped_negative: u64,
}

/// Outcome of a batch metadata update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub updated: u64,
    pub skipped: u64,
}

/// Row of the orphan table
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrphanRow {
    blob: BlobRef,
    orphaned_at: DateTime<Utc>,
}

/// The two records an artifact write moved between
struct Transition {
    previous: Option<ArtifactRecord>,
    current: ArtifactRecord,
}

/// Durable store for fetched artifacts and metadata documents
pub struct ContentStore {
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    artifact_locks: KeyedLocks<ArtifactKey>,
    document_locks: KeyedLocks<DocumentKey>,
    max_attempts: u32,
}

impl ContentStore {
    pub fn new(records: Arc<dyn RecordStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            records,
            blobs,
            artifact_locks: KeyedLocks::new(),
            document_locks: KeyedLocks::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Process-local store, used by tests and `storage.backend = "memory"`
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryRecordStore::new()),
            Arc::new(MemoryBlobStore::new()),
        )
    }

    /// Build the configured backends
    pub fn from_config(config: &Config) -> Self {
        let store = match config.storage.backend {
            StorageBackend::Memory => Self::in_memory(),
            StorageBackend::File => Self::new(
                Arc::new(FileRecordStore::new(ConfigManager::records_dir(config))),
                Arc::new(FileBlobStore::new(ConfigManager::blobs_dir(config))),
            ),
        };
        store.with_max_attempts(config.metadata.max_attempts)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Record backend shared with the browse index
    pub fn records(&self) -> Arc<dyn RecordStore> {
        self.records.clone()
    }

    // ------------------------------------------------------------------
    // Artifacts
    // ------------------------------------------------------------------

    /// Point read of an artifact row; never touches the network
    pub async fn get(&self, key: &ArtifactKey) -> DepotResult<Option<ArtifactRecord>> {
        let record = self
            .records
            .load(Table::Artifacts, &key.repository, &key.path)
            .await?;
        record.map(|r| decode_artifact(&r)).transpose()
    }

    /// Payload bytes of a stored artifact; `None` when the blob is gone
    pub async fn read_payload(&self, artifact: &StoredArtifact) -> DepotResult<Option<Bytes>> {
        self.blobs.get(&artifact.blob_ref).await
    }

    /// Streaming reader over a stored payload; `None` when the blob is gone
    pub async fn open_payload(
        &self,
        artifact: &StoredArtifact,
    ) -> DepotResult<Option<BlobReader>> {
        self.blobs.open(&artifact.blob_ref).await
    }

    /// Store a new payload generation and its positive cache entry.
    ///
    /// The previous generation's blob, if any, is queued for collection.
    pub async fn put(
        &self,
        key: &ArtifactKey,
        payload: Bytes,
        new: NewArtifact,
    ) -> DepotResult<StoredArtifact> {
        let size_bytes = payload.len() as u64;
        let content_hash = hex::encode(Sha256::digest(&payload));
        let blob = self.blobs.put(payload).await?;
        self.commit_blob(
            key,
            WrittenBlob {
                blob,
                size_bytes,
                content_hash,
            },
            new,
        )
        .await
    }

    /// Like [`ContentStore::put`], copying the payload from `reader`
    /// straight into the blob store
    pub async fn put_stream(
        &self,
        key: &ArtifactKey,
        reader: BlobReader,
        new: NewArtifact,
    ) -> DepotResult<StoredArtifact> {
        let written = self.blobs.put_reader(reader).await?;
        self.commit_blob(key, written, new).await
    }

    /// Point the artifact row at a freshly written blob
    async fn commit_blob(
        &self,
        key: &ArtifactKey,
        written: WrittenBlob,
        new: NewArtifact,
    ) -> DepotResult<StoredArtifact> {
        let now = Utc::now();
        let WrittenBlob {
            blob: blob_ref,
            size_bytes,
            content_hash,
        } = written;

        let result = self
            .write_artifact(key, |existing| {
                let generation = existing
                    .and_then(|r| r.artifact.as_ref())
                    .map_or(1, |a| a.generation + 1);
                let artifact = StoredArtifact {
                    key: key.clone(),
                    size_bytes,
                    content_hash: content_hash.clone(),
                    created_at: now,
                    blob_ref: blob_ref.clone(),
                    content_type: new.content_type.clone(),
                    generation,
                    attributes: new.attributes.clone(),
                };
                Some(ArtifactRecord {
                    key: key.clone(),
                    artifact: Some(artifact),
                    entry: CacheEntry::positive(now, new.validators.clone(), new.expires_at),
                })
            })
            .await;

        let transition = match result {
            Ok(Some(transition)) => transition,
            Ok(None) => {
                self.orphan(&key.repository, &blob_ref).await;
                return Err(DepotError::Internal(format!("artifact write for {} was a no-op", key)));
            }
            Err(e) => {
                self.orphan(&key.repository, &blob_ref).await;
                return Err(e);
            }
        };

        self.orphan_previous(&transition).await;
        let artifact = transition
            .current
            .artifact
            .ok_or_else(|| DepotError::Internal(format!("stored record for {} has no artifact", key)))?;

        debug!(
            repository = %key.repository,
            path = %key.path,
            generation = artifact.generation,
            size = artifact.size_bytes,
            "Stored artifact"
        );
        Ok(artifact)
    }

    /// Record confirmed absence. Any stored payload is replaced and its
    /// blob queued for collection.
    pub async fn put_negative(
        &self,
        key: &ArtifactKey,
        validators: Validators,
        expires_at: DateTime<Utc>,
    ) -> DepotResult<ArtifactRecord> {
        let now = Utc::now();
        let transition = self
            .write_artifact(key, |_| {
                Some(ArtifactRecord {
                    key: key.clone(),
                    artifact: None,
                    entry: CacheEntry::negative(now, validators.clone(), expires_at),
                })
            })
            .await?
            .ok_or_else(|| DepotError::Internal(format!("negative write for {} was a no-op", key)))?;

        self.orphan_previous(&transition).await;
        debug!(repository = %key.repository, path = %key.path, "Stored negative entry");
        Ok(transition.current)
    }

    /// Extend a positive entry after upstream confirmed it unchanged.
    ///
    /// Payload and generation are untouched. Returns `None` when the key
    /// has no positive entry anymore.
    pub async fn mark_verified(
        &self,
        key: &ArtifactKey,
        validators: &Validators,
        expires_at: DateTime<Utc>,
    ) -> DepotResult<Option<ArtifactRecord>> {
        let now = Utc::now();
        let transition = self
            .write_artifact(key, |existing| {
                let existing = existing?;
                existing.stored()?;
                let mut record = existing.clone();
                record.entry.fetched_at = now;
                record.entry.validators = existing.entry.validators.refreshed(validators);
                record.entry.expires_at = expires_at;
                Some(record)
            })
            .await?;
        Ok(transition.map(|t| t.current))
    }

    /// Update the attribute map of a stored artifact without touching bytes
    pub async fn update_attributes<F>(
        &self,
        key: &ArtifactKey,
        mut update: F,
    ) -> DepotResult<Option<StoredArtifact>>
    where
        F: FnMut(&mut BTreeMap<String, String>) + Send,
    {
        let transition = self
            .write_artifact(key, |existing| {
                let mut record = existing?.clone();
                update(&mut record.artifact.as_mut()?.attributes);
                Some(record)
            })
            .await?;
        Ok(transition.and_then(|t| t.current.artifact))
    }

    /// Delete one artifact row, queueing its blob for collection
    pub async fn delete(&self, key: &ArtifactKey) -> DepotResult<Option<ArtifactRecord>> {
        let _guard = self.artifact_locks.acquire(key).await;
        let removed = self
            .records
            .remove(Table::Artifacts, &key.repository, &key.path)
            .await?;
        let removed = removed.map(|r| decode_artifact(&r)).transpose()?;

        if let Some(artifact) = removed.as_ref().and_then(|r| r.artifact.as_ref()) {
            self.orphan(&key.repository, &artifact.blob_ref).await;
        }
        Ok(removed)
    }

    /// Delete every artifact row and metadata document of a repository
    pub async fn delete_all_for_repository(&self, repository: &str) -> DepotResult<u64> {
        let mut after: Option<String> = None;
        loop {
            let page = self.browse_artifacts(repository, after.as_deref(), 1000).await?;
            for artifact in page.records.iter().filter_map(|r| r.artifact.as_ref()) {
                self.orphan(repository, &artifact.blob_ref).await;
            }
            match page.next {
                Some(next) => after = Some(next),
                None => break,
            }
        }

        let removed = self.records.remove_all(Table::Artifacts, repository).await?;
        let documents = self.records.remove_all(Table::Metadata, repository).await?;
        info!(
            repository = %repository,
            artifacts = removed,
            documents,
            "Deleted repository content"
        );
        Ok(removed)
    }

    /// Artifact rows of a repository in path order, positive and negative
    pub async fn browse_artifacts(
        &self,
        repository: &str,
        after: Option<&str>,
        limit: usize,
    ) -> DepotResult<ArtifactPage> {
        let rows = self
            .records
            .scan(Table::Artifacts, repository, after, limit)
            .await?;
        let next = if rows.len() == limit {
            rows.last().map(|r| r.id.clone())
        } else {
            None
        };
        let records = rows
            .iter()
            .map(decode_artifact)
            .collect::<DepotResult<Vec<_>>>()?;
        Ok(ArtifactPage { records, next })
    }

    pub async fn count_artifacts(&self, repository: &str) -> DepotResult<u64> {
        self.records.count(Table::Artifacts, repository).await
    }

    /// Expire every positive entry of a repository and drop negative ones.
    ///
    /// Payloads stay in place; the next read revalidates conditionally.
    pub async fn expire_all(&self, repository: &str) -> DepotResult<Invalidation> {
        let mut summary = Invalidation::default();
        let expired_at = Utc::now() - chrono::Duration::seconds(1);
        let mut after: Option<String> = None;

        loop {
            let page = self.browse_artifacts(repository, after.as_deref(), 1000).await?;
            for record in &page.records {
                if record.entry.is_negative {
                    let _guard = self.artifact_locks.acquire(&record.key).await;
                    self.records
                        .remove(Table::Artifacts, repository, &record.key.path)
                        .await?;
                    summary.dropped_negative += 1;
                } else {
                    let expired = self
                        .write_artifact(&record.key, |existing| {
                            let mut record = existing?.clone();
                            if record.entry.is_negative {
                                return None;
                            }
                            record.entry.expires_at = expired_at;
                            Some(record)
                        })
                        .await?;
                    if expired.is_some() {
                        summary.expired += 1;
                    }
                }
            }
            match page.next {
                Some(next) => after = Some(next),
                None => break,
            }
        }

        Ok(summary)
    }

    /// Conditional read-modify-write of one artifact row.
    ///
    /// `build` returning `None` leaves the row unchanged.
    async fn write_artifact<F>(
        &self,
        key: &ArtifactKey,
        mut build: F,
    ) -> DepotResult<Option<Transition>>
    where
        F: FnMut(Option<&ArtifactRecord>) -> Option<ArtifactRecord> + Send,
    {
        let _guard = self.artifact_locks.acquire(key).await;

        for attempt in 1..=self.max_attempts {
            let loaded = self
                .records
                .load(Table::Artifacts, &key.repository, &key.path)
                .await?;
            let expected = loaded.as_ref().map(|r| r.generation);
            let previous = loaded.map(|r| decode_artifact(&r)).transpose()?;

            let Some(current) = build(previous.as_ref()) else {
                return Ok(None);
            };

            let value = serde_json::to_value(&current)?;
            match self
                .records
                .compare_and_swap(Table::Artifacts, &key.repository, &key.path, expected, value)
                .await?
            {
                WriteOutcome::Committed { .. } => return Ok(Some(Transition { previous, current })),
                WriteOutcome::Conflict { current } => {
                    debug!(
                        key = %key,
                        attempt,
                        expected = ?expected,
                        found = ?current,
                        "Artifact row changed concurrently, retrying"
                    );
                }
            }
        }

        Err(DepotError::ConcurrencyExhausted {
            document: key.to_string(),
            attempts: self.max_attempts,
        })
    }

    // ------------------------------------------------------------------
    // Metadata documents
    // ------------------------------------------------------------------

    /// Read-merge-write a metadata document under the per-document lock.
    ///
    /// `mutator` receives the current document (if any) and returns the
    /// update. With `overlay` the update is merged into the current
    /// document; otherwise it replaces it. A write that loses to another
    /// committer is retried from a fresh read, up to the configured number
    /// of attempts, after which `ConcurrencyExhausted` is returned.
    pub async fn update_metadata_document<F>(
        &self,
        key: &DocumentKey,
        overlay: bool,
        mut mutator: F,
    ) -> DepotResult<MetadataDocument>
    where
        F: FnMut(Option<&MetadataDocument>) -> MetadataDocument + Send,
    {
        for attempt in 1..=self.max_attempts {
            let _guard = self.document_locks.acquire(key).await;
            if let Some(document) = self
                .try_write_document(key, overlay, &mut mutator, attempt)
                .await?
            {
                return Ok(document);
            }
        }

        Err(DepotError::ConcurrencyExhausted {
            document: key.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// Overlay `update` into a document and store `render(merged)` as the
    /// artifact at `artifact`.
    ///
    /// The document lock is held across both writes, so concurrent
    /// publishers of the same package leave the stored artifact rendered
    /// from the newest merge.
    pub async fn publish_document<R>(
        &self,
        artifact: &ArtifactKey,
        document: &DocumentKey,
        update: MetadataDocument,
        new: NewArtifact,
        render: R,
    ) -> DepotResult<(MetadataDocument, StoredArtifact)>
    where
        R: Fn(&MetadataDocument) -> DepotResult<Bytes> + Send,
    {
        let _guard = self.document_locks.acquire(document).await;
        let mut mutator = |_: Option<&MetadataDocument>| update.clone();

        for attempt in 1..=self.max_attempts {
            if let Some(merged) = self
                .try_write_document(document, true, &mut mutator, attempt)
                .await?
            {
                let payload = render(&merged)?;
                let stored = self.put(artifact, payload, new).await?;
                return Ok((merged, stored));
            }
        }

        Err(DepotError::ConcurrencyExhausted {
            document: document.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// One read-merge-write cycle; `None` when the conditional write lost
    async fn try_write_document<F>(
        &self,
        key: &DocumentKey,
        overlay: bool,
        mutator: &mut F,
        attempt: u32,
    ) -> DepotResult<Option<MetadataDocument>>
    where
        F: FnMut(Option<&MetadataDocument>) -> MetadataDocument + Send,
    {
        let loaded = self
            .records
            .load(Table::Metadata, &key.repository, &key.name)
            .await?;
        let expected = loaded.as_ref().map(|r| r.generation);
        let existing = loaded.map(|r| decode_document(&r)).transpose()?;

        let update = mutator(existing.as_ref());
        let mut document = if overlay {
            let mut base = existing.unwrap_or_else(|| MetadataDocument::empty(key));
            base.overlay(update);
            base
        } else {
            update
        };
        document.repository = key.repository.clone();
        document.name = key.name.clone();
        document.updated_at = Some(Utc::now());

        let value = serde_json::to_value(&document)?;
        match self
            .records
            .compare_and_swap(Table::Metadata, &key.repository, &key.name, expected, value)
            .await?
        {
            WriteOutcome::Committed { generation } => {
                debug!(document = %key, generation, attempt, "Metadata document written");
                Ok(Some(document))
            }
            WriteOutcome::Conflict { current } => {
                debug!(
                    document = %key,
                    attempt,
                    expected = ?expected,
                    found = ?current,
                    "Metadata document changed concurrently, retrying"
                );
                Ok(None)
            }
        }
    }

    /// Apply `function` to every document of a repository matching
    /// `predicate`. Documents that keep losing the write race are skipped
    /// and logged; any other error aborts the batch.
    pub async fn update_metadata_documents<P, F>(
        &self,
        repository: &str,
        predicate: P,
        mut function: F,
    ) -> DepotResult<BatchSummary>
    where
        P: Fn(&MetadataDocument) -> bool + Send + Sync,
        F: FnMut(MetadataDocument) -> MetadataDocument + Send,
    {
        let mut summary = BatchSummary::default();
        let mut after: Option<String> = None;

        loop {
            let rows = self
                .records
                .scan(Table::Metadata, repository, after.as_deref(), 1000)
                .await?;
            let last = rows.last().map(|r| r.id.clone());
            let full_page = rows.len() == 1000;

            for row in &rows {
                let document = decode_document(row)?;
                if !predicate(&document) {
                    continue;
                }

                let key = document.key();
                let result = self
                    .update_metadata_document(&key, false, |existing| {
                        function(existing.cloned().unwrap_or_else(|| document.clone()))
                    })
                    .await;

                match result {
                    Ok(_) => summary.updated += 1,
                    Err(e @ DepotError::ConcurrencyExhausted { .. }) => {
                        warn!(document = %key, error = %e, "Skipping metadata document");
                        summary.skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            match (full_page, last) {
                (true, Some(last)) => after = Some(last),
                _ => break,
            }
        }

        Ok(summary)
    }

    pub async fn get_metadata_document(
        &self,
        key: &DocumentKey,
    ) -> DepotResult<Option<MetadataDocument>> {
        let record = self
            .records
            .load(Table::Metadata, &key.repository, &key.name)
            .await?;
        record.map(|r| decode_document(&r)).transpose()
    }

    /// Names of every document in a repository, sorted
    pub async fn list_metadata_names(&self, repository: &str) -> DepotResult<Vec<String>> {
        let mut names = vec![];
        let mut after: Option<String> = None;
        loop {
            let rows = self
                .records
                .scan(Table::Metadata, repository, after.as_deref(), 1000)
                .await?;
            let done = rows.len() < 1000;
            after = rows.last().map(|r| r.id.clone());
            names.extend(rows.into_iter().map(|r| r.id));
            if done {
                break;
            }
        }
        Ok(names)
    }

    pub async fn delete_metadata_document(&self, key: &DocumentKey) -> DepotResult<bool> {
        let _guard = self.document_locks.acquire(key).await;
        let removed = self
            .records
            .remove(Table::Metadata, &key.repository, &key.name)
            .await?;
        Ok(removed.is_some())
    }

    // ------------------------------------------------------------------
    // Blob collection
    // ------------------------------------------------------------------

    /// Blobs of a repository that no record points to anymore, in
    /// reference order
    pub async fn orphaned_blobs(&self, repository: &str) -> DepotResult<Vec<BlobRef>> {
        let mut blobs = vec![];
        let mut after: Option<String> = None;
        loop {
            let rows = self
                .records
                .scan(Table::Orphans, repository, after.as_deref(), 1000)
                .await?;
            let done = rows.len() < 1000;
            after = rows.last().map(|r| r.id.clone());
            for row in &rows {
                blobs.push(decode_orphan(row)?.blob);
            }
            if done {
                break;
            }
        }
        Ok(blobs)
    }

    /// Delete every orphaned blob of a repository, returning how many
    /// existed. A queue row is only dropped once its blob is gone, so an
    /// interrupted run resumes where it stopped.
    pub async fn collect_garbage(&self, repository: &str) -> DepotResult<usize> {
        let mut deleted = 0;
        for blob in self.orphaned_blobs(repository).await? {
            if self.blobs.delete(&blob).await? {
                deleted += 1;
            }
            self.records
                .remove(Table::Orphans, repository, blob.as_str())
                .await?;
        }
        if deleted > 0 {
            info!(repository = %repository, deleted, "Collected orphaned blobs");
        }
        Ok(deleted)
    }

    /// Queue a blob for collection. The row that referenced it is already
    /// committed, so a failure here only leaks the blob.
    async fn orphan(&self, repository: &str, blob: &BlobRef) {
        let row = OrphanRow {
            blob: blob.clone(),
            orphaned_at: Utc::now(),
        };
        let result = match serde_json::to_value(&row) {
            Ok(value) => self
                .records
                .upsert(Table::Orphans, repository, blob.as_str(), value)
                .await
                .map(|_| ()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(repository = %repository, blob = %blob, error = %e, "Failed to queue orphaned blob");
        }
    }

    async fn orphan_previous(&self, transition: &Transition) {
        let previous = transition
            .previous
            .as_ref()
            .and_then(|r| r.artifact.as_ref())
            .map(|a| &a.blob_ref);
        let current = transition.current.artifact.as_ref().map(|a| &a.blob_ref);
        if let Some(previous) = previous {
            if Some(previous) != current {
                self.orphan(&transition.current.key.repository, previous).await;
            }
        }
    }
}

fn decode_artifact(record: &Versioned) -> DepotResult<ArtifactRecord> {
    serde_json::from_value(record.value.clone())
        .map_err(|e| DepotError::storage(format!("decoding artifact record {}", record.id), e))
}

fn decode_document(record: &Versioned) -> DepotResult<MetadataDocument> {
    serde_json::from_value(record.value.clone())
        .map_err(|e| DepotError::storage(format!("decoding metadata document {}", record.id), e))
}

fn decode_orphan(record: &Versioned) -> DepotResult<OrphanRow> {
    serde_json::from_value(record.value.clone())
        .map_err(|e| DepotError::storage(format!("decoding orphan {}", record.id), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn new_artifact(etag: &str) -> NewArtifact {
        NewArtifact {
            content_type: "application/octet-stream".to_string(),
            validators: Validators::etag(etag),
            expires_at: Utc::now() + Duration::hours(1),
            attributes: BTreeMap::new(),
        }
    }

    fn version_update(version: &str) -> MetadataDocument {
        let mut doc = MetadataDocument::empty(&DocumentKey::new("npmjs", "left-pad"));
        doc.versions
            .insert(version.to_string(), json!({ "version": version }));
        doc.recompute_latest();
        doc
    }

    #[tokio::test]
    async fn put_then_get() {
        let store = ContentStore::in_memory();
        let key = ArtifactKey::new("r1", "pkg/a");

        let stored = store
            .put(&key, Bytes::from_static(b"payload"), new_artifact("\"v1\""))
            .await
            .unwrap();
        assert_eq!(stored.generation, 1);
        assert_eq!(stored.size_bytes, 7);

        let record = store.get(&key).await.unwrap().unwrap();
        assert!(!record.entry.is_negative);
        assert_eq!(record.entry.validators.etag.as_deref(), Some("\"v1\""));

        let payload = store
            .read_payload(record.stored().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, "payload");
    }

    #[tokio::test]
    async fn replacing_payload_orphans_previous_blob() {
        let store = ContentStore::in_memory();
        let key = ArtifactKey::new("r1", "pkg/a");

        let first = store
            .put(&key, Bytes::from_static(b"one"), new_artifact("\"v1\""))
            .await
            .unwrap();
        let second = store
            .put(&key, Bytes::from_static(b"two"), new_artifact("\"v2\""))
            .await
            .unwrap();

        assert_eq!(second.generation, 2);
        assert_eq!(store.orphaned_blobs("r1").await.unwrap(), vec![first.blob_ref]);
        assert_eq!(store.collect_garbage("r1").await.unwrap(), 1);
        assert!(store.orphaned_blobs("r1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn negative_entry_replaces_artifact() {
        let store = ContentStore::in_memory();
        let key = ArtifactKey::new("r1", "gone");
        let stored = store
            .put(&key, Bytes::from_static(b"x"), new_artifact("\"v1\""))
            .await
            .unwrap();

        let record = store
            .put_negative(&key, Validators::default(), Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        assert!(record.entry.is_negative);
        assert!(record.stored().is_none());
        assert_eq!(store.orphaned_blobs("r1").await.unwrap(), vec![stored.blob_ref]);
    }

    #[tokio::test]
    async fn mark_verified_keeps_payload() {
        let store = ContentStore::in_memory();
        let key = ArtifactKey::new("r1", "pkg/a");
        let stored = store
            .put(&key, Bytes::from_static(b"same"), new_artifact("\"v1\""))
            .await
            .unwrap();

        let later = Utc::now() + Duration::days(2);
        let record = store
            .mark_verified(&key, &Validators::default(), later)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(record.entry.expires_at, later);
        assert_eq!(record.entry.validators.etag.as_deref(), Some("\"v1\""));
        assert_eq!(record.stored().unwrap().blob_ref, stored.blob_ref);
        assert_eq!(record.stored().unwrap().generation, 1);
    }

    #[tokio::test]
    async fn mark_verified_ignores_negative_entries() {
        let store = ContentStore::in_memory();
        let key = ArtifactKey::new("r1", "missing");
        store
            .put_negative(&key, Validators::default(), Utc::now())
            .await
            .unwrap();
        let result = store
            .mark_verified(&key, &Validators::default(), Utc::now())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn update_attributes_in_place() {
        let store = ContentStore::in_memory();
        let key = ArtifactKey::new("r1", "pkg/a");
        store
            .put(&key, Bytes::from_static(b"x"), new_artifact("\"v1\""))
            .await
            .unwrap();

        let updated = store
            .update_attributes(&key, |attrs| {
                attrs.insert("checksum.verified".to_string(), "true".to_string());
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.attributes["checksum.verified"], "true");
        assert_eq!(updated.generation, 1);
        assert!(store.orphaned_blobs("r1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_and_collect() {
        let store = ContentStore::in_memory();
        let key = ArtifactKey::new("r1", "pkg/a");
        store
            .put(&key, Bytes::from_static(b"x"), new_artifact("\"v1\""))
            .await
            .unwrap();

        assert!(store.delete(&key).await.unwrap().is_some());
        assert!(store.get(&key).await.unwrap().is_none());
        assert_eq!(store.collect_garbage("r1").await.unwrap(), 1);
        assert_eq!(store.collect_garbage("r1").await.unwrap(), 0);
        assert!(store.delete(&key).await.unwrap().is_none());
    }

    fn file_store(root: &std::path::Path) -> ContentStore {
        ContentStore::new(
            Arc::new(FileRecordStore::new(root.join("records"))),
            Arc::new(FileBlobStore::new(root.join("blobs"))),
        )
    }

    #[tokio::test]
    async fn orphan_queue_survives_restart() {
        let temp = tempfile::TempDir::new().unwrap();
        let key = ArtifactKey::new("r1", "pkg/a");
        let first = {
            let store = file_store(temp.path());
            let first = store
                .put(&key, Bytes::from_static(b"one"), new_artifact("\"v1\""))
                .await
                .unwrap();
            store
                .put(&key, Bytes::from_static(b"two"), new_artifact("\"v2\""))
                .await
                .unwrap();
            first
        };

        let reopened = file_store(temp.path());
        assert_eq!(
            reopened.orphaned_blobs("r1").await.unwrap(),
            vec![first.blob_ref.clone()]
        );
        assert_eq!(reopened.collect_garbage("r1").await.unwrap(), 1);
        assert!(reopened.blobs.get(&first.blob_ref).await.unwrap().is_none());
        assert!(file_store(temp.path())
            .orphaned_blobs("r1")
            .await
            .unwrap()
            .is_empty());

        let current = reopened.get(&key).await.unwrap().unwrap();
        let payload = reopened
            .read_payload(current.stored().unwrap())
            .await
            .unwrap();
        assert_eq!(payload.unwrap(), "two");
    }

    #[tokio::test]
    async fn put_stream_records_size_and_digest() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = file_store(temp.path());
        let key = ArtifactKey::new("r1", "big.bin");
        let payload: Vec<u8> = (0..200_000).map(|i| (i % 7) as u8).collect();

        let stored = store
            .put_stream(
                &key,
                Box::new(std::io::Cursor::new(payload.clone())),
                new_artifact("\"v1\""),
            )
            .await
            .unwrap();
        assert_eq!(stored.size_bytes, payload.len() as u64);
        assert_eq!(stored.content_hash, hex::encode(Sha256::digest(&payload)));

        let mut reader = store.open_payload(&stored).await.unwrap().unwrap();
        let mut read = vec![];
        std::io::Read::read_to_end(&mut reader, &mut read).unwrap();
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn delete_all_for_repository_leaves_others() {
        let store = ContentStore::in_memory();
        for path in ["a", "b", "c"] {
            store
                .put(&ArtifactKey::new("r1", path), Bytes::from_static(b"x"), new_artifact("e"))
                .await
                .unwrap();
        }
        store
            .put(&ArtifactKey::new("r2", "a"), Bytes::from_static(b"x"), new_artifact("e"))
            .await
            .unwrap();
        store
            .update_metadata_document(&DocumentKey::new("r1", "left-pad"), true, |_| {
                version_update("1.0.0")
            })
            .await
            .unwrap();

        assert_eq!(store.delete_all_for_repository("r1").await.unwrap(), 3);
        assert_eq!(store.count_artifacts("r1").await.unwrap(), 0);
        assert_eq!(store.count_artifacts("r2").await.unwrap(), 1);
        assert!(store.list_metadata_names("r1").await.unwrap().is_empty());
        assert_eq!(store.orphaned_blobs("r1").await.unwrap().len(), 3);
        assert!(store.orphaned_blobs("r2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn browse_artifacts_pages() {
        let store = ContentStore::in_memory();
        for path in ["a", "b", "c"] {
            store
                .put(&ArtifactKey::new("r1", path), Bytes::from_static(b"x"), new_artifact("e"))
                .await
                .unwrap();
        }

        let first = store.browse_artifacts("r1", None, 2).await.unwrap();
        assert_eq!(first.records.len(), 2);
        let next = first.next.unwrap();
        let second = store.browse_artifacts("r1", Some(&next), 2).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert!(second.next.is_none());
    }

    #[tokio::test]
    async fn expire_all_expires_and_drops_negatives() {
        let store = ContentStore::in_memory();
        let hit = ArtifactKey::new("r1", "hit");
        store
            .put(&hit, Bytes::from_static(b"x"), new_artifact("e"))
            .await
            .unwrap();
        store
            .put_negative(
                &ArtifactKey::new("r1", "miss"),
                Validators::default(),
                Utc::now() + Duration::hours(1),
            )
            .await
            .unwrap();

        let summary = store.expire_all("r1").await.unwrap();
        assert_eq!(summary, Invalidation { expired: 1, dropped_negative: 1 });

        let record = store.get(&hit).await.unwrap().unwrap();
        assert!(record.entry.expires_at < Utc::now());
        assert!(store
            .get(&ArtifactKey::new("r1", "miss"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn overlay_updates_accumulate_versions() {
        let store = ContentStore::in_memory();
        let key = DocumentKey::new("npmjs", "left-pad");

        store
            .update_metadata_document(&key, true, |_| version_update("1.0.0"))
            .await
            .unwrap();
        let doc = store
            .update_metadata_document(&key, true, |_| version_update("1.1.0"))
            .await
            .unwrap();

        assert_eq!(doc.versions.len(), 2);
        assert_eq!(doc.latest(), Some("1.1.0"));
        assert!(doc.updated_at.is_some());
    }

    #[tokio::test]
    async fn replace_mode_drops_missing_versions() {
        let store = ContentStore::in_memory();
        let key = DocumentKey::new("npmjs", "left-pad");

        store
            .update_metadata_document(&key, true, |_| version_update("1.0.0"))
            .await
            .unwrap();
        let doc = store
            .update_metadata_document(&key, false, |_| version_update("2.0.0"))
            .await
            .unwrap();
        assert_eq!(doc.versions.keys().collect::<Vec<_>>(), ["2.0.0"]);
    }

    #[tokio::test]
    async fn concurrent_disjoint_updates_are_all_retained() {
        let store = Arc::new(ContentStore::in_memory());
        let key = DocumentKey::new("npmjs", "left-pad");

        let handles = (0..16).map(|i| {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move {
                store
                    .update_metadata_document(&key, true, |_| {
                        version_update(&format!("1.{}.0", i))
                    })
                    .await
            })
        });
        for result in futures_util::future::join_all(handles).await {
            result.unwrap().unwrap();
        }

        let doc = store.get_metadata_document(&key).await.unwrap().unwrap();
        assert_eq!(doc.versions.len(), 16);
        assert_eq!(doc.latest(), Some("1.15.0"));
    }

    /// Record store whose conditional writes always lose
    #[derive(Default)]
    struct AlwaysConflicting {
        writes: AtomicU32,
    }

    #[async_trait]
    impl RecordStore for AlwaysConflicting {
        async fn load(&self, _: Table, _: &str, _: &str) -> DepotResult<Option<Versioned>> {
            Ok(None)
        }

        async fn compare_and_swap(
            &self,
            _: Table,
            _: &str,
            _: &str,
            _: Option<u64>,
            _: serde_json::Value,
        ) -> DepotResult<WriteOutcome> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(WriteOutcome::Conflict { current: Some(99) })
        }

        async fn upsert(&self, _: Table, _: &str, _: &str, _: serde_json::Value) -> DepotResult<u64> {
            Ok(1)
        }

        async fn remove(&self, _: Table, _: &str, _: &str) -> DepotResult<Option<Versioned>> {
            Ok(None)
        }

        async fn remove_all(&self, _: Table, _: &str) -> DepotResult<u64> {
            Ok(0)
        }

        async fn scan(
            &self,
            _: Table,
            _: &str,
            _: Option<&str>,
            _: usize,
        ) -> DepotResult<Vec<Versioned>> {
            Ok(vec![])
        }

        async fn count(&self, _: Table, _: &str) -> DepotResult<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn always_conflicting_write_gives_up_after_bound() {
        let records = Arc::new(AlwaysConflicting::default());
        let store = ContentStore::new(records.clone(), Arc::new(MemoryBlobStore::new()));

        let err = store
            .update_metadata_document(&DocumentKey::new("npmjs", "left-pad"), true, |_| {
                version_update("1.0.0")
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DepotError::ConcurrencyExhausted { attempts: 3, .. }
        ));
        assert_eq!(records.writes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_bound_is_configurable() {
        let records = Arc::new(AlwaysConflicting::default());
        let store = ContentStore::new(records.clone(), Arc::new(MemoryBlobStore::new()))
            .with_max_attempts(5);

        let result = store
            .update_metadata_document(&DocumentKey::new("r", "p"), false, |_| {
                version_update("1.0.0")
            })
            .await;
        assert!(result.is_err());
        assert_eq!(records.writes.load(Ordering::SeqCst), 5);
    }

    /// Simulates another node committing between our read and our write,
    /// once
    struct RacingNode {
        inner: MemoryRecordStore,
        raced: AtomicBool,
        writes: AtomicU32,
    }

    #[async_trait]
    impl RecordStore for RacingNode {
        async fn load(&self, t: Table, r: &str, id: &str) -> DepotResult<Option<Versioned>> {
            self.inner.load(t, r, id).await
        }

        async fn compare_and_swap(
            &self,
            t: Table,
            r: &str,
            id: &str,
            expected: Option<u64>,
            value: serde_json::Value,
        ) -> DepotResult<WriteOutcome> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if !self.raced.swap(true, Ordering::SeqCst) {
                let mut other = MetadataDocument::empty(&DocumentKey::new(r, id));
                other
                    .versions
                    .insert("9.9.9".to_string(), json!({ "version": "9.9.9" }));
                let other = serde_json::to_value(&other).unwrap();
                self.inner
                    .compare_and_swap(t, r, id, expected, other)
                    .await?;
            }
            self.inner.compare_and_swap(t, r, id, expected, value).await
        }

        async fn upsert(
            &self,
            t: Table,
            r: &str,
            id: &str,
            value: serde_json::Value,
        ) -> DepotResult<u64> {
            self.inner.upsert(t, r, id, value).await
        }

        async fn remove(&self, t: Table, r: &str, id: &str) -> DepotResult<Option<Versioned>> {
            self.inner.remove(t, r, id).await
        }

        async fn remove_all(&self, t: Table, r: &str) -> DepotResult<u64> {
            self.inner.remove_all(t, r).await
        }

        async fn scan(
            &self,
            t: Table,
            r: &str,
            after: Option<&str>,
            limit: usize,
        ) -> DepotResult<Vec<Versioned>> {
            self.inner.scan(t, r, after, limit).await
        }

        async fn count(&self, t: Table, r: &str) -> DepotResult<u64> {
            self.inner.count(t, r).await
        }
    }

    #[tokio::test]
    async fn conflict_with_other_node_retries_and_keeps_both() {
        let records = Arc::new(RacingNode {
            inner: MemoryRecordStore::new(),
            raced: AtomicBool::new(false),
            writes: AtomicU32::new(0),
        });
        let store = ContentStore::new(records.clone(), Arc::new(MemoryBlobStore::new()));

        let doc = store
            .update_metadata_document(&DocumentKey::new("npmjs", "left-pad"), true, |_| {
                version_update("1.0.0")
            })
            .await
            .unwrap();

        assert_eq!(records.writes.load(Ordering::SeqCst), 2);
        assert!(doc.versions.contains_key("1.0.0"));
        assert!(doc.versions.contains_key("9.9.9"));
    }

    #[tokio::test]
    async fn batch_update_applies_to_matching_documents() {
        let store = ContentStore::in_memory();
        for name in ["a", "b", "c"] {
            store
                .update_metadata_document(&DocumentKey::new("r1", name), true, |_| {
                    let mut doc = MetadataDocument::empty(&DocumentKey::new("r1", name));
                    doc.description = Some(name.to_string());
                    doc
                })
                .await
                .unwrap();
        }

        let summary = store
            .update_metadata_documents(
                "r1",
                |doc| doc.name != "b",
                |mut doc| {
                    doc.attributes.insert("reindexed".to_string(), "yes".to_string());
                    doc
                },
            )
            .await
            .unwrap();
        assert_eq!(summary, BatchSummary { updated: 2, skipped: 0 });

        let a = store
            .get_metadata_document(&DocumentKey::new("r1", "a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.attributes["reindexed"], "yes");
        let b = store
            .get_metadata_document(&DocumentKey::new("r1", "b"))
            .await
            .unwrap()
            .unwrap();
        assert!(b.attributes.is_empty());
    }

    #[tokio::test]
    async fn publish_document_renders_merged_document() {
        let store = Arc::new(ContentStore::in_memory());
        let doc_key = DocumentKey::new("npmjs", "left-pad");
        let artifact_key = ArtifactKey::new("npmjs", "left-pad");

        let handles: Vec<_> = ["1.0.0", "1.1.0", "1.2.0"]
            .into_iter()
            .map(|version| {
                let store = store.clone();
                let doc_key = doc_key.clone();
                let artifact_key = artifact_key.clone();
                tokio::spawn(async move {
                    store
                        .publish_document(
                            &artifact_key,
                            &doc_key,
                            version_update(version),
                            new_artifact("e"),
                            |doc| Ok(Bytes::from(serde_json::to_vec(&doc.versions)?)),
                        )
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let record = store.get(&artifact_key).await.unwrap().unwrap();
        let payload = store
            .read_payload(record.stored().unwrap())
            .await
            .unwrap()
            .unwrap();
        let versions: BTreeMap<String, serde_json::Value> =
            serde_json::from_slice(&payload).unwrap();
        assert_eq!(versions.len(), 3);
    }

    #[tokio::test]
    async fn metadata_queries() {
        let store = ContentStore::in_memory();
        for name in ["zeta", "alpha"] {
            store
                .update_metadata_document(&DocumentKey::new("r1", name), true, |_| {
                    version_update("1.0.0")
                })
                .await
                .unwrap();
        }

        assert_eq!(store.list_metadata_names("r1").await.unwrap(), ["alpha", "zeta"]);
        let doc = store
            .get_metadata_document(&DocumentKey::new("r1", "alpha"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.name, "alpha");

        assert!(store
            .delete_metadata_document(&DocumentKey::new("r1", "alpha"))
            .await
            .unwrap());
        assert!(!store
            .delete_metadata_document(&DocumentKey::new("r1", "alpha"))
            .await
            .unwrap());
    }
}
