//! Browse index: a derived directory-like view over stored artifacts
//!
//! Nodes are persisted as rows of the record store, one per display path,
//! so the index survives restarts and a rebuild is written once and read by
//! every later process. Each repository's rows are loaded into a
//! [`BrowseTree`] on first use; mutations are applied to the tree and then
//! written back. The index is fed by store events and can always be rebuilt
//! from a scan of the content store.

pub mod events;
pub mod node;
pub mod tree;

pub use events::{IndexWorkers, StoreEvent, StoreEventKind, StoreEventPublisher};
pub use node::{BrowseNode, NodeId, NodeRow, RefKind};
pub use tree::{BrowseTree, NodeChange};

use crate::error::{DepotError, DepotResult};
use crate::format::Format;
use crate::repository::RepositoryRegistry;
use crate::store::locks::KeyedLocks;
use crate::store::model::ArtifactKey;
use crate::store::{ContentStore, RecordStore, Table};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default number of artifacts read per rebuild page
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Outcome of a completed rebuild
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    /// Nodes dropped before rebuilding
    pub removed: usize,
    /// Artifacts indexed
    pub assets: u64,
    pub pages: u64,
}

/// Cached tree plus the repositories already loaded into it
#[derive(Default)]
struct IndexState {
    tree: BrowseTree,
    loaded: HashSet<String>,
}

pub struct BrowseIndex {
    store: Arc<ContentStore>,
    records: Arc<dyn RecordStore>,
    repositories: RepositoryRegistry,
    state: Mutex<IndexState>,
    /// Serializes event handling per key across workers
    key_locks: KeyedLocks<ArtifactKey>,
    page_size: usize,
}

impl BrowseIndex {
    pub fn new(store: Arc<ContentStore>, repositories: RepositoryRegistry) -> Self {
        Self {
            records: store.records(),
            store,
            repositories,
            state: Mutex::new(IndexState::default()),
            key_locks: KeyedLocks::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn format_for(&self, repository: &str) -> Option<Arc<dyn Format>> {
        match self.repositories.get(repository) {
            Ok(repo) => Some(repo.format.clone()),
            Err(_) => {
                debug!(repository = %repository, "Ignoring artifact of unknown repository");
                None
            }
        }
    }

    /// Lock the tree with `repository` loaded from its persisted rows
    async fn lock(&self, repository: &str) -> DepotResult<MutexGuard<'_, IndexState>> {
        let mut state = self.state.lock().await;
        if state.loaded.contains(repository) {
            return Ok(state);
        }

        let mut after: Option<String> = None;
        let mut loaded = 0usize;
        loop {
            let rows = self
                .records
                .scan(Table::BrowseNodes, repository, after.as_deref(), self.page_size)
                .await?;
            let done = rows.len() < self.page_size;
            after = rows.last().map(|r| r.id.clone());
            for row in rows {
                let node: NodeRow = serde_json::from_value(row.value).map_err(|e| {
                    DepotError::storage(format!("decoding browse node {}", row.id), e)
                })?;
                state.tree.restore(node);
                loaded += 1;
            }
            if done {
                break;
            }
        }

        debug!(repository = %repository, nodes = loaded, "Loaded browse nodes");
        state.loaded.insert(repository.to_string());
        Ok(state)
    }

    /// Write the tree's pending changes. On failure the repository is
    /// dropped from the cache, so the next access reloads what was
    /// actually persisted.
    async fn persist(&self, state: &mut IndexState, repository: &str) -> DepotResult<()> {
        for change in state.tree.take_changes() {
            let result = match &change {
                NodeChange::Upsert(row) => match serde_json::to_value(row) {
                    Ok(value) => self
                        .records
                        .upsert(Table::BrowseNodes, &row.node.repository, &row.node.full_path, value)
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e.into()),
                },
                NodeChange::Remove {
                    repository,
                    full_path,
                } => self
                    .records
                    .remove(Table::BrowseNodes, repository, full_path)
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = result {
                state.tree.clear_repository(repository);
                state.loaded.remove(repository);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Create or update the node chain for a stored artifact
    pub async fn on_asset_stored(&self, key: &ArtifactKey) -> DepotResult<bool> {
        let Some(format) = self.format_for(&key.repository) else {
            return Ok(false);
        };
        let mut state = self.lock(&key.repository).await?;
        let indexed = index_asset(&mut state.tree, format.as_ref(), key);
        self.persist(&mut state, &key.repository).await?;
        Ok(indexed)
    }

    /// Remove an artifact's leaf and prune emptied ancestors
    pub async fn on_asset_deleted(&self, key: &ArtifactKey) -> DepotResult<bool> {
        let mut state = self.lock(&key.repository).await?;
        let removed = state.tree.remove_asset(&key.repository, &key.path);
        self.persist(&mut state, &key.repository).await?;
        Ok(removed)
    }

    /// Apply one store event.
    ///
    /// The store is consulted for the current state of the key, so a
    /// redelivered or reordered event converges on what is actually
    /// stored. The key stays locked from that read until the tree is
    /// updated, so two workers cannot apply stale reads out of order.
    pub async fn handle(&self, event: &StoreEvent) {
        let _guard = self.key_locks.acquire(&event.key).await;
        let present = match self.store.get(&event.key).await {
            Ok(record) => record.is_some_and(|r| r.stored().is_some()),
            Err(e) => {
                warn!(key = %event.key, error = %e, "Store read failed, trusting event kind");
                event.kind == StoreEventKind::Stored
            }
        };

        let result = if present {
            self.on_asset_stored(&event.key).await
        } else {
            self.on_asset_deleted(&event.key).await
        };
        if let Err(e) = result {
            warn!(key = %event.key, error = %e, "Browse index update failed");
        }
    }

    /// Drop every node of a repository and re-index it from the store.
    ///
    /// Cancellation is checked before each page; nodes written by earlier
    /// pages stay in place.
    pub async fn rebuild<F>(
        &self,
        repository: &str,
        cancel: &CancellationToken,
        mut progress: F,
    ) -> DepotResult<RebuildSummary>
    where
        F: FnMut(&str) + Send,
    {
        let format = self.repositories.get(repository)?.format.clone();
        let mut summary = RebuildSummary::default();
        {
            let mut state = self.state.lock().await;
            summary.removed = self
                .records
                .remove_all(Table::BrowseNodes, repository)
                .await? as usize;
            state.tree.clear_repository(repository);
            state.loaded.insert(repository.to_string());
        }

        let total = self.store.count_artifacts(repository).await?;
        info!(repository = %repository, total, "Rebuilding browse index");

        let mut processed: u64 = 0;
        let mut after: Option<String> = None;
        loop {
            if cancel.is_cancelled() {
                warn!(
                    repository = %repository,
                    pages = summary.pages,
                    "Browse rebuild cancelled"
                );
                return Err(DepotError::Cancelled(format!(
                    "rebuild of {} after {} pages",
                    repository, summary.pages
                )));
            }

            let page = self
                .store
                .browse_artifacts(repository, after.as_deref(), self.page_size)
                .await?;
            {
                let mut state = self.lock(repository).await?;
                for record in &page.records {
                    if record.stored().is_some()
                        && index_asset(&mut state.tree, format.as_ref(), &record.key)
                    {
                        summary.assets += 1;
                    }
                }
                self.persist(&mut state, repository).await?;
            }

            processed += page.records.len() as u64;
            summary.pages += 1;
            let percent = if total == 0 {
                100
            } else {
                (processed * 100 / total).min(100)
            };
            progress(&format!("{}% Complete", percent));
            info!(
                repository = %repository,
                page = summary.pages,
                processed,
                total,
                "Rebuild progress"
            );

            match page.next {
                Some(next) => after = Some(next),
                None => break,
            }
        }

        Ok(summary)
    }

    /// Children of the node at `display_path`; the root when empty
    pub async fn get_by_display_path(
        &self,
        repository: &str,
        display_path: &[&str],
        limit: usize,
        filter: Option<&str>,
    ) -> DepotResult<Vec<BrowseNode>> {
        let state = self.lock(repository).await?;
        Ok(state.tree.children(repository, display_path, limit, filter))
    }

    /// Node a client request path resolves to
    pub async fn resolve_request_path(
        &self,
        repository: &str,
        path: &str,
    ) -> DepotResult<Option<BrowseNode>> {
        let state = self.lock(repository).await?;
        Ok(state.tree.resolve_request_path(repository, path).cloned())
    }

    /// Prune every childless intermediate node of a repository
    pub async fn trim(&self, repository: &str) -> DepotResult<usize> {
        let mut state = self.lock(repository).await?;
        let removed = state.tree.trim(repository);
        self.persist(&mut state, repository).await?;
        if removed > 0 {
            info!(repository = %repository, removed, "Trimmed browse nodes");
        }
        Ok(removed)
    }

    /// Drop every node of a repository
    pub async fn clear(&self, repository: &str) -> DepotResult<u64> {
        let mut state = self.state.lock().await;
        let removed = self
            .records
            .remove_all(Table::BrowseNodes, repository)
            .await?;
        state.tree.clear_repository(repository);
        state.loaded.insert(repository.to_string());
        Ok(removed)
    }

    /// Every node of a repository, ordered by full path
    pub async fn nodes(&self, repository: &str) -> DepotResult<Vec<BrowseNode>> {
        let state = self.lock(repository).await?;
        Ok(state.tree.nodes(repository))
    }
}

fn index_asset(tree: &mut BrowseTree, format: &dyn Format, key: &ArtifactKey) -> bool {
    let segments = format.browse_paths(&key.path);
    if tree
        .insert_asset(&key.repository, &key.path, &segments)
        .is_none()
    {
        return false;
    }
    if let Some(component) = format.component_path(&key.path) {
        tree.insert_component(&key.repository, &component, &key.path);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{NpmFormat, RawFormat};
    use crate::repository::Repository;
    use crate::store::model::{NewArtifact, Validators};
    use crate::store::{FileBlobStore, FileRecordStore, MemoryBlobStore, MemoryRecordStore, Versioned, WriteOutcome};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    fn registry() -> RepositoryRegistry {
        let mut registry = RepositoryRegistry::new();
        registry.insert(Repository::hosted("r1", Arc::new(RawFormat)));
        registry.insert(Repository::hosted("npm", Arc::new(NpmFormat)));
        registry
    }

    async fn put(store: &ContentStore, repository: &str, path: &str) -> ArtifactKey {
        let key = ArtifactKey::new(repository, path);
        store
            .put(
                &key,
                Bytes::from_static(b"x"),
                NewArtifact {
                    content_type: "application/octet-stream".to_string(),
                    validators: Validators::default(),
                    expires_at: Utc::now() + Duration::hours(1),
                    ..NewArtifact::default()
                },
            )
            .await
            .unwrap();
        key
    }

    async fn assert_consistent(index: &BrowseIndex, repository: &str) {
        let nodes = index.nodes(repository).await.unwrap();
        for node in &nodes {
            let has_children = nodes.iter().any(|n| n.parent_id == Some(node.id));
            assert!(
                node.is_referenced() || has_children,
                "dangling node {}",
                node.full_path
            );
        }
    }

    #[tokio::test]
    async fn stored_asset_is_listed_under_its_directory() {
        let store = Arc::new(ContentStore::in_memory());
        let index = BrowseIndex::new(store.clone(), registry());
        let key = put(&store, "r1", "lib/foo-1.0.tgz").await;

        assert!(index.on_asset_stored(&key).await.unwrap());
        let children = index
            .get_by_display_path("r1", &["lib"], 10, None)
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "foo-1.0.tgz");
        assert_eq!(children[0].ref_kind(), RefKind::Asset);
    }

    #[tokio::test]
    async fn deleting_sole_asset_prunes_chain() {
        let store = Arc::new(ContentStore::in_memory());
        let index = BrowseIndex::new(store.clone(), registry());
        let key = put(&store, "r1", "a/b/c.jar").await;
        index.on_asset_stored(&key).await.unwrap();

        store.delete(&key).await.unwrap();
        index.handle(&StoreEvent::deleted(key)).await;
        assert!(index.nodes("r1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn handlers_are_idempotent_and_reconcile_with_store() {
        let store = Arc::new(ContentStore::in_memory());
        let index = BrowseIndex::new(store.clone(), registry());
        let key = put(&store, "r1", "a/b/c.jar").await;

        let event = StoreEvent::stored(key.clone());
        index.handle(&event).await;
        index.handle(&event).await;
        assert_eq!(index.nodes("r1").await.unwrap().len(), 3);

        // A stale Stored event for a key that is gone removes it instead
        store.delete(&key).await.unwrap();
        index.handle(&event).await;
        assert!(index.nodes("r1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rebuild_indexes_every_stored_artifact() {
        let store = Arc::new(ContentStore::in_memory());
        let index = BrowseIndex::new(store.clone(), registry()).with_page_size(4);
        let paths = ["a/b/c.jar", "a/d.jar", "lib/foo-1.0.tgz", "top.txt", "z/y/x/w"];
        for path in paths {
            put(&store, "r1", path).await;
        }
        store
            .put_negative(
                &ArtifactKey::new("r1", "missing/file"),
                Validators::default(),
                Utc::now() + Duration::hours(1),
            )
            .await
            .unwrap();

        let mut reports = vec![];
        let summary = index
            .rebuild("r1", &CancellationToken::new(), |p| reports.push(p.to_string()))
            .await
            .unwrap();

        assert_eq!(summary.assets, 5);
        assert_eq!(summary.pages, 2);
        assert_eq!(reports.last().map(String::as_str), Some("100% Complete"));
        for path in paths {
            let node = index.resolve_request_path("r1", path).await.unwrap().unwrap();
            assert_eq!(node.asset_ref.as_deref(), Some(path));
        }
        assert!(index
            .resolve_request_path("r1", "missing/file")
            .await
            .unwrap()
            .is_none());
        assert_consistent(&index, "r1").await;
    }

    #[tokio::test]
    async fn rebuild_replaces_stale_nodes() {
        let store = Arc::new(ContentStore::in_memory());
        let index = BrowseIndex::new(store.clone(), registry());
        let key = put(&store, "r1", "old/file").await;
        index.on_asset_stored(&key).await.unwrap();
        // Index drifted: the store lost the artifact without an event
        store.delete(&key).await.unwrap();
        put(&store, "r1", "new/file").await;

        let summary = index
            .rebuild("r1", &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(summary.removed, 2);
        assert!(index
            .resolve_request_path("r1", "old/file")
            .await
            .unwrap()
            .is_none());
        assert!(index
            .resolve_request_path("r1", "new/file")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn rebuild_cancels_between_pages() {
        let store = Arc::new(ContentStore::in_memory());
        let index = BrowseIndex::new(store.clone(), registry()).with_page_size(1);
        for path in ["a", "b", "c"] {
            put(&store, "r1", path).await;
        }

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let err = index
            .rebuild("r1", &cancel, |_| trigger.cancel())
            .await
            .unwrap_err();

        assert!(matches!(err, DepotError::Cancelled(_)));
        // The first page stays indexed
        assert_eq!(index.nodes("r1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rebuild_of_unknown_repository_fails() {
        let index = BrowseIndex::new(Arc::new(ContentStore::in_memory()), registry());
        let err = index
            .rebuild("nope", &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DepotError::RepositoryNotFound(_)));
    }

    #[tokio::test]
    async fn npm_tarballs_get_component_nodes() {
        let store = Arc::new(ContentStore::in_memory());
        let index = BrowseIndex::new(store.clone(), registry());
        let root = put(&store, "npm", "@acme/widget").await;
        let tarball = put(&store, "npm", "@acme/widget/-/widget-1.0.0.tgz").await;
        index.on_asset_stored(&root).await.unwrap();
        index.on_asset_stored(&tarball).await.unwrap();

        let under_package = index
            .get_by_display_path("npm", &["@acme", "widget"], 10, None)
            .await
            .unwrap();
        let names: Vec<_> = under_package.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["-", "1.0.0"]);
        assert_eq!(under_package[1].ref_kind(), RefKind::Component);

        let package = index
            .resolve_request_path("npm", "@acme/widget")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(package.ref_kind(), RefKind::Asset);

        index.on_asset_deleted(&tarball).await.unwrap();
        assert!(index
            .get_by_display_path("npm", &["@acme", "widget"], 10, None)
            .await
            .unwrap()
            .is_empty());
        assert_consistent(&index, "npm").await;
    }

    #[tokio::test]
    async fn workers_drain_published_events() {
        let store = Arc::new(ContentStore::in_memory());
        let index = Arc::new(BrowseIndex::new(store.clone(), registry()));
        let (publisher, workers) = IndexWorkers::spawn(index.clone(), 2, 1);
        assert_eq!(workers.len(), 2);

        let mut keys = vec![];
        for i in 0..10 {
            let key = put(&store, "r1", &format!("dir/file-{}", i)).await;
            publisher.publish(StoreEvent::stored(key.clone()));
            keys.push(key);
        }
        publisher.wait_idle().await;
        let listed = index
            .get_by_display_path("r1", &["dir"], 100, None)
            .await
            .unwrap();
        assert_eq!(listed.len(), 10);

        for key in keys {
            store.delete(&key).await.unwrap();
            publisher.publish(StoreEvent::deleted(key));
        }
        publisher.wait_idle().await;
        assert!(index.nodes("r1").await.unwrap().is_empty());
        assert_eq!(publisher.pending(), 0);

        workers.shutdown().await;
    }

    fn file_store(root: &std::path::Path) -> Arc<ContentStore> {
        Arc::new(ContentStore::new(
            Arc::new(FileRecordStore::new(root.join("records"))),
            Arc::new(FileBlobStore::new(root.join("blobs"))),
        ))
    }

    #[tokio::test]
    async fn nodes_survive_restart() {
        let temp = TempDir::new().unwrap();
        {
            let store = file_store(temp.path());
            let index = BrowseIndex::new(store.clone(), registry());
            let key = put(&store, "r1", "lib/foo-1.0.tgz").await;
            index.on_asset_stored(&key).await.unwrap();
        }

        let index = BrowseIndex::new(file_store(temp.path()), registry());
        let node = index
            .resolve_request_path("r1", "lib/foo-1.0.tgz")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.asset_ref.as_deref(), Some("lib/foo-1.0.tgz"));
        let lib = index.get_by_display_path("r1", &[], 10, None).await.unwrap();
        assert_eq!(lib[0].id, node.parent_id.unwrap());

        // Deletes after the restart prune the persisted chain too
        index
            .on_asset_deleted(&ArtifactKey::new("r1", "lib/foo-1.0.tgz"))
            .await
            .unwrap();
        let reopened = BrowseIndex::new(file_store(temp.path()), registry());
        assert!(reopened.nodes("r1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rebuild_is_visible_to_later_processes() {
        let temp = TempDir::new().unwrap();
        let store = file_store(temp.path());
        for path in ["a/b/c.jar", "a/d.jar", "top.txt"] {
            put(&store, "r1", path).await;
        }

        let summary = BrowseIndex::new(store, registry())
            .with_page_size(2)
            .rebuild("r1", &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(summary.assets, 3);

        let index = BrowseIndex::new(file_store(temp.path()), registry());
        assert_eq!(index.nodes("r1").await.unwrap().len(), 5);
        assert!(index
            .resolve_request_path("r1", "a/b/c.jar")
            .await
            .unwrap()
            .is_some());
        assert_consistent(&index, "r1").await;
    }

    /// Artifact reads that pause after reading while armed, so a second
    /// event for the same key can be delivered in between
    struct PausingReads {
        inner: MemoryRecordStore,
        armed: AtomicBool,
        read_done: Notify,
    }

    #[async_trait]
    impl RecordStore for PausingReads {
        async fn load(&self, t: Table, r: &str, id: &str) -> DepotResult<Option<Versioned>> {
            let loaded = self.inner.load(t, r, id).await;
            if t == Table::Artifacts && self.armed.swap(false, Ordering::SeqCst) {
                self.read_done.notify_one();
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            loaded
        }

        async fn compare_and_swap(
            &self,
            t: Table,
            r: &str,
            id: &str,
            expected: Option<u64>,
            value: serde_json::Value,
        ) -> DepotResult<WriteOutcome> {
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

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_stored_event_cannot_overtake_later_delete() {
        let records = Arc::new(PausingReads {
            inner: MemoryRecordStore::new(),
            armed: AtomicBool::new(false),
            read_done: Notify::new(),
        });
        let store = Arc::new(ContentStore::new(records.clone(), Arc::new(MemoryBlobStore::new())));
        let index = Arc::new(BrowseIndex::new(store.clone(), registry()));
        let (publisher, workers) = IndexWorkers::spawn(index.clone(), 2, 8);

        let key = put(&store, "r1", "pkg/a.tgz").await;
        index.on_asset_stored(&key).await.unwrap();

        // The first worker reads "present" and stalls before applying it
        records.armed.store(true, Ordering::SeqCst);
        publisher.publish(StoreEvent::stored(key.clone()));
        records.read_done.notified().await;

        // The second worker sees the delete while the first is stalled
        store.delete(&key).await.unwrap();
        publisher.publish(StoreEvent::deleted(key.clone()));
        publisher.wait_idle().await;

        assert!(index
            .resolve_request_path("r1", "pkg/a.tgz")
            .await
            .unwrap()
            .is_none());
        assert!(index.nodes("r1").await.unwrap().is_empty());
        workers.shutdown().await;
    }

    #[tokio::test]
    async fn trim_prunes_empty_intermediates() {
        let store = Arc::new(ContentStore::in_memory());
        let index = BrowseIndex::new(store.clone(), registry());
        let key = put(&store, "r1", "a/b/c.jar").await;
        index.on_asset_stored(&key).await.unwrap();
        assert_eq!(index.trim("r1").await.unwrap(), 0);
        assert_eq!(index.nodes("r1").await.unwrap().len(), 3);
    }
}
