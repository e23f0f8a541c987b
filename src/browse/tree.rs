//! In-memory browse tree
//!
//! Nodes are indexed by `(repository, parent)` for child listings, by full
//! display path, by client request path, and by the asset or component they
//! reference. A node survives only while it references something or has
//! children; removing the last reference prunes upward.
//!
//! The tree is a cache of the persisted node rows. Every mutation records
//! the display paths it touched, and [`BrowseTree::take_changes`] turns
//! them into the row writes that bring the record store up to date.

use super::node::{node_id, BrowseNode, NodeId, NodeRow};
use crate::format::{BrowsePath, ComponentPath};
use crate::store::model::normalize_path;
use std::collections::{BTreeMap, BTreeSet, HashMap};

type RepoKey = (String, String);

fn repo_key(repository: &str, value: &str) -> RepoKey {
    (repository.to_string(), value.to_string())
}

/// Row write needed to persist a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeChange {
    Upsert(NodeRow),
    Remove { repository: String, full_path: String },
}

#[derive(Debug, Default)]
pub struct BrowseTree {
    nodes: HashMap<NodeId, BrowseNode>,
    children: HashMap<(String, Option<NodeId>), BTreeMap<String, NodeId>>,
    by_path: HashMap<RepoKey, NodeId>,
    by_request_path: HashMap<RepoKey, NodeId>,
    by_asset: HashMap<RepoKey, NodeId>,
    by_component: HashMap<RepoKey, NodeId>,
    /// Assets that keep a component node alive
    component_assets: HashMap<RepoKey, BTreeSet<String>>,
    asset_component: HashMap<RepoKey, String>,
    /// Display paths changed since the last `take_changes`
    touched: BTreeSet<RepoKey>,
}

impl BrowseTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update the chain for an asset; idempotent
    pub fn insert_asset(
        &mut self,
        repository: &str,
        asset_path: &str,
        segments: &[BrowsePath],
    ) -> Option<NodeId> {
        let leaf = self.ensure_chain(repository, segments)?;

        if let Some(previous) = self
            .by_asset
            .insert(repo_key(repository, asset_path), leaf)
        {
            if previous != leaf {
                if let Some(node) = self.nodes.get_mut(&previous) {
                    node.asset_ref = None;
                }
                self.touch(previous);
                self.prune(previous);
            }
        }
        if let Some(node) = self.nodes.get_mut(&leaf) {
            if node.asset_ref.as_deref() != Some(asset_path) {
                node.asset_ref = Some(asset_path.to_string());
                self.touch(leaf);
            }
        }
        Some(leaf)
    }

    /// Create or update a component chain kept alive by `asset_path`
    pub fn insert_component(
        &mut self,
        repository: &str,
        component: &ComponentPath,
        asset_path: &str,
    ) -> Option<NodeId> {
        let leaf = self.ensure_chain(repository, &component.segments)?;
        let component_key = repo_key(repository, &component.id);

        if let Some(node) = self.nodes.get_mut(&leaf) {
            node.component_ref = Some(component.id.clone());
        }
        self.by_component.insert(component_key.clone(), leaf);
        let added = self
            .component_assets
            .entry(component_key)
            .or_default()
            .insert(asset_path.to_string());
        if added {
            self.touch(leaf);
        }
        self.asset_component
            .insert(repo_key(repository, asset_path), component.id.clone());
        Some(leaf)
    }

    /// Drop an asset's references and prune what is left empty
    pub fn remove_asset(&mut self, repository: &str, asset_path: &str) -> bool {
        let key = repo_key(repository, asset_path);
        let mut removed = false;

        if let Some(id) = self.by_asset.remove(&key) {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.asset_ref = None;
            }
            self.touch(id);
            self.prune(id);
            removed = true;
        }

        if let Some(component) = self.asset_component.remove(&key) {
            let component_key = repo_key(repository, &component);
            let orphaned = match self.component_assets.get_mut(&component_key) {
                Some(assets) => {
                    assets.remove(asset_path);
                    assets.is_empty()
                }
                None => true,
            };
            let component_node = self.by_component.get(&component_key).copied();
            if orphaned {
                self.component_assets.remove(&component_key);
                self.by_component.remove(&component_key);
                if let Some(id) = component_node {
                    if let Some(node) = self.nodes.get_mut(&id) {
                        node.component_ref = None;
                    }
                    self.touch(id);
                    self.prune(id);
                }
            } else if let Some(id) = component_node {
                self.touch(id);
            }
        }

        removed
    }

    /// Direct children of the node at `display_path` (root when empty),
    /// in name order
    pub fn children(
        &self,
        repository: &str,
        display_path: &[&str],
        limit: usize,
        filter: Option<&str>,
    ) -> Vec<BrowseNode> {
        let parent = if display_path.is_empty() {
            None
        } else {
            match self.by_path.get(&repo_key(repository, &display_path.join("/"))) {
                Some(&id) => Some(id),
                None => return vec![],
            }
        };

        let filter = filter.map(str::to_lowercase);
        self.children
            .get(&(repository.to_string(), parent))
            .into_iter()
            .flat_map(|children| children.values())
            .filter_map(|id| self.nodes.get(id))
            .filter(|node| {
                filter
                    .as_deref()
                    .map_or(true, |f| node.name.to_lowercase().contains(f))
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get(&self, repository: &str, full_path: &str) -> Option<&BrowseNode> {
        self.by_path
            .get(&repo_key(repository, full_path))
            .and_then(|id| self.nodes.get(id))
    }

    pub fn resolve_request_path(&self, repository: &str, path: &str) -> Option<&BrowseNode> {
        self.by_request_path
            .get(&repo_key(repository, &normalize_path(path)))
            .and_then(|id| self.nodes.get(id))
    }

    /// Every node of a repository, ordered by full path
    pub fn nodes(&self, repository: &str) -> Vec<BrowseNode> {
        let mut nodes: Vec<_> = self
            .nodes
            .values()
            .filter(|n| n.repository == repository)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.full_path.cmp(&b.full_path));
        nodes
    }

    pub fn node_count(&self, repository: &str) -> usize {
        self.nodes
            .values()
            .filter(|n| n.repository == repository)
            .count()
    }

    /// Remove every node of a repository, returning how many existed
    pub fn clear_repository(&mut self, repository: &str) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|_, n| n.repository != repository);
        self.children.retain(|(repo, _), _| repo != repository);
        for index in [
            &mut self.by_path,
            &mut self.by_request_path,
            &mut self.by_asset,
            &mut self.by_component,
        ] {
            index.retain(|(repo, _), _| repo != repository);
        }
        self.component_assets.retain(|(repo, _), _| repo != repository);
        self.asset_component.retain(|(repo, _), _| repo != repository);
        self.touched.retain(|(repo, _)| repo != repository);
        before - self.nodes.len()
    }

    /// Persisted form of a node
    pub fn row(&self, id: NodeId) -> Option<NodeRow> {
        let node = self.nodes.get(&id)?;
        let component_assets = node
            .component_ref
            .as_ref()
            .and_then(|c| self.component_assets.get(&repo_key(&node.repository, c)))
            .map(|assets| assets.iter().cloned().collect())
            .unwrap_or_default();
        Some(NodeRow {
            node: node.clone(),
            component_assets,
        })
    }

    /// Load a persisted node without recording a change
    pub fn restore(&mut self, row: NodeRow) {
        let NodeRow {
            node,
            component_assets,
        } = row;
        let id = node.id;
        let repository = node.repository.clone();

        self.children
            .entry((repository.clone(), node.parent_id))
            .or_default()
            .insert(node.name.clone(), id);
        self.by_path
            .insert(repo_key(&repository, &node.full_path), id);
        if let Some(request_path) = &node.request_path {
            self.by_request_path
                .insert(repo_key(&repository, request_path), id);
        }
        if let Some(asset) = &node.asset_ref {
            self.by_asset.insert(repo_key(&repository, asset), id);
        }
        if let Some(component) = &node.component_ref {
            let component_key = repo_key(&repository, component);
            self.by_component.insert(component_key.clone(), id);
            for asset in &component_assets {
                self.asset_component
                    .insert(repo_key(&repository, asset), component.clone());
            }
            self.component_assets
                .entry(component_key)
                .or_default()
                .extend(component_assets);
        }
        self.nodes.insert(id, node);
    }

    /// Row writes for everything touched since the last call
    pub fn take_changes(&mut self) -> Vec<NodeChange> {
        std::mem::take(&mut self.touched)
            .into_iter()
            .map(|(repository, full_path)| {
                let row = self
                    .by_path
                    .get(&repo_key(&repository, &full_path))
                    .and_then(|&id| self.row(id));
                match row {
                    Some(row) => NodeChange::Upsert(row),
                    None => NodeChange::Remove {
                        repository,
                        full_path,
                    },
                }
            })
            .collect()
    }

    /// Prune every unreferenced, childless node of a repository
    pub fn trim(&mut self, repository: &str) -> usize {
        let before = self.node_count(repository);
        let candidates: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.repository == repository && !n.is_referenced())
            .map(|n| n.id)
            .collect();
        for id in candidates {
            self.prune(id);
        }
        before - self.node_count(repository)
    }

    fn ensure_chain(&mut self, repository: &str, segments: &[BrowsePath]) -> Option<NodeId> {
        let mut parent: Option<NodeId> = None;
        let mut full_path = String::new();

        for segment in segments {
            if !full_path.is_empty() {
                full_path.push('/');
            }
            full_path.push_str(&segment.name);

            let path_key = repo_key(repository, &full_path);
            let id = match self.by_path.get(&path_key) {
                Some(&id) => id,
                None => {
                    let id = node_id(repository, &full_path);
                    self.touched.insert(path_key.clone());
                    self.nodes.insert(
                        id,
                        BrowseNode {
                            id,
                            repository: repository.to_string(),
                            parent_id: parent,
                            name: segment.name.clone(),
                            full_path: full_path.clone(),
                            request_path: None,
                            asset_ref: None,
                            component_ref: None,
                        },
                    );
                    self.children
                        .entry((repository.to_string(), parent))
                        .or_default()
                        .insert(segment.name.clone(), id);
                    self.by_path.insert(path_key, id);
                    id
                }
            };

            if let Some(request_path) = &segment.request_path {
                if let Some(node) = self.nodes.get_mut(&id) {
                    if node.request_path.is_none() {
                        node.request_path = Some(request_path.clone());
                        self.by_request_path
                            .insert(repo_key(repository, request_path), id);
                        self.touched.insert(repo_key(repository, &full_path));
                    }
                }
            }
            parent = Some(id);
        }

        parent
    }

    fn touch(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get(&id) {
            self.touched
                .insert(repo_key(&node.repository, &node.full_path));
        }
    }

    fn has_children(&self, repository: &str, id: NodeId) -> bool {
        self.children
            .get(&(repository.to_string(), Some(id)))
            .is_some_and(|c| !c.is_empty())
    }

    /// Remove `id` and then each ancestor while they are empty
    fn prune(&mut self, id: NodeId) {
        let mut current = Some(id);
        while let Some(id) = current {
            let Some(node) = self.nodes.get(&id) else {
                break;
            };
            if node.is_referenced() || self.has_children(&node.repository, id) {
                break;
            }
            current = node.parent_id;
            self.remove_node(id);
        }
    }

    fn remove_node(&mut self, id: NodeId) {
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        self.touched
            .insert(repo_key(&node.repository, &node.full_path));
        let sibling_key = (node.repository.clone(), node.parent_id);
        if let Some(siblings) = self.children.get_mut(&sibling_key) {
            siblings.remove(&node.name);
            if siblings.is_empty() {
                self.children.remove(&sibling_key);
            }
        }
        self.children.remove(&(node.repository.clone(), Some(id)));
        self.by_path
            .remove(&repo_key(&node.repository, &node.full_path));
        if let Some(request_path) = &node.request_path {
            let key = repo_key(&node.repository, request_path);
            if self.by_request_path.get(&key) == Some(&id) {
                self.by_request_path.remove(&key);
            }
        }
    }
}
