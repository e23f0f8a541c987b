//! Browse tree nodes

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Node identifier, derived from the node's repository and display path
pub type NodeId = u64;

/// Id of the node at `full_path`; stable across processes and rebuilds
pub fn node_id(repository: &str, full_path: &str) -> NodeId {
    let digest = Sha256::new()
        .chain_update(repository.as_bytes())
        .chain_update([0u8])
        .chain_update(full_path.as_bytes())
        .finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// What a node points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RefKind {
    Asset,
    Component,
    /// Directory-like node that only exists to hold children
    Intermediate,
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asset => write!(f, "ASSET"),
            Self::Component => write!(f, "COMPONENT"),
            Self::Intermediate => write!(f, "INTERMEDIATE"),
        }
    }
}

/// One path segment of a repository's browse tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseNode {
    pub id: NodeId,
    pub repository: String,
    pub parent_id: Option<NodeId>,
    pub name: String,
    /// Segment names from the root joined with `/`
    pub full_path: String,
    /// Client path that resolves to this node
    pub request_path: Option<String>,
    /// Path of the stored artifact this node stands for
    pub asset_ref: Option<String>,
    /// Component identifier this node stands for
    pub component_ref: Option<String>,
}

impl BrowseNode {
    /// Asset wins when a node references both
    pub fn ref_kind(&self) -> RefKind {
        if self.asset_ref.is_some() {
            RefKind::Asset
        } else if self.component_ref.is_some() {
            RefKind::Component
        } else {
            RefKind::Intermediate
        }
    }

    pub fn ref_id(&self) -> Option<&str> {
        self.asset_ref
            .as_deref()
            .or(self.component_ref.as_deref())
    }

    pub fn is_referenced(&self) -> bool {
        self.asset_ref.is_some() || self.component_ref.is_some()
    }
}

/// Persisted form of a node, one row per display path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRow {
    pub node: BrowseNode,
    /// Assets keeping a component node alive
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component_assets: Vec<String>,
}
