//! Site directory: the static cluster map and deterministic statement routing

use serde::{Deserialize, Serialize};

/// A node's identity is its position in the ordered site list.
pub type NodeId = u32;

/// One entry of `site.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub alias: String,
    pub hostname: String,
    pub port: u16,
}

/// The ordered site list, read once at startup and never mutated.
///
/// Routing must agree across every node in the cluster, so the hash is a
/// pinned CRC32 over the key bytes rather than anything seeded per process.
#[derive(Debug, Clone)]
pub struct SiteDirectory {
    sites: Vec<Site>,
}

impl SiteDirectory {
    pub fn new(sites: Vec<Site>) -> Self {
        Self { sites }
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn node_id_of(&self, alias: &str) -> Option<NodeId> {
        self.sites
            .iter()
            .position(|s| s.alias == alias)
            .map(|i| i as NodeId)
    }

    pub fn site(&self, node: NodeId) -> Option<&Site> {
        self.sites.get(node as usize)
    }

    /// Endpoint for a statement key: `crc32(key) mod |sites|`.
    pub fn route(&self, key: &str) -> NodeId {
        crc32fast::hash(key.as_bytes()) % self.sites.len() as u32
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Site)> {
        self.sites
            .iter()
            .enumerate()
            .map(|(i, s)| (i as NodeId, s))
    }
}
