//! The set of configured nodes, keyed by node id.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::client::NodeClient;

/// Immutable lookup of configured nodes. Built once at startup.
#[derive(Default, Clone)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, Arc<dyn NodeClient>>,
}

impl NodeRegistry {
    pub fn new(nodes: impl IntoIterator<Item = Arc<dyn NodeClient>>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|n| (n.node_id().to_string(), n))
                .collect(),
        }
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<dyn NodeClient>> {
        self.nodes.get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Node ids in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn NodeClient>> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
