//! Node lease table.
//!
//! A node is either free or leased to exactly one job. The dispatcher
//! acquires; the owning monitor (or the dispatcher, when submission
//! fails) releases. Those are the only mutations.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use forgefleet_core::types::{DbId, NodeId};

#[derive(Debug, Default)]
pub struct NodeLeases {
    slots: Mutex<BTreeMap<NodeId, Option<DbId>>>,
}

impl NodeLeases {
    /// A table with every node in `nodes` free.
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self {
            slots: Mutex::new(nodes.into_iter().map(|n| (n.into(), None)).collect()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, BTreeMap<NodeId, Option<DbId>>> {
        // No critical section can panic midway, so a poisoned map is still consistent.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease `node` to `job_id`. Fails if the node is unknown or already leased.
    pub fn try_acquire(&self, node: &str, job_id: DbId) -> bool {
        match self.slots().get_mut(node) {
            Some(slot) if slot.is_none() => {
                *slot = Some(job_id);
                true
            }
            _ => false,
        }
    }

    /// Release `node` if it is currently leased to `job_id`.
    pub fn release(&self, node: &str, job_id: DbId) -> bool {
        match self.slots().get_mut(node) {
            Some(slot) if *slot == Some(job_id) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub fn holder(&self, node: &str) -> Option<DbId> {
        self.slots().get(node).copied().flatten()
    }

    /// Nodes with no lease, in id order.
    pub fn free_nodes(&self) -> Vec<NodeId> {
        self.slots()
            .iter()
            .filter(|(_, holder)| holder.is_none())
            .map(|(node, _)| node.clone())
            .collect()
    }
}
