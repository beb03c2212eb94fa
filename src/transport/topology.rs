//! Communication-range graph supplied from outside the protocol.

use crate::transport::NodeId;
use std::collections::{BTreeMap, BTreeSet};

/// Which nodes can hear which. Edges are directed; `connect` adds both.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    in_range: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl Topology {
    /// Empty topology
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `a` and `b` in range of each other
    pub fn connect(&mut self, a: &NodeId, b: &NodeId) {
        self.connect_directed(a, b);
        self.connect_directed(b, a);
    }

    /// Let `to` hear `from`, but not the other way around
    pub fn connect_directed(&mut self, from: &NodeId, to: &NodeId) {
        if from != to {
            self.in_range
                .entry(from.clone())
                .or_default()
                .insert(to.clone());
        }
    }

    /// Take `a` and `b` out of range of each other
    pub fn disconnect(&mut self, a: &NodeId, b: &NodeId) {
        if let Some(set) = self.in_range.get_mut(a) {
            set.remove(b);
        }
        if let Some(set) = self.in_range.get_mut(b) {
            set.remove(a);
        }
    }

    /// Nodes that hear `node`, in id order
    pub fn neighbors(&self, node: &NodeId) -> Vec<NodeId> {
        self.in_range
            .get(node)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}
