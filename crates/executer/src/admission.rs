//! Cluster resource snapshot and task pinning.

use quarry_common::NodeId;
use quarry_graph::TaskType;

/// Resources a node advertises to the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeResources {
    pub node_id: NodeId,
    pub available_memory: u64,
    pub execution_units: u32,
}

impl NodeResources {
    pub fn new(node_id: NodeId, available_memory: u64, execution_units: u32) -> Self {
        Self {
            node_id,
            available_memory,
            execution_units,
        }
    }
}

/// Nodes eligible for unpinned work, ordered by node id.
#[derive(Debug, Clone, Default)]
pub struct ResourcesSnapshot {
    nodes: Vec<NodeResources>,
}

impl ResourcesSnapshot {
    pub fn new(mut nodes: Vec<NodeResources>) -> Self {
        nodes.sort_by_key(|n| n.node_id);
        nodes.dedup_by_key(|n| n.node_id);
        Self { nodes }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[NodeResources] {
        &self.nodes
    }

    pub fn node(&self, node_id: NodeId) -> Option<&NodeResources> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Caps a requested source task count at twice the snapshot size.
    pub fn cap_task_count(&self, requested: usize) -> usize {
        if self.nodes.is_empty() {
            requested
        } else {
            requested.min(self.nodes.len() * 2)
        }
    }

    /// Placement for the `index`-th task of a source stage.
    pub fn pin(&self, index: usize) -> (TaskType, Option<NodeId>) {
        if self.nodes.is_empty() {
            (TaskType::Compute, None)
        } else {
            let node = self.nodes[index % self.nodes.len()].node_id;
            (TaskType::Scan, Some(node))
        }
    }
}

/// Round-robin placement over the snapshot, falling back to one node.
#[derive(Debug)]
pub struct RoundRobinPlacement {
    nodes: Vec<NodeId>,
    fallback: NodeId,
    next: usize,
}

impl RoundRobinPlacement {
    pub fn new(snapshot: &ResourcesSnapshot, fallback: NodeId) -> Self {
        Self {
            nodes: snapshot.nodes().iter().map(|n| n.node_id).collect(),
            fallback,
            next: 0,
        }
    }

    pub fn next_node(&mut self) -> NodeId {
        if self.nodes.is_empty() {
            return self.fallback;
        }
        let node = self.nodes[self.next % self.nodes.len()];
        self.next += 1;
        node
    }
}
