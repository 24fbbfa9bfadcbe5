//! Flat XOR-distance routing table

use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::common::{ClosestNodes, Id, NodeInfo};
use crate::{Error, Result};

#[derive(Debug, Clone)]
/// Known peers of the local node and their addresses.
pub struct RoutingTable {
    id: Id,
    nodes: BTreeMap<Id, NodeInfo>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            nodes: BTreeMap::new(),
        }
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    // === Public Methods ===

    /// Attempts to add a node to this routing table, and return `true` if it did.
    ///
    /// Nodes with an id already in the table, or with the local id, are rejected.
    pub fn add(&mut self, node: NodeInfo) -> bool {
        if node.id == self.id {
            // Do not add self to the routing_table
            return false;
        }

        if self.nodes.contains_key(&node.id) {
            return false;
        }

        self.nodes.insert(node.id, node);

        true
    }

    /// Remove a node from this routing table.
    pub fn remove(&mut self, node_id: &Id) -> Option<NodeInfo> {
        self.nodes.remove(node_id)
    }

    /// Remove the node reachable at `address`.
    pub fn remove_by_address(&mut self, address: &SocketAddr) -> Option<NodeInfo> {
        let id = self
            .nodes
            .values()
            .find(|node| &node.address == address)
            .map(|node| node.id)?;

        self.nodes.remove(&id)
    }

    /// Returns the node with this id, if known.
    pub fn get(&self, node_id: &Id) -> Option<&NodeInfo> {
        self.nodes.get(node_id)
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Returns an iterator over the nodes in this routing table, ordered by id.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    /// Export an owned vector of nodes from this routing table.
    pub fn to_owned_nodes(&self) -> Vec<NodeInfo> {
        self.nodes().copied().collect()
    }

    /// Return the `n` nodes closest to `target`, nearest first.
    pub fn closest_nodes(&self, target: &Id, n: usize) -> Vec<NodeInfo> {
        let mut closest = ClosestNodes::new(*target, n);

        for node in self.nodes() {
            closest.add(*node);
        }

        closest.into_sorted_vec()
    }

    /// Return the `index`-th closest node to `target`, `0` being the nearest.
    ///
    /// Returns [Error::EmptyRoutingTable] if the table holds no node at that rank.
    pub fn closest_node(&self, target: &Id, index: usize) -> Result<NodeInfo> {
        self.closest_nodes(target, index.saturating_add(1))
            .get(index)
            .copied()
            .ok_or(Error::EmptyRoutingTable)
    }

    /// Returns `true` if no known node is closer to `target` than the local id.
    pub fn am_i_closest(&self, target: &Id) -> bool {
        !self
            .nodes()
            .any(|node| target.cmp_distance(&node.id, &self.id).is_lt())
    }
}
