use crate::fixed::{Fixed64, fixed64_to_f64};
use crate::id::*;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap};
use std::collections::VecDeque;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during graph operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("node not found: {0:?}")]
    NodeNotFound(NodeId),
    #[error("connection not found: {0:?}")]
    ConnectionNotFound(ConnectionId),
    #[error("invalid connection weight: {0}")]
    InvalidWeight(f64),
    #[error("a node cannot be connected to itself")]
    SelfConnection,
    #[error("{from:?} is already connected to {to:?}")]
    ConnectionExists { from: NodeId, to: NodeId },
}

/// Largest accepted connection weight.
pub const MAX_WEIGHT: f64 = 1_000_000.0;

fn validate_weight(weight: Fixed64) -> Result<(), GraphError> {
    if weight < Fixed64::ZERO || weight > Fixed64::from_num(MAX_WEIGHT) {
        return Err(GraphError::InvalidWeight(fixed64_to_f64(weight)));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Core data structures
// ---------------------------------------------------------------------------

/// Adjacency lists for a single node, tracking incoming and outgoing edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NodeAdjacency {
    /// Connections whose target is this node.
    inputs: Vec<ConnectionId>,
    /// Connections whose source is this node.
    outputs: Vec<ConnectionId>,
}

/// Per-node data stored in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    /// The node type this node was deployed from.
    pub node_type: NodeTypeId,
}

/// Per-connection data stored in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionData {
    pub source: NodeId,
    pub target: NodeId,
    pub weight: Fixed64,
}

/// A topology change recorded by the graph.
///
/// Changes accumulate until the engine drains them, within the same tick,
/// to run orphan detection and persistence.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphChange {
    ConnectionAdded {
        connection: ConnectionId,
        source: NodeId,
        target: NodeId,
    },
    ConnectionRemoved {
        connection: ConnectionId,
        source: NodeId,
        target: NodeId,
    },
    WeightChanged {
        connection: ConnectionId,
        source: NodeId,
        weight: Fixed64,
    },
}

// ---------------------------------------------------------------------------
// ConnectionGraph
// ---------------------------------------------------------------------------

/// The connection graph: nodes (structures) and weighted connections.
///
/// Adjacency is stored in a `SecondaryMap` keyed by `NodeId`, which keeps it
/// in key-sync with the primary `nodes` SlotMap. Each connection is stored
/// once and appears in the source's outputs and the target's inputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionGraph {
    nodes: SlotMap<NodeId, GraphNode>,
    connections: SlotMap<ConnectionId, ConnectionData>,
    adjacency: SecondaryMap<NodeId, NodeAdjacency>,

    /// Changes not yet drained by the engine.
    #[serde(skip)]
    changes: Vec<GraphChange>,
}

impl ConnectionGraph {
    /// Create a new, empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Add a node. Returns the assigned `NodeId`.
    pub fn add_node(&mut self, node_type: NodeTypeId) -> NodeId {
        let node = self.nodes.insert(GraphNode { node_type });
        self.adjacency.insert(node, NodeAdjacency::default());
        node
    }

    /// Remove a node and every connection touching it.
    ///
    /// Returns the removed connections. Removing a missing node is a no-op.
    pub fn remove_node(&mut self, node: NodeId) -> Vec<(ConnectionId, ConnectionData)> {
        let incident: Vec<ConnectionId> = match self.adjacency.get(node) {
            Some(adj) => adj.inputs.iter().chain(adj.outputs.iter()).copied().collect(),
            None => return Vec::new(),
        };

        let mut removed = Vec::with_capacity(incident.len());
        for connection in incident {
            if let Ok(data) = self.remove_connection(connection) {
                removed.push((connection, data));
            }
        }

        self.nodes.remove(node);
        self.adjacency.remove(node);
        removed
    }

    /// Connect `source` to `target` with the given weight.
    pub fn add_connection(
        &mut self,
        source: NodeId,
        target: NodeId,
        weight: Fixed64,
    ) -> Result<ConnectionId, GraphError> {
        if !self.nodes.contains_key(source) {
            return Err(GraphError::NodeNotFound(source));
        }
        if !self.nodes.contains_key(target) {
            return Err(GraphError::NodeNotFound(target));
        }
        if source == target {
            return Err(GraphError::SelfConnection);
        }
        validate_weight(weight)?;
        if self.find_connection(source, target).is_some() {
            return Err(GraphError::ConnectionExists {
                from: source,
                to: target,
            });
        }

        let connection = self.connections.insert(ConnectionData {
            source,
            target,
            weight,
        });
        if let Some(adj) = self.adjacency.get_mut(source) {
            adj.outputs.push(connection);
        }
        if let Some(adj) = self.adjacency.get_mut(target) {
            adj.inputs.push(connection);
        }

        self.changes.push(GraphChange::ConnectionAdded {
            connection,
            source,
            target,
        });
        Ok(connection)
    }

    /// Remove a connection. Returns its data.
    pub fn remove_connection(
        &mut self,
        connection: ConnectionId,
    ) -> Result<ConnectionData, GraphError> {
        let data = self
            .connections
            .remove(connection)
            .ok_or(GraphError::ConnectionNotFound(connection))?;

        if let Some(adj) = self.adjacency.get_mut(data.source) {
            adj.outputs.retain(|&c| c != connection);
        }
        if let Some(adj) = self.adjacency.get_mut(data.target) {
            adj.inputs.retain(|&c| c != connection);
        }

        self.changes.push(GraphChange::ConnectionRemoved {
            connection,
            source: data.source,
            target: data.target,
        });
        Ok(data)
    }

    /// Change the weight of an existing connection.
    pub fn set_weight(&mut self, connection: ConnectionId, weight: Fixed64) -> Result<(), GraphError> {
        validate_weight(weight)?;
        let data = self
            .connections
            .get_mut(connection)
            .ok_or(GraphError::ConnectionNotFound(connection))?;
        data.weight = weight;
        let source = data.source;
        self.changes.push(GraphChange::WeightChanged {
            connection,
            source,
            weight,
        });
        Ok(())
    }

    /// Take all changes recorded since the last drain.
    pub fn drain_changes(&mut self) -> Vec<GraphChange> {
        std::mem::take(&mut self.changes)
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_node(&self, node: NodeId) -> Option<&GraphNode> {
        self.nodes.get(node)
    }

    pub fn get_connection(&self, connection: ConnectionId) -> Option<&ConnectionData> {
        self.connections.get(connection)
    }

    /// The connection from `source` to `target`, if any.
    pub fn find_connection(&self, source: NodeId, target: NodeId) -> Option<ConnectionId> {
        self.out_connections(source)
            .iter()
            .copied()
            .find(|&c| self.connections.get(c).is_some_and(|d| d.target == target))
    }

    /// Connections whose source is `node`, in insertion order.
    pub fn out_connections(&self, node: NodeId) -> &[ConnectionId] {
        self.adjacency
            .get(node)
            .map(|adj| adj.outputs.as_slice())
            .unwrap_or(&[])
    }

    /// Connections whose target is `node`, in insertion order.
    pub fn in_connections(&self, node: NodeId) -> &[ConnectionId] {
        self.adjacency
            .get(node)
            .map(|adj| adj.inputs.as_slice())
            .unwrap_or(&[])
    }

    /// Nodes adjacent to `node` in either direction, outputs first.
    pub fn neighbors(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let outs = self
            .out_connections(node)
            .iter()
            .filter_map(|&c| self.connections.get(c).map(|d| d.target));
        let ins = self
            .in_connections(node)
            .iter()
            .filter_map(|&c| self.connections.get(c).map(|d| d.source));
        outs.chain(ins)
    }

    /// The network of `node`: every node reachable over connections in either
    /// direction, including `node` itself.
    ///
    /// Breadth-first, so the result is ordered by hop distance; nodes at the
    /// same distance follow connection insertion order (outputs before
    /// inputs). Empty if `node` does not exist.
    pub fn network(&self, node: NodeId) -> Vec<NodeId> {
        if !self.nodes.contains_key(node) {
            return Vec::new();
        }

        let mut visited: SecondaryMap<NodeId, ()> = SecondaryMap::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::new();

        visited.insert(node, ());
        queue.push_back(node);

        while let Some(current) = queue.pop_front() {
            order.push(current);
            for next in self.neighbors(current) {
                if !visited.contains_key(next) {
                    visited.insert(next, ());
                    queue.push_back(next);
                }
            }
        }

        order
    }

    /// Whether `other` is in the network of `node`.
    pub fn network_contains(&self, node: NodeId, other: NodeId) -> bool {
        self.network(node).contains(&other)
    }

    /// Partition every node into networks. Networks are listed in order of
    /// their first node's slot-map position.
    pub fn networks(&self) -> Vec<Vec<NodeId>> {
        let mut seen: SecondaryMap<NodeId, ()> = SecondaryMap::new();
        let mut result = Vec::new();
        for (node, _) in &self.nodes {
            if seen.contains_key(node) {
                continue;
            }
            let network = self.network(node);
            for &member in &network {
                seen.insert(member, ());
            }
            result.push(network);
        }
        result
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn contains_connection(&self, connection: ConnectionId) -> bool {
        self.connections.contains_key(connection)
    }

    /// Iterate over all node IDs and their data.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &GraphNode)> {
        self.nodes.iter()
    }

    /// Iterate over all connections.
    pub fn connections(&self) -> impl Iterator<Item = (ConnectionId, &ConnectionData)> {
        self.connections.iter()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
