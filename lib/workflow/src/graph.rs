//! Rule graph implementation using petgraph.
//!
//! Rules are directed acyclic graphs where:
//! - Nodes are action steps with named output ports
//! - Edges leave an output port and enter the next node
//!
//! Nodes live in a petgraph arena and are addressed by index internally.
//! On the wire the graph is a flat list of nodes and a flat list of edges.

use crate::edge::{Edge, EdgeRef};
use crate::error::GraphError;
use crate::node::Node;
use autorule_core::NodeId;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef as _};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A rule graph using petgraph's directed graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "GraphRepr", into = "GraphRepr")]
pub struct RuleGraph {
    /// The underlying directed graph.
    graph: DiGraph<Node, Edge>,
    /// Map from NodeId to petgraph's NodeIndex for O(1) lookup.
    node_index_map: HashMap<NodeId, NodeIndex>,
}

impl RuleGraph {
    /// Creates a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            node_index_map: HashMap::new(),
        }
    }

    /// Adds a node to the graph.
    ///
    /// # Errors
    ///
    /// Returns an error if a node with the same ID already exists.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId, GraphError> {
        let node_id = node.id;
        if self.node_index_map.contains_key(&node_id) {
            return Err(GraphError::DuplicateNode { node_id });
        }
        let index = self.graph.add_node(node);
        self.node_index_map.insert(node_id, index);
        Ok(node_id)
    }

    /// Returns a reference to a node by its ID.
    #[must_use]
    pub fn get_node(&self, node_id: NodeId) -> Option<&Node> {
        let index = self.node_index_map.get(&node_id)?;
        self.graph.node_weight(*index)
    }

    /// Connects an output port of `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns an error if either node doesn't exist or the source node has
    /// no port with that name.
    pub fn add_edge(
        &mut self,
        from: NodeId,
        port: impl Into<String>,
        to: NodeId,
    ) -> Result<(), GraphError> {
        let port = port.into();
        let &source_index = self
            .node_index_map
            .get(&from)
            .ok_or(GraphError::NodeNotFound { node_id: from })?;
        let &target_index = self
            .node_index_map
            .get(&to)
            .ok_or(GraphError::NodeNotFound { node_id: to })?;

        let has_port = self
            .graph
            .node_weight(source_index)
            .is_some_and(|node| node.output_port(&port).is_some());
        if !has_port {
            return Err(GraphError::PortNotFound {
                node_id: from,
                port_name: port,
            });
        }

        self.graph.add_edge(source_index, target_index, Edge::new(port));
        Ok(())
    }

    /// Returns all nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns every edge with its endpoints, in insertion order.
    #[must_use]
    pub fn edge_refs(&self) -> Vec<EdgeRef> {
        self.graph
            .edge_references()
            .filter_map(|e| {
                let from = self.graph.node_weight(e.source())?;
                let to = self.graph.node_weight(e.target())?;
                Some(EdgeRef::new(from.id, e.weight().port.clone(), to.id))
            })
            .collect()
    }

    /// Returns the successors (downstream nodes) of a given node.
    pub fn successors(&self, node_id: NodeId) -> Vec<(&Node, &Edge)> {
        let Some(&index) = self.node_index_map.get(&node_id) else {
            return Vec::new();
        };

        self.graph
            .edges_directed(index, Direction::Outgoing)
            .filter_map(|edge| {
                let target = self.graph.node_weight(edge.target())?;
                Some((target, edge.weight()))
            })
            .collect()
    }

    /// Returns the predecessors (upstream nodes) of a given node.
    pub fn predecessors(&self, node_id: NodeId) -> Vec<(&Node, &Edge)> {
        let Some(&index) = self.node_index_map.get(&node_id) else {
            return Vec::new();
        };

        self.graph
            .edges_directed(index, Direction::Incoming)
            .filter_map(|edge| {
                let source = self.graph.node_weight(edge.source())?;
                Some((source, edge.weight()))
            })
            .collect()
    }

    /// Validates the graph for execution from `entry`.
    ///
    /// Checks:
    /// - Every node declares exactly one default output port
    /// - The entry node exists and has no inbound edges
    /// - No cycles (DAG validation)
    /// - Every node is reachable from the entry node
    ///
    /// # Errors
    ///
    /// Returns an error describing the first validation failure.
    pub fn validate(&self, entry: NodeId) -> Result<(), GraphError> {
        for node in self.nodes() {
            let count = node.default_port_count();
            if count != 1 {
                return Err(GraphError::DefaultPortCount {
                    node_id: node.id,
                    count,
                });
            }
        }

        let &entry_index = self
            .node_index_map
            .get(&entry)
            .ok_or(GraphError::EntryNodeNotFound { node_id: entry })?;

        if self
            .graph
            .edges_directed(entry_index, Direction::Incoming)
            .next()
            .is_some()
        {
            return Err(GraphError::EntryHasInboundEdges { node_id: entry });
        }

        if petgraph::algo::is_cyclic_directed(&self.graph) {
            return Err(GraphError::CycleDetected);
        }

        let mut reachable = HashSet::new();
        let mut bfs = Bfs::new(&self.graph, entry_index);
        while let Some(index) = bfs.next(&self.graph) {
            reachable.insert(index);
        }
        for index in self.graph.node_indices() {
            if !reachable.contains(&index)
                && let Some(node) = self.graph.node_weight(index)
            {
                return Err(GraphError::UnreachableNode { node_id: node.id });
            }
        }

        Ok(())
    }
}

impl Default for RuleGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for RuleGraph {
    fn eq(&self, other: &Self) -> bool {
        self.nodes().eq(other.nodes()) && self.edge_refs() == other.edge_refs()
    }
}

/// Wire form of a rule graph.
#[derive(Serialize, Deserialize)]
struct GraphRepr {
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<EdgeRef>,
}

impl TryFrom<GraphRepr> for RuleGraph {
    type Error = GraphError;

    fn try_from(repr: GraphRepr) -> Result<Self, Self::Error> {
        let mut graph = Self::new();
        for node in repr.nodes {
            graph.add_node(node)?;
        }
        for edge in repr.edges {
            graph.add_edge(edge.from_node, edge.from_port, edge.to_node)?;
        }
        Ok(graph)
    }
}

impl From<RuleGraph> for GraphRepr {
    fn from(graph: RuleGraph) -> Self {
        let edges = graph.edge_refs();
        let (nodes, _) = graph.graph.into_nodes_edges();
        Self {
            nodes: nodes.into_iter().map(|n| n.weight).collect(),
            edges,
        }
    }
}
