//! Remaining work graph for run execution.
//!
//! Scheduling works on a shrinking copy of the rule graph:
//! - Completed and skipped nodes are removed, which resolves their outbound edges
//! - Failed nodes get a self-edge, so they and everything below them stay blocked
//! - A node is ready once it has no inbound edges and at least one inbound edge
//!   was taken (the entry node counts as taken)
//! - A node with no inbound edges that nothing activated is skipped, and the
//!   skip cascades downstream
//! - Nothing ready and nothing executing or waiting means the run is done

use crate::execution::NodeStatus;
use crate::graph::RuleGraph;
use autorule_core::NodeId;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{HashMap, HashSet};

/// Tracks which nodes of a run still need to execute.
#[derive(Debug, Clone)]
pub struct RemainingWorkGraph {
    /// Node weights are node IDs, edge weights the source port name.
    graph: DiGraph<NodeId, String>,
    node_to_index: HashMap<NodeId, NodeIndex>,
    /// Nodes with at least one taken inbound edge.
    activated: HashSet<NodeId>,
    executing: HashSet<NodeId>,
    waiting: HashSet<NodeId>,
    failed: HashSet<NodeId>,
    succeeded: HashSet<NodeId>,
    skipped: HashSet<NodeId>,
}

impl RemainingWorkGraph {
    /// Creates the work graph for a fresh run starting at `entry`.
    #[must_use]
    pub fn from_rule(rule_graph: &RuleGraph, entry: NodeId) -> Self {
        let mut graph = DiGraph::new();
        let mut node_to_index = HashMap::new();

        for node in rule_graph.nodes() {
            node_to_index.insert(node.id, graph.add_node(node.id));
        }

        for edge in rule_graph.edge_refs() {
            if let (Some(&source), Some(&target)) = (
                node_to_index.get(&edge.from_node),
                node_to_index.get(&edge.to_node),
            ) {
                graph.add_edge(source, target, edge.from_port);
            }
        }

        let mut activated = HashSet::new();
        if node_to_index.contains_key(&entry) {
            activated.insert(entry);
        }

        Self {
            graph,
            node_to_index,
            activated,
            executing: HashSet::new(),
            waiting: HashSet::new(),
            failed: HashSet::new(),
            succeeded: HashSet::new(),
            skipped: HashSet::new(),
        }
    }

    /// Marks a node as dispatched to its handler.
    pub fn mark_executing(&mut self, node_id: NodeId) {
        if self.node_to_index.contains_key(&node_id) {
            self.waiting.remove(&node_id);
            self.executing.insert(node_id);
        }
    }

    /// Marks a node as waiting for an asynchronous completion signal.
    pub fn mark_waiting(&mut self, node_id: NodeId) {
        if self.node_to_index.contains_key(&node_id) {
            self.executing.remove(&node_id);
            self.waiting.insert(node_id);
        }
    }

    /// Marks a node as completed through `port`.
    ///
    /// Edges leaving `port` activate their targets; every other outbound
    /// edge is dead. Returns the nodes that became skipped as a result, in
    /// the order they were resolved.
    pub fn mark_completed(&mut self, node_id: NodeId, port: &str) -> Vec<NodeId> {
        let Some(idx) = self.node_to_index.get(&node_id).copied() else {
            return Vec::new();
        };
        self.executing.remove(&node_id);
        self.waiting.remove(&node_id);

        let taken: Vec<NodeId> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .filter(|edge| edge.weight() == port)
            .filter_map(|edge| self.graph.node_weight(edge.target()).copied())
            .collect();
        self.activated.extend(taken);

        self.remove(node_id);
        self.succeeded.insert(node_id);
        self.skip_unreachable()
    }

    /// Marks a node as failed.
    ///
    /// The self-edge keeps the node from ever becoming ready and blocks
    /// everything downstream.
    pub fn mark_failed(&mut self, node_id: NodeId) {
        self.executing.remove(&node_id);
        self.waiting.remove(&node_id);
        if let Some(&idx) = self.node_to_index.get(&node_id)
            && self.failed.insert(node_id)
        {
            self.graph.add_edge(idx, idx, String::new());
        }
    }

    /// Returns nodes that are ready to execute.
    #[must_use]
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .edges_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .filter_map(|idx| self.graph.node_weight(idx).copied())
            .filter(|node_id| {
                self.activated.contains(node_id)
                    && !self.executing.contains(node_id)
                    && !self.waiting.contains(node_id)
            })
            .collect()
    }

    /// Returns true once nothing is ready, executing or waiting.
    ///
    /// Either every node resolved, or the rest is blocked by failures.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.executing.is_empty() && self.waiting.is_empty() && self.ready_nodes().is_empty()
    }

    /// Returns true if the only unfinished work is asynchronous nodes
    /// waiting for a completion signal.
    #[must_use]
    pub fn is_waiting_only(&self) -> bool {
        !self.waiting.is_empty() && self.executing.is_empty() && self.ready_nodes().is_empty()
    }

    /// Returns true if there are any failed nodes.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    #[must_use]
    pub fn failed_nodes(&self) -> &HashSet<NodeId> {
        &self.failed
    }

    #[must_use]
    pub fn executing_nodes(&self) -> &HashSet<NodeId> {
        &self.executing
    }

    #[must_use]
    pub fn waiting_nodes(&self) -> &HashSet<NodeId> {
        &self.waiting
    }

    /// Returns the number of unresolved nodes, including blocked ones.
    #[must_use]
    pub fn remaining_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the current state of a node.
    #[must_use]
    pub fn node_state(&self, node_id: NodeId) -> NodeStatus {
        if self.succeeded.contains(&node_id) {
            return NodeStatus::Succeeded;
        }
        if self.skipped.contains(&node_id) {
            return NodeStatus::Skipped;
        }
        if self.failed.contains(&node_id) {
            return NodeStatus::Failed;
        }
        if self.waiting.contains(&node_id) {
            return NodeStatus::WaitingAsync;
        }
        if self.executing.contains(&node_id) {
            return NodeStatus::Running;
        }
        if self.ready_nodes().contains(&node_id) {
            return NodeStatus::Ready;
        }
        NodeStatus::Pending
    }

    /// Returns all nodes blocked by failures.
    ///
    /// A node is blocked if it is reachable from a failed node but not
    /// failed itself.
    #[must_use]
    pub fn blocked_nodes(&self) -> Vec<NodeId> {
        let mut blocked = HashSet::new();

        for &failed_id in &self.failed {
            if let Some(&start_idx) = self.node_to_index.get(&failed_id) {
                let mut to_visit = vec![start_idx];
                while let Some(idx) = to_visit.pop() {
                    for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                        let target_idx = edge.target();
                        if target_idx == idx {
                            continue;
                        }
                        if let Some(&target_id) = self.graph.node_weight(target_idx)
                            && !self.failed.contains(&target_id)
                            && blocked.insert(target_id)
                        {
                            to_visit.push(target_idx);
                        }
                    }
                }
            }
        }

        blocked.into_iter().collect()
    }

    /// Skips every node whose inbound edges are all resolved but none was
    /// taken, until no such node remains.
    fn skip_unreachable(&mut self) -> Vec<NodeId> {
        let mut skipped = Vec::new();
        loop {
            let dead: Vec<NodeId> = self
                .graph
                .node_indices()
                .filter(|&idx| {
                    self.graph
                        .edges_directed(idx, Direction::Incoming)
                        .next()
                        .is_none()
                })
                .filter_map(|idx| self.graph.node_weight(idx).copied())
                .filter(|node_id| !self.activated.contains(node_id))
                .collect();
            if dead.is_empty() {
                return skipped;
            }
            for node_id in dead {
                self.remove(node_id);
                self.skipped.insert(node_id);
                skipped.push(node_id);
            }
        }
    }

    fn remove(&mut self, node_id: NodeId) {
        if let Some(idx) = self.node_to_index.remove(&node_id) {
            self.graph.remove_node(idx);
            // Removal moves the last node into the freed index.
            self.rebuild_index_map();
        }
    }

    fn rebuild_index_map(&mut self) {
        self.node_to_index.clear();
        for idx in self.graph.node_indices() {
            if let Some(&node_id) = self.graph.node_weight(idx) {
                self.node_to_index.insert(node_id, idx);
            }
        }
    }
}
