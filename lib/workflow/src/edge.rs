//! Edge types for rule graphs.
//!
//! An edge leaves a named output port of one node and enters another node.
//! A port may fan out to several edges (parallel branches) or to none (the
//! branch ends there).

use autorule_core::NodeId;
use serde::{Deserialize, Serialize};

/// Edge weight stored in the graph: the output port the edge hangs off.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// The output port on the source node.
    pub port: String,
}

impl Edge {
    /// Creates an edge leaving the given port.
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self { port: port.into() }
    }
}

/// A complete edge including its endpoints.
///
/// This is the serialized form of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeRef {
    /// The source node ID.
    pub from_node: NodeId,
    /// The output port on the source node.
    pub from_port: String,
    /// The target node ID.
    pub to_node: NodeId,
}

impl EdgeRef {
    /// Creates a new edge reference.
    #[must_use]
    pub fn new(from_node: NodeId, from_port: impl Into<String>, to_node: NodeId) -> Self {
        Self {
            from_node,
            from_port: from_port.into(),
            to_node,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_ref_creation() {
        let source = NodeId::new();
        let target = NodeId::new();
        let edge_ref = EdgeRef::new(source, "true", target);

        assert_eq!(edge_ref.from_node, source);
        assert_eq!(edge_ref.from_port, "true");
        assert_eq!(edge_ref.to_node, target);
    }

    #[test]
    fn edge_ref_json_field_names() {
        let edge_ref = EdgeRef::new(NodeId::new(), "approved", NodeId::new());
        let json = serde_json::to_value(&edge_ref).expect("serialize");
        assert_eq!(json["from_port"], "approved");
        assert!(json.get("from_node").is_some());
        assert!(json.get("to_node").is_some());
    }
}
