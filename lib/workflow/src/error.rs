//! Error types for the graph model and rule definitions.
//!
//! Errors are layered the same way the rest of the crate is:
//! - `GraphError`: structural problems inside a single rule graph
//! - `DefinitionError`: a rule that does not line up with the catalog or
//!   the action registry (wraps `GraphError` for structural failures)
//!
//! Errors owned by a single module (catalog, registry, journal, run state,
//! orchestrator) live next to that module.

use crate::action::ActionError;
use crate::schema::SchemaViolation;
use crate::trigger::EventKind;
use autorule_core::{EntityTypeId, NodeId, TriggerTypeId};
use std::fmt;

/// Errors from graph operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Node with the given ID was not found in the graph.
    NodeNotFound { node_id: NodeId },
    /// The same node ID was added twice.
    DuplicateNode { node_id: NodeId },
    /// The edge names an output port the source node does not declare.
    PortNotFound { node_id: NodeId, port_name: String },
    /// A node does not declare exactly one default output port.
    DefaultPortCount { node_id: NodeId, count: usize },
    /// The entry node is not part of the graph.
    EntryNodeNotFound { node_id: NodeId },
    /// The entry node has inbound edges.
    EntryHasInboundEdges { node_id: NodeId },
    /// A node cannot be reached from the entry node.
    UnreachableNode { node_id: NodeId },
    /// Graph contains cycles.
    CycleDetected,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeNotFound { node_id } => write!(f, "node not found: {node_id}"),
            Self::DuplicateNode { node_id } => write!(f, "duplicate node: {node_id}"),
            Self::PortNotFound { node_id, port_name } => {
                write!(f, "output port '{port_name}' not found on node {node_id}")
            }
            Self::DefaultPortCount { node_id, count } => {
                write!(
                    f,
                    "node {node_id} must declare exactly one default output port, found {count}"
                )
            }
            Self::EntryNodeNotFound { node_id } => {
                write!(f, "entry node {node_id} is not part of the graph")
            }
            Self::EntryHasInboundEdges { node_id } => {
                write!(f, "entry node {node_id} has inbound edges")
            }
            Self::UnreachableNode { node_id } => {
                write!(f, "node {node_id} is not reachable from the entry node")
            }
            Self::CycleDetected => write!(f, "graph contains cycles"),
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors raised when a rule definition is checked against the catalog and
/// the action registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    /// The graph itself is malformed.
    Graph(GraphError),
    /// The rule references a trigger type the catalog does not know.
    UnknownTriggerType { trigger_type_id: TriggerTypeId },
    /// The rule references an entity type the catalog does not know.
    UnknownEntityType { entity_type_id: EntityTypeId },
    /// A node names an action type the catalog does not know.
    UnknownActionType { node_id: NodeId, action_type: String },
    /// A node names an action type that has no registered handler.
    MissingHandler { node_id: NodeId, action_type: String },
    /// A node's output ports differ from the ports its action type declares.
    PortsMismatch { node_id: NodeId, action_type: String },
    /// A node's config does not satisfy its action type's config schema.
    InvalidConfig {
        node_id: NodeId,
        violation: SchemaViolation,
    },
    /// The handler rejected a node's config.
    HandlerRejected { node_id: NodeId, error: ActionError },
    /// The entry node's action type does not accept the rule's event kind.
    EntryRejectsEvent {
        node_id: NodeId,
        action_type: String,
        event_kind: EventKind,
    },
}

impl fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graph(e) => write!(f, "invalid graph: {e}"),
            Self::UnknownTriggerType { trigger_type_id } => {
                write!(f, "unknown trigger type: {trigger_type_id}")
            }
            Self::UnknownEntityType { entity_type_id } => {
                write!(f, "unknown entity type: {entity_type_id}")
            }
            Self::UnknownActionType {
                node_id,
                action_type,
            } => write!(f, "node {node_id} uses unknown action type '{action_type}'"),
            Self::MissingHandler {
                node_id,
                action_type,
            } => write!(
                f,
                "node {node_id} uses action type '{action_type}' which has no registered handler"
            ),
            Self::PortsMismatch {
                node_id,
                action_type,
            } => write!(
                f,
                "node {node_id} output ports do not match action type '{action_type}'"
            ),
            Self::InvalidConfig { node_id, violation } => {
                write!(f, "node {node_id} config is invalid: {violation}")
            }
            Self::HandlerRejected { node_id, error } => {
                write!(f, "node {node_id} config rejected by handler: {error}")
            }
            Self::EntryRejectsEvent {
                node_id,
                action_type,
                event_kind,
            } => write!(
                f,
                "entry node {node_id} action type '{action_type}' does not accept '{event_kind}' events"
            ),
        }
    }
}

impl std::error::Error for DefinitionError {}

impl From<GraphError> for DefinitionError {
    fn from(e: GraphError) -> Self {
        Self::Graph(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_display() {
        let node_id = NodeId::new();
        let err = GraphError::NodeNotFound { node_id };
        assert!(err.to_string().contains("node not found"));
    }

    #[test]
    fn default_port_count_names_the_count() {
        let node_id = NodeId::new();
        let err = GraphError::DefaultPortCount { node_id, count: 2 };
        assert!(err.to_string().contains("exactly one default output port, found 2"));
    }

    #[test]
    fn definition_error_wraps_graph_error() {
        let err: DefinitionError = GraphError::CycleDetected.into();
        assert_eq!(err, DefinitionError::Graph(GraphError::CycleDetected));
        assert_eq!(err.to_string(), "invalid graph: graph contains cycles");
    }

    #[test]
    fn entry_rejects_event_display() {
        let err = DefinitionError::EntryRejectsEvent {
            node_id: NodeId::new(),
            action_type: "update_field".to_string(),
            event_kind: EventKind::Deleted,
        };
        assert!(err.to_string().contains("does not accept 'deleted' events"));
    }
}
