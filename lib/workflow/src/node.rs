//! Graph nodes.
//!
//! A node is one step of a rule: it names an action type from the catalog,
//! carries the configuration that action is executed with, and exposes the
//! output ports copied from the action type.

use crate::catalog::ActionTypeInfo;
use crate::port::{OutputPort, default_port_count, single_default};
use autorule_core::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A step in a rule graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: NodeId,
    /// Human-readable name.
    pub name: String,
    /// Catalog key of the action this node runs.
    pub action_type: String,
    /// Action configuration, checked against the action type's schema.
    #[serde(default)]
    pub config: JsonValue,
    /// Output ports, copied from the action type.
    pub output_ports: Vec<OutputPort>,
}

impl Node {
    /// Creates a node for the given action type with a fresh ID.
    #[must_use]
    pub fn new(name: impl Into<String>, info: &ActionTypeInfo, config: JsonValue) -> Self {
        Self {
            id: NodeId::new(),
            name: name.into(),
            action_type: info.action_type.clone(),
            config,
            output_ports: info.output_ports.clone(),
        }
    }

    /// Replaces the generated ID.
    #[must_use]
    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    /// Returns an output port by name.
    #[must_use]
    pub fn output_port(&self, name: &str) -> Option<&OutputPort> {
        self.output_ports.iter().find(|p| p.name == name)
    }

    /// Returns the default output port, if exactly one is declared.
    #[must_use]
    pub fn default_port(&self) -> Option<&OutputPort> {
        single_default(&self.output_ports)
    }

    /// Returns how many ports are flagged as default.
    #[must_use]
    pub fn default_port_count(&self) -> usize {
        default_port_count(&self.output_ports)
    }

    /// Resolves the port a finished node exits through.
    ///
    /// A named port must exist on the node; no name selects the default.
    #[must_use]
    pub fn resolve_port(&self, requested: Option<&str>) -> Option<&OutputPort> {
        match requested {
            Some(name) => self.output_port(name),
            None => self.default_port(),
        }
    }
}
