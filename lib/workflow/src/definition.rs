//! Rule definition types.
//!
//! A rule binds a (trigger type, entity type) pair to an action graph. When a
//! matching domain event arrives, the engine starts one run of the graph from
//! the rule's entry node.

use crate::action::registry::ActionRegistry;
use crate::catalog::Catalog;
use crate::error::DefinitionError;
use crate::graph::RuleGraph;
use autorule_core::{EntityTypeId, NodeId, RuleId, TriggerTypeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A complete rule definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Unique identifier for this rule.
    pub id: RuleId,
    /// Human-readable name.
    pub name: String,
    /// What the rule is for.
    #[serde(default)]
    pub description: Option<String>,
    /// Which kind of mutation fires the rule.
    pub trigger_type_id: TriggerTypeId,
    /// Which entity type the rule watches.
    pub entity_type_id: EntityTypeId,
    /// Inactive rules are never matched.
    pub is_active: bool,
    /// The node every run starts at.
    pub entry_node_id: NodeId,
    /// The action graph.
    pub graph: RuleGraph,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RuleDefinition {
    /// Creates a new active rule.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        trigger_type_id: TriggerTypeId,
        entity_type_id: EntityTypeId,
        entry_node_id: NodeId,
        graph: RuleGraph,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RuleId::new(),
            name: name.into(),
            description: None,
            trigger_type_id,
            entity_type_id,
            is_active: true,
            entry_node_id,
            graph,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Activates the rule.
    pub fn activate(&mut self) {
        self.is_active = true;
        self.updated_at = Utc::now();
    }

    /// Deactivates the rule.
    pub fn deactivate(&mut self) {
        self.is_active = false;
        self.updated_at = Utc::now();
    }

    /// Validates the rule against the catalog and the action registry.
    ///
    /// Runs the structural graph checks first, then checks each node's
    /// action type, ports and configuration.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(
        &self,
        catalog: &Catalog,
        registry: &ActionRegistry,
    ) -> Result<(), DefinitionError> {
        self.graph.validate(self.entry_node_id)?;

        if catalog.trigger_type(self.trigger_type_id).is_none() {
            return Err(DefinitionError::UnknownTriggerType {
                trigger_type_id: self.trigger_type_id,
            });
        }
        if catalog.entity_type(self.entity_type_id).is_none() {
            return Err(DefinitionError::UnknownEntityType {
                entity_type_id: self.entity_type_id,
            });
        }

        for node in self.graph.nodes() {
            let info = catalog.action_type(&node.action_type).ok_or_else(|| {
                DefinitionError::UnknownActionType {
                    node_id: node.id,
                    action_type: node.action_type.clone(),
                }
            })?;

            if node.output_ports != info.output_ports {
                return Err(DefinitionError::PortsMismatch {
                    node_id: node.id,
                    action_type: node.action_type.clone(),
                });
            }

            info.config_schema
                .validate(&node.config)
                .map_err(|violation| DefinitionError::InvalidConfig {
                    node_id: node.id,
                    violation,
                })?;

            let handler =
                registry
                    .lookup(&node.action_type)
                    .ok_or_else(|| DefinitionError::MissingHandler {
                        node_id: node.id,
                        action_type: node.action_type.clone(),
                    })?;
            handler
                .validate(&node.config)
                .map_err(|error| DefinitionError::HandlerRejected {
                    node_id: node.id,
                    error,
                })?;

            if node.id == self.entry_node_id
                && let Some(kind) = catalog.event_kind_for(self.trigger_type_id)
                && !info.accepts_event(kind)
            {
                return Err(DefinitionError::EntryRejectsEvent {
                    node_id: node.id,
                    action_type: node.action_type.clone(),
                    event_kind: kind,
                });
            }
        }

        Ok(())
    }
}

/// Summary information about a rule (for listings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSummary {
    pub id: RuleId,
    pub name: String,
    pub description: Option<String>,
    pub trigger_type_id: TriggerTypeId,
    pub entity_type_id: EntityTypeId,
    pub is_active: bool,
    /// Number of nodes in the graph.
    pub node_count: usize,
    pub updated_at: DateTime<Utc>,
}

impl From<&RuleDefinition> for RuleSummary {
    fn from(rule: &RuleDefinition) -> Self {
        Self {
            id: rule.id,
            name: rule.name.clone(),
            description: rule.description.clone(),
            trigger_type_id: rule.trigger_type_id,
            entity_type_id: rule.entity_type_id,
            is_active: rule.is_active,
            node_count: rule.graph.node_count(),
            updated_at: rule.updated_at,
        }
    }
}
