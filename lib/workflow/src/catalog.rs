//! Reference catalog.
//!
//! The catalog is read-only reference data compiled into the binary: the
//! trigger types rules can bind to, the entity types and monitored entities
//! events come from, and the action types graph nodes can use. Every lookup
//! the matcher, rule validation and the worker perform goes through here.

use crate::port::{OutputPort, default_port_count};
use crate::schema::ConfigSchema;
use crate::trigger::EventKind;
use autorule_core::{EntityId, EntityTypeId, TriggerTypeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

/// The catalog document shipped with the crate.
const EMBEDDED_CATALOG: &str = include_str!("../catalog/catalog.json");

/// A kind of trigger a rule can bind to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerType {
    pub id: TriggerTypeId,
    pub name: String,
    pub description: String,
    pub is_active: bool,
}

/// A monitorable category of domain tables.
///
/// `name` is the value carried in `TriggerEvent::entity_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityType {
    pub id: EntityTypeId,
    pub name: String,
    pub description: String,
    pub is_active: bool,
}

/// A concrete monitored table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub entity_type_id: EntityTypeId,
    pub schema_name: String,
    pub is_active: bool,
}

/// Grouping used by the rule editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Control,
    Notification,
    Data,
    Inventory,
    Approval,
    Alerting,
}

/// Everything the engine knows about an action type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTypeInfo {
    /// Unique key nodes refer to.
    #[serde(rename = "type")]
    pub action_type: String,
    pub name: String,
    pub description: String,
    pub category: ActionCategory,
    pub supports_manual_execution: bool,
    /// Async action types suspend their branch until a completion signal.
    pub is_async: bool,
    pub config_schema: ConfigSchema,
    pub output_ports: Vec<OutputPort>,
    /// Event kinds accepted when used as the entry node. Empty accepts all.
    #[serde(default)]
    pub trigger_events: Vec<EventKind>,
    /// How long an async node may wait for its completion signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_secs: Option<u64>,
}

impl ActionTypeInfo {
    /// Returns true if a rule whose entry node has this type may fire on
    /// the given event kind.
    #[must_use]
    pub fn accepts_event(&self, kind: EventKind) -> bool {
        self.trigger_events.is_empty() || self.trigger_events.contains(&kind)
    }

    /// Returns an output port by name.
    #[must_use]
    pub fn output_port(&self, name: &str) -> Option<&OutputPort> {
        self.output_ports.iter().find(|p| p.name == name)
    }

    /// Returns the default output port.
    #[must_use]
    pub fn default_port(&self) -> Option<&OutputPort> {
        self.output_ports.iter().find(|p| p.is_default)
    }

    /// Returns the catalog timeout for async action types.
    #[must_use]
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs)
    }
}

/// Errors from catalog loading and lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// The catalog document could not be parsed.
    Parse { message: String },
    /// An action type does not declare exactly one default port.
    DefaultPortCount { action_type: String, count: usize },
    /// An async action type has no default timeout.
    MissingTimeout { action_type: String },
    /// A key appears twice.
    Duplicate { kind: &'static str, key: String },
    /// An entity points at an entity type that does not exist.
    UnknownEntityType {
        entity: String,
        entity_type_id: EntityTypeId,
    },
    /// Lookup for an action type that does not exist.
    ActionTypeNotFound { action_type: String },
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { message } => write!(f, "failed to parse catalog: {message}"),
            Self::DefaultPortCount { action_type, count } => write!(
                f,
                "action type '{action_type}' must declare exactly one default port, found {count}"
            ),
            Self::MissingTimeout { action_type } => {
                write!(f, "async action type '{action_type}' has no default timeout")
            }
            Self::Duplicate { kind, key } => write!(f, "duplicate {kind}: {key}"),
            Self::UnknownEntityType {
                entity,
                entity_type_id,
            } => write!(f, "entity '{entity}' references unknown entity type {entity_type_id}"),
            Self::ActionTypeNotFound { action_type } => {
                write!(f, "action type not found: {action_type}")
            }
        }
    }
}

impl std::error::Error for CatalogError {}

#[derive(Deserialize)]
struct CatalogDocument {
    trigger_types: Vec<TriggerType>,
    entity_types: Vec<EntityType>,
    entities: Vec<Entity>,
    action_types: Vec<ActionTypeInfo>,
}

/// The loaded, validated catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    trigger_types: Vec<TriggerType>,
    entity_types: Vec<EntityType>,
    entities: Vec<Entity>,
    action_types: BTreeMap<String, ActionTypeInfo>,
}

impl Catalog {
    /// Loads the catalog compiled into the crate.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedded document is malformed.
    pub fn embedded() -> Result<Self, CatalogError> {
        Self::from_json(EMBEDDED_CATALOG)
    }

    /// Loads a catalog from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be parsed, an action type has
    /// no single default port, an async action type has no timeout, or a key
    /// is duplicated.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let document: CatalogDocument =
            serde_json::from_str(json).map_err(|e| CatalogError::Parse {
                message: e.to_string(),
            })?;

        let mut seen = HashSet::new();
        for trigger_type in &document.trigger_types {
            if !seen.insert(trigger_type.name.clone()) {
                return Err(CatalogError::Duplicate {
                    kind: "trigger type",
                    key: trigger_type.name.clone(),
                });
            }
        }

        let mut entity_type_ids = HashSet::new();
        seen.clear();
        for entity_type in &document.entity_types {
            if !seen.insert(entity_type.name.clone()) {
                return Err(CatalogError::Duplicate {
                    kind: "entity type",
                    key: entity_type.name.clone(),
                });
            }
            entity_type_ids.insert(entity_type.id);
        }

        seen.clear();
        for entity in &document.entities {
            if !seen.insert(entity.name.clone()) {
                return Err(CatalogError::Duplicate {
                    kind: "entity",
                    key: entity.name.clone(),
                });
            }
            if !entity_type_ids.contains(&entity.entity_type_id) {
                return Err(CatalogError::UnknownEntityType {
                    entity: entity.name.clone(),
                    entity_type_id: entity.entity_type_id,
                });
            }
        }

        let mut action_types = BTreeMap::new();
        for info in document.action_types {
            let count = default_port_count(&info.output_ports);
            if count != 1 {
                return Err(CatalogError::DefaultPortCount {
                    action_type: info.action_type,
                    count,
                });
            }
            if info.is_async && info.default_timeout_secs.is_none() {
                return Err(CatalogError::MissingTimeout {
                    action_type: info.action_type,
                });
            }
            if action_types.contains_key(&info.action_type) {
                return Err(CatalogError::Duplicate {
                    kind: "action type",
                    key: info.action_type,
                });
            }
            action_types.insert(info.action_type.clone(), info);
        }

        Ok(Self {
            trigger_types: document.trigger_types,
            entity_types: document.entity_types,
            entities: document.entities,
            action_types,
        })
    }

    /// Returns all trigger types.
    #[must_use]
    pub fn list_trigger_types(&self) -> &[TriggerType] {
        &self.trigger_types
    }

    /// Returns all entity types.
    #[must_use]
    pub fn list_entity_types(&self) -> &[EntityType] {
        &self.entity_types
    }

    /// Returns monitored entities, optionally restricted to one entity type.
    #[must_use]
    pub fn list_entities(&self, entity_type_id: Option<EntityTypeId>) -> Vec<&Entity> {
        self.entities
            .iter()
            .filter(|e| entity_type_id.is_none_or(|id| e.entity_type_id == id))
            .collect()
    }

    /// Returns all action types ordered by type key.
    #[must_use]
    pub fn list_action_types(&self) -> Vec<&ActionTypeInfo> {
        self.action_types.values().collect()
    }

    /// Returns an action type's full description, including its schema.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::ActionTypeNotFound` for unknown keys.
    pub fn get_action_type_schema(&self, action_type: &str) -> Result<&ActionTypeInfo, CatalogError> {
        self.action_type(action_type)
            .ok_or_else(|| CatalogError::ActionTypeNotFound {
                action_type: action_type.to_string(),
            })
    }

    /// Looks up an action type by key.
    #[must_use]
    pub fn action_type(&self, action_type: &str) -> Option<&ActionTypeInfo> {
        self.action_types.get(action_type)
    }

    /// Looks up a trigger type by id.
    #[must_use]
    pub fn trigger_type(&self, id: TriggerTypeId) -> Option<&TriggerType> {
        self.trigger_types.iter().find(|t| t.id == id)
    }

    /// Returns the trigger type that fires for an event kind.
    #[must_use]
    pub fn trigger_type_for(&self, kind: EventKind) -> Option<&TriggerType> {
        let name = kind.trigger_type_name();
        self.trigger_types
            .iter()
            .find(|t| t.is_active && t.name == name)
    }

    /// Returns the event kind a trigger type reacts to, if it is event driven.
    #[must_use]
    pub fn event_kind_for(&self, trigger_type_id: TriggerTypeId) -> Option<EventKind> {
        let trigger_type = self.trigger_type(trigger_type_id)?;
        EventKind::from_trigger_type_name(&trigger_type.name)
    }

    /// Looks up an entity type by id.
    #[must_use]
    pub fn entity_type(&self, id: EntityTypeId) -> Option<&EntityType> {
        self.entity_types.iter().find(|t| t.id == id)
    }

    /// Looks up an active entity type by the name events carry.
    #[must_use]
    pub fn entity_type_by_name(&self, name: &str) -> Option<&EntityType> {
        self.entity_types
            .iter()
            .find(|t| t.is_active && t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        Catalog::embedded().expect("embedded catalog loads")
    }

    #[test]
    fn embedded_catalog_has_reference_data() {
        let catalog = catalog();
        let names: Vec<&str> = catalog
            .list_trigger_types()
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(names, vec!["on_create", "on_update", "on_delete", "scheduled"]);
        assert!(catalog.entity_type_by_name("asset_conditions").is_some());
    }

    #[test]
    fn action_types_are_alphabetical() {
        let catalog = catalog();
        let keys: Vec<&str> = catalog
            .list_action_types()
            .iter()
            .map(|a| a.action_type.as_str())
            .collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
        assert_eq!(keys.first(), Some(&"allocate_inventory"));
        assert_eq!(keys.len(), 8);
    }

    #[test]
    fn unknown_action_type_schema() {
        let err = catalog().get_action_type_schema("teleport").unwrap_err();
        assert_eq!(
            err,
            CatalogError::ActionTypeNotFound {
                action_type: "teleport".to_string()
            }
        );
    }

    #[test]
    fn known_action_type_schema() {
        let catalog = catalog();
        let info = catalog
            .get_action_type_schema("seek_approval")
            .expect("seek_approval exists");
        assert!(info.is_async);
        assert_eq!(info.default_port().map(|p| p.name.as_str()), Some("rejected"));
        assert_eq!(info.default_timeout(), Some(Duration::from_secs(259_200)));
    }

    #[test]
    fn entities_filter_by_type() {
        let catalog = catalog();
        let inventory = catalog
            .entity_type_by_name("inventory_items")
            .expect("inventory_items")
            .id;
        let entities = catalog.list_entities(Some(inventory));
        assert_eq!(entities.len(), 2);
        assert!(entities.iter().all(|e| e.entity_type_id == inventory));
        assert_eq!(catalog.list_entities(None).len(), 9);
    }

    #[test]
    fn trigger_type_for_event_kind() {
        let catalog = catalog();
        let trigger = catalog
            .trigger_type_for(EventKind::Created)
            .expect("on_create");
        assert_eq!(trigger.name, "on_create");
        assert_eq!(catalog.event_kind_for(trigger.id), Some(EventKind::Created));

        let scheduled = catalog
            .list_trigger_types()
            .iter()
            .find(|t| t.name == "scheduled")
            .expect("scheduled");
        assert_eq!(catalog.event_kind_for(scheduled.id), None);
    }

    #[test]
    fn accepts_event_respects_trigger_events() {
        let catalog = catalog();
        let update_field = catalog.action_type("update_field").expect("update_field");
        assert!(update_field.accepts_event(EventKind::Updated));
        assert!(!update_field.accepts_event(EventKind::Deleted));

        let alert = catalog.action_type("create_alert").expect("create_alert");
        assert!(alert.accepts_event(EventKind::Deleted));
    }

    #[test]
    fn rejects_action_type_without_default_port() {
        let json = r#"{
            "trigger_types": [], "entity_types": [], "entities": [],
            "action_types": [{
                "type": "broken", "name": "Broken", "description": "",
                "category": "data", "supports_manual_execution": false,
                "is_async": false, "config_schema": {},
                "output_ports": [{ "name": "a" }, { "name": "b" }]
            }]
        }"#;
        let err = Catalog::from_json(json).unwrap_err();
        assert_eq!(
            err,
            CatalogError::DefaultPortCount {
                action_type: "broken".to_string(),
                count: 0
            }
        );
    }

    #[test]
    fn rejects_async_action_type_without_timeout() {
        let json = r#"{
            "trigger_types": [], "entity_types": [], "entities": [],
            "action_types": [{
                "type": "wait", "name": "Wait", "description": "",
                "category": "control", "supports_manual_execution": false,
                "is_async": true, "config_schema": {},
                "output_ports": [{ "name": "done", "is_default": true }]
            }]
        }"#;
        let err = Catalog::from_json(json).unwrap_err();
        assert!(matches!(err, CatalogError::MissingTimeout { .. }));
    }
}
