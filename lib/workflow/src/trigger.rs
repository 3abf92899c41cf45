//! Domain events and rule matching.
//!
//! Entity services report every committed mutation as a `TriggerEvent`. The
//! matcher turns an event into one `RunRequest` per active rule bound to the
//! event's (trigger type, entity type) pair. Matching never mutates anything;
//! events nothing is listening for are dropped.

use crate::catalog::Catalog;
use crate::definition::RuleDefinition;
use crate::rule_store::{RuleStore, RuleStoreError};
use async_trait::async_trait;
use autorule_core::RunInstanceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// The kind of mutation an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    /// Name of the catalog trigger type that fires for this kind.
    #[must_use]
    pub fn trigger_type_name(self) -> &'static str {
        match self {
            Self::Created => "on_create",
            Self::Updated => "on_update",
            Self::Deleted => "on_delete",
        }
    }

    /// Inverse of [`EventKind::trigger_type_name`].
    #[must_use]
    pub fn from_trigger_type_name(name: &str) -> Option<Self> {
        match name {
            "on_create" => Some(Self::Created),
            "on_update" => Some(Self::Updated),
            "on_delete" => Some(Self::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// A committed mutation of a domain entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Entity type name, e.g. `asset_conditions`.
    pub entity_type: String,
    /// Primary key of the mutated record.
    pub entity_id: String,
    /// Display name of the mutated record.
    #[serde(default)]
    pub entity_name: Option<String>,
    pub event_type: EventKind,
    /// Snapshot of the record after the mutation (before it, for deletes).
    #[serde(default)]
    pub raw_data: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

impl TriggerEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        event_type: EventKind,
        raw_data: JsonValue,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            entity_name: None,
            event_type,
            raw_data,
            occurred_at: Utc::now(),
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_entity_name(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }
}

/// A request to start one run of a rule.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Fresh identifier of the run to start.
    pub run_id: RunInstanceId,
    pub rule: Arc<RuleDefinition>,
    pub event: TriggerEvent,
}

/// Errors from matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    /// The rule store could not be queried.
    RuleStore(RuleStoreError),
}

impl fmt::Display for MatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RuleStore(e) => write!(f, "rule lookup failed: {e}"),
        }
    }
}

impl std::error::Error for MatchError {}

impl From<RuleStoreError> for MatchError {
    fn from(e: RuleStoreError) -> Self {
        Self::RuleStore(e)
    }
}

/// Matches domain events against active rules.
#[derive(Clone)]
pub struct TriggerMatcher {
    catalog: Arc<Catalog>,
    rules: Arc<dyn RuleStore>,
}

impl TriggerMatcher {
    /// Creates a matcher over a catalog and a rule store.
    #[must_use]
    pub fn new(catalog: Arc<Catalog>, rules: Arc<dyn RuleStore>) -> Self {
        Self { catalog, rules }
    }

    /// Returns one run request per active rule the event fires.
    ///
    /// Rules whose entry node's action type does not accept the event kind
    /// are left out.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule store cannot be queried.
    pub async fn on_domain_event(&self, event: &TriggerEvent) -> Result<Vec<RunRequest>, MatchError> {
        let Some(trigger_type) = self.catalog.trigger_type_for(event.event_type) else {
            debug!(event_type = %event.event_type, "no active trigger type for event");
            return Ok(Vec::new());
        };
        let Some(entity_type) = self.catalog.entity_type_by_name(&event.entity_type) else {
            debug!(entity_type = %event.entity_type, "event for unmonitored entity type");
            return Ok(Vec::new());
        };

        let rules = self
            .rules
            .active_rules(trigger_type.id, entity_type.id)
            .await?;

        let requests: Vec<RunRequest> = rules
            .into_iter()
            .filter(|rule| rule.is_active && self.entry_accepts(rule, event.event_type))
            .map(|rule| RunRequest {
                run_id: RunInstanceId::new(),
                rule,
                event: event.clone(),
            })
            .collect();

        debug!(
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            event_type = %event.event_type,
            matched = requests.len(),
            "matched domain event"
        );

        Ok(requests)
    }

    fn entry_accepts(&self, rule: &RuleDefinition, kind: EventKind) -> bool {
        rule.graph
            .get_node(rule.entry_node_id)
            .and_then(|node| self.catalog.action_type(&node.action_type))
            .is_some_and(|info| info.accepts_event(kind))
    }
}

/// Entry point entity services call after committing a mutation.
///
/// Publishing is fire and forget: automation failures are logged by the
/// implementation and never surface to the domain transaction.
#[async_trait]
pub trait TriggerPublisher: Send + Sync {
    /// Reports a committed mutation.
    async fn publish(&self, event: TriggerEvent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::registry::ActionRegistryBuilder;
    use crate::graph::RuleGraph;
    use crate::node::Node;
    use crate::outbox::InMemoryOutbox;
    use crate::rule_store::InMemoryRuleStore;
    use serde_json::json;

    fn alert_rule(catalog: &Catalog, kind: EventKind, entity_type: &str) -> RuleDefinition {
        let info = catalog.action_type("create_alert").expect("create_alert");
        let node = Node::new(
            "Alert",
            info,
            json!({ "alert_type": "condition", "severity": "low", "message": "changed" }),
        );
        let entry = node.id;
        let mut graph = RuleGraph::new();
        graph.add_node(node).expect("add node");
        RuleDefinition::new(
            "Alert rule",
            catalog.trigger_type_for(kind).expect("trigger type").id,
            catalog.entity_type_by_name(entity_type).expect("entity type").id,
            entry,
            graph,
        )
    }

    async fn matcher_with(rules: Vec<RuleDefinition>) -> TriggerMatcher {
        let catalog = Arc::new(Catalog::embedded().expect("catalog"));
        let registry = Arc::new(
            ActionRegistryBuilder::with_builtins(Arc::new(InMemoryOutbox::new()))
                .build(&catalog)
                .expect("registry"),
        );
        let store = InMemoryRuleStore::new(catalog.clone(), registry);
        for rule in rules {
            store.save(rule).await.expect("save rule");
        }
        TriggerMatcher::new(catalog, Arc::new(store))
    }

    #[test]
    fn event_kind_trigger_type_names() {
        for kind in [EventKind::Created, EventKind::Updated, EventKind::Deleted] {
            assert_eq!(
                EventKind::from_trigger_type_name(kind.trigger_type_name()),
                Some(kind)
            );
        }
        assert_eq!(EventKind::from_trigger_type_name("scheduled"), None);
    }

    #[test]
    fn trigger_event_json_shape() {
        let event = TriggerEvent::new("orders", "42", EventKind::Updated, json!({"status": "paid"}))
            .with_entity_name("Order 42");
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["event_type"], "updated");
        assert_eq!(json["entity_name"], "Order 42");
    }

    #[tokio::test]
    async fn one_request_per_matching_rule() {
        let catalog = Catalog::embedded().expect("catalog");
        let matcher = matcher_with(vec![
            alert_rule(&catalog, EventKind::Created, "asset_conditions"),
            alert_rule(&catalog, EventKind::Created, "asset_conditions"),
            alert_rule(&catalog, EventKind::Updated, "asset_conditions"),
            alert_rule(&catalog, EventKind::Created, "orders"),
        ])
        .await;

        let event = TriggerEvent::new("asset_conditions", "7", EventKind::Created, json!({}));
        let requests = matcher.on_domain_event(&event).await.expect("match");

        assert_eq!(requests.len(), 2);
        assert_ne!(requests[0].run_id, requests[1].run_id);
        assert!(requests.iter().all(|r| r.event == event));
    }

    #[tokio::test]
    async fn inactive_rules_do_not_match() {
        let catalog = Catalog::embedded().expect("catalog");
        let mut rule = alert_rule(&catalog, EventKind::Created, "asset_conditions");
        rule.deactivate();
        let matcher = matcher_with(vec![rule]).await;

        let event = TriggerEvent::new("asset_conditions", "7", EventKind::Created, json!({}));
        assert!(matcher.on_domain_event(&event).await.expect("match").is_empty());
    }

    #[tokio::test]
    async fn unknown_entity_type_is_dropped() {
        let catalog = Catalog::embedded().expect("catalog");
        let matcher =
            matcher_with(vec![alert_rule(&catalog, EventKind::Created, "asset_conditions")]).await;

        let event = TriggerEvent::new("spaceships", "1", EventKind::Created, json!({}));
        assert!(matcher.on_domain_event(&event).await.expect("match").is_empty());
    }
}
