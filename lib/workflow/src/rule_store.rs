//! Rule storage.
//!
//! Rule authoring happens elsewhere; the engine only needs to look rules up
//! by their trigger binding and by ID. Rules are handed out behind `Arc` and
//! never mutated while a run holds them.

use crate::action::registry::ActionRegistry;
use crate::catalog::Catalog;
use crate::definition::{RuleDefinition, RuleSummary};
use crate::error::DefinitionError;
use async_trait::async_trait;
use autorule_core::{EntityTypeId, RuleId, TriggerTypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Errors from rule storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleStoreError {
    /// The rule failed validation and was not saved.
    Invalid {
        rule_id: RuleId,
        source: DefinitionError,
    },
    /// The backing store could not be reached.
    Unavailable { message: String },
}

impl fmt::Display for RuleStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid { rule_id, source } => write!(f, "rule {rule_id} is invalid: {source}"),
            Self::Unavailable { message } => write!(f, "rule store unavailable: {message}"),
        }
    }
}

impl std::error::Error for RuleStoreError {}

/// Read access to rule definitions.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Returns active rules bound to a trigger type and entity type.
    async fn active_rules(
        &self,
        trigger_type_id: TriggerTypeId,
        entity_type_id: EntityTypeId,
    ) -> Result<Vec<Arc<RuleDefinition>>, RuleStoreError>;

    /// Returns a rule by ID.
    async fn get(&self, rule_id: RuleId) -> Result<Option<Arc<RuleDefinition>>, RuleStoreError>;

    /// Returns summaries of all stored rules.
    async fn list(&self) -> Result<Vec<RuleSummary>, RuleStoreError>;
}

/// Rule store held in memory.
///
/// Every rule is validated against the catalog and registry on save.
pub struct InMemoryRuleStore {
    catalog: Arc<Catalog>,
    registry: Arc<ActionRegistry>,
    rules: RwLock<HashMap<RuleId, Arc<RuleDefinition>>>,
}

impl InMemoryRuleStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(catalog: Arc<Catalog>, registry: Arc<ActionRegistry>) -> Self {
        Self {
            catalog,
            registry,
            rules: RwLock::new(HashMap::new()),
        }
    }

    /// Validates and stores a rule, replacing any rule with the same ID.
    ///
    /// # Errors
    ///
    /// Returns `RuleStoreError::Invalid` if validation fails.
    pub async fn save(&self, rule: RuleDefinition) -> Result<Arc<RuleDefinition>, RuleStoreError> {
        rule.validate(&self.catalog, &self.registry)
            .map_err(|source| RuleStoreError::Invalid {
                rule_id: rule.id,
                source,
            })?;

        info!(rule_id = %rule.id, rule_name = %rule.name, "rule saved");
        let rule = Arc::new(rule);
        self.rules.write().await.insert(rule.id, rule.clone());
        Ok(rule)
    }

    /// Parses a JSON array of rules and saves each one.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or any rule is invalid.
    pub async fn load_json(&self, json: &str) -> Result<usize, RuleStoreError> {
        let rules: Vec<RuleDefinition> =
            serde_json::from_str(json).map_err(|e| RuleStoreError::Unavailable {
                message: format!("failed to parse rules: {e}"),
            })?;
        let count = rules.len();
        for rule in rules {
            self.save(rule).await?;
        }
        Ok(count)
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn active_rules(
        &self,
        trigger_type_id: TriggerTypeId,
        entity_type_id: EntityTypeId,
    ) -> Result<Vec<Arc<RuleDefinition>>, RuleStoreError> {
        let rules = self.rules.read().await;
        let mut matched: Vec<Arc<RuleDefinition>> = rules
            .values()
            .filter(|r| {
                r.is_active
                    && r.trigger_type_id == trigger_type_id
                    && r.entity_type_id == entity_type_id
            })
            .cloned()
            .collect();
        matched.sort_by_key(|r| r.id);
        Ok(matched)
    }

    async fn get(&self, rule_id: RuleId) -> Result<Option<Arc<RuleDefinition>>, RuleStoreError> {
        Ok(self.rules.read().await.get(&rule_id).cloned())
    }

    async fn list(&self) -> Result<Vec<RuleSummary>, RuleStoreError> {
        let rules = self.rules.read().await;
        let mut summaries: Vec<RuleSummary> =
            rules.values().map(|r| RuleSummary::from(r.as_ref())).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::registry::ActionRegistryBuilder;
    use crate::graph::RuleGraph;
    use crate::node::Node;
    use crate::outbox::InMemoryOutbox;
    use crate::trigger::EventKind;
    use serde_json::json;

    fn store() -> (Arc<Catalog>, InMemoryRuleStore) {
        let catalog = Arc::new(Catalog::embedded().expect("catalog"));
        let registry = Arc::new(
            ActionRegistryBuilder::with_builtins(Arc::new(InMemoryOutbox::new()))
                .build(&catalog)
                .expect("registry"),
        );
        (catalog.clone(), InMemoryRuleStore::new(catalog, registry))
    }

    fn log_rule(catalog: &Catalog, message: &str) -> RuleDefinition {
        let info = catalog.action_type("log_entry").expect("log_entry");
        let node = Node::new("Log", info, json!({ "message": message }));
        let entry = node.id;
        let mut graph = RuleGraph::new();
        graph.add_node(node).expect("add node");
        RuleDefinition::new(
            "Log rule",
            catalog.trigger_type_for(EventKind::Updated).expect("on_update").id,
            catalog.entity_type_by_name("orders").expect("orders").id,
            entry,
            graph,
        )
    }

    #[tokio::test]
    async fn save_and_get() {
        let (catalog, store) = store();
        let rule = log_rule(&catalog, "order changed");
        let id = rule.id;
        store.save(rule).await.expect("save");

        let fetched = store.get(id).await.expect("get").expect("present");
        assert_eq!(fetched.id, id);
        assert_eq!(store.list().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn save_rejects_invalid_rule() {
        let (catalog, store) = store();
        let rule = log_rule(&catalog, "");
        let id = rule.id;

        let err = store.save(rule).await.unwrap_err();
        assert!(matches!(err, RuleStoreError::Invalid { rule_id, .. } if rule_id == id));
        assert!(store.get(id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn active_rules_filters_binding() {
        let (catalog, store) = store();
        store.save(log_rule(&catalog, "one")).await.expect("save");
        let mut inactive = log_rule(&catalog, "two");
        inactive.deactivate();
        store.save(inactive).await.expect("save");

        let on_update = catalog.trigger_type_for(EventKind::Updated).unwrap().id;
        let on_create = catalog.trigger_type_for(EventKind::Created).unwrap().id;
        let orders = catalog.entity_type_by_name("orders").unwrap().id;

        assert_eq!(store.active_rules(on_update, orders).await.unwrap().len(), 1);
        assert!(store.active_rules(on_create, orders).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_json_seeds_rules() {
        let (catalog, store) = store();
        let rules = vec![log_rule(&catalog, "a"), log_rule(&catalog, "b")];
        let json = serde_json::to_string(&rules).expect("serialize");

        assert_eq!(store.load_json(&json).await.expect("load"), 2);
        assert!(store.load_json("not json").await.is_err());
    }
}
