//! Node execution.
//!
//! The worker turns a [`WorkItem`] into a [`WorkItemResult`]:
//! 1. Look up the action type in the catalog
//! 2. Validate the config against the type's schema, then the handler's own rules
//! 3. Dispatch to the sync or async handler
//!
//! Graph logic stays in the orchestrator; the worker never sees the rule.

use crate::action::registry::{ActionRegistry, Dispatch};
use crate::action::ActionError;
use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::orchestrator::{NodeOutcome, WorkItem, WorkItemResult};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Executes node invocations against the registry.
#[derive(Clone)]
pub struct Worker {
    catalog: Arc<Catalog>,
    registry: Arc<ActionRegistry>,
    config: Arc<EngineConfig>,
}

impl Worker {
    #[must_use]
    pub fn new(
        catalog: Arc<Catalog>,
        registry: Arc<ActionRegistry>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            catalog,
            registry,
            config,
        }
    }

    /// Executes a work item. Every failure is reported in the result.
    #[instrument(skip_all, fields(run_id = %item.run_id, node_id = %item.node_id, action_type = %item.action_type, attempt = item.attempt))]
    pub async fn execute(&self, item: WorkItem) -> WorkItemResult {
        let outcome = match self.run(&item).await {
            Ok(outcome) => outcome,
            Err(error) => NodeOutcome::Failed(error),
        };
        debug!(?outcome, "node invocation finished");
        WorkItemResult {
            run_id: item.run_id,
            node_id: item.node_id,
            attempt: item.attempt,
            outcome,
        }
    }

    async fn run(&self, item: &WorkItem) -> Result<NodeOutcome, ActionError> {
        let info = self.catalog.action_type(&item.action_type).ok_or_else(|| {
            ActionError::validation(format!("unknown action type '{}'", item.action_type))
        })?;

        info.config_schema
            .validate(&item.config)
            .map_err(|violation| ActionError::validation(violation.to_string()))?;

        let handler = self
            .registry
            .dispatch(info)
            .map_err(|e| ActionError::validation(e.to_string()))?;
        handler.validate(&item.config)?;

        match handler {
            Dispatch::Sync(handler) => {
                let output = handler.execute(&item.config, &item.context).await?;
                Ok(NodeOutcome::Completed {
                    result: output.result,
                    port: output.port,
                })
            }
            Dispatch::Async(handler) => {
                let pending = handler.execute(&item.config, &item.context).await?;
                Ok(NodeOutcome::Pending {
                    ack: pending.ack,
                    timeout: self.config.timeout_for(info),
                })
            }
        }
    }
}
