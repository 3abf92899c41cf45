use crate::action::{
    ActionError, ActionHandler, AsyncActionHandler, ExecutionContext, PendingAction, parse_config,
};
use crate::outbox::{OutboundKind, OutboundMessage, Outbox};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct EmailConfig {
    recipients: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApprovalConfig {
    approvers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AllocationItem {
    product_id: String,
}

#[derive(Debug, Deserialize)]
struct AllocationConfig {
    items: Vec<AllocationItem>,
}

fn validate_email(config: &JsonValue) -> Result<(), ActionError> {
    let config: EmailConfig = parse_config(config)?;
    match config.recipients.iter().find(|r| !r.contains('@')) {
        Some(bad) => Err(ActionError::validation(format!(
            "'{bad}' is not an email address"
        ))),
        None => Ok(()),
    }
}

fn validate_approval(config: &JsonValue) -> Result<(), ActionError> {
    let config: ApprovalConfig = parse_config(config)?;
    let mut seen = HashSet::new();
    for approver in &config.approvers {
        if approver.trim().is_empty() {
            return Err(ActionError::validation("approvers must not be blank"));
        }
        if !seen.insert(approver.as_str()) {
            return Err(ActionError::validation(format!(
                "approver '{approver}' is listed twice"
            )));
        }
    }
    Ok(())
}

fn validate_allocation(config: &JsonValue) -> Result<(), ActionError> {
    let config: AllocationConfig = parse_config(config)?;
    let mut seen = HashSet::new();
    for item in &config.items {
        if !seen.insert(item.product_id.as_str()) {
            return Err(ActionError::validation(format!(
                "product '{}' is allocated twice",
                item.product_id
            )));
        }
    }
    Ok(())
}

/// Starts work in an external system and waits for its completion signal.
///
/// The request goes out through the outbox keyed by the invocation's
/// idempotency key; the receiving system answers with the same run and node
/// once the work is done.
pub struct ExternalRequest {
    action_type: &'static str,
    check: fn(&JsonValue) -> Result<(), ActionError>,
    outbox: Arc<dyn Outbox>,
}

impl ExternalRequest {
    /// Human approval; completes through `approved` or `rejected`.
    #[must_use]
    pub fn seek_approval(outbox: Arc<dyn Outbox>) -> Self {
        Self {
            action_type: "seek_approval",
            check: validate_approval,
            outbox,
        }
    }

    /// Email delivery; completes through `delivered` or `bounced`.
    #[must_use]
    pub fn send_email(outbox: Arc<dyn Outbox>) -> Self {
        Self {
            action_type: "send_email",
            check: validate_email,
            outbox,
        }
    }

    /// Stock reservation; completes through `reserved` or `backordered`.
    #[must_use]
    pub fn allocate_inventory(outbox: Arc<dyn Outbox>) -> Self {
        Self {
            action_type: "allocate_inventory",
            check: validate_allocation,
            outbox,
        }
    }
}

impl ActionHandler for ExternalRequest {
    fn action_type(&self) -> &str {
        self.action_type
    }

    fn validate(&self, config: &JsonValue) -> Result<(), ActionError> {
        (self.check)(config)
    }
}

#[async_trait]
impl AsyncActionHandler for ExternalRequest {
    async fn execute(
        &self,
        config: &JsonValue,
        ctx: &ExecutionContext,
    ) -> Result<PendingAction, ActionError> {
        let request_id = ctx.idempotency_key();
        let payload = json!({
            "run_instance_id": ctx.run_instance_id,
            "node_id": ctx.node_id,
            "attempt": ctx.attempt,
            "entity_type": ctx.entity_type,
            "entity_id": ctx.entity_id,
            "entity_name": ctx.entity_name,
            "rule_name": ctx.rule_name,
            "config": config,
        });
        self.outbox
            .send(OutboundMessage::new(
                OutboundKind::Request {
                    action_type: self.action_type.to_string(),
                },
                request_id.clone(),
                payload,
            ))
            .await
            .map_err(|e| ActionError::transient(e.to_string()))?;

        debug!(action_type = self.action_type, %request_id, "external request sent");
        Ok(PendingAction {
            ack: json!({ "request_id": request_id }),
        })
    }
}
