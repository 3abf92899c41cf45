use super::template::render;
use crate::action::{
    ActionError, ActionHandler, ActionOutput, ExecutionContext, SyncActionHandler, parse_config,
};
use crate::outbox::{OutboundKind, OutboundMessage, Outbox};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;

fn default_channel() -> String {
    "in_app".to_string()
}

fn default_priority() -> String {
    "medium".to_string()
}

#[derive(Debug, Deserialize)]
struct NotificationConfig {
    recipients: Vec<String>,
    #[serde(default = "default_channel")]
    channel: String,
    #[serde(default = "default_priority")]
    priority: String,
    message: String,
}

/// Delivers a notification to users; exits through `sent`.
pub struct SendNotification {
    outbox: Arc<dyn Outbox>,
}

impl SendNotification {
    #[must_use]
    pub fn new(outbox: Arc<dyn Outbox>) -> Self {
        Self { outbox }
    }
}

impl ActionHandler for SendNotification {
    fn action_type(&self) -> &str {
        "send_notification"
    }

    fn validate(&self, config: &JsonValue) -> Result<(), ActionError> {
        let config: NotificationConfig = parse_config(config)?;
        if config.recipients.iter().any(|r| r.trim().is_empty()) {
            return Err(ActionError::validation("recipients must not be blank"));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncActionHandler for SendNotification {
    async fn execute(
        &self,
        config: &JsonValue,
        ctx: &ExecutionContext,
    ) -> Result<ActionOutput, ActionError> {
        let config: NotificationConfig = parse_config(config)?;
        let payload = json!({
            "recipients": config.recipients,
            "channel": config.channel,
            "priority": config.priority,
            "message": render(&config.message, ctx),
            "entity_type": ctx.entity_type,
            "entity_id": ctx.entity_id,
        });
        self.outbox
            .send(OutboundMessage::new(
                OutboundKind::Notification,
                ctx.idempotency_key(),
                payload,
            ))
            .await
            .map_err(|e| ActionError::transient(e.to_string()))?;

        Ok(ActionOutput::new(json!({
            "recipients": config.recipients.len(),
            "channel": config.channel,
        })))
    }
}
