use super::template::render;
use crate::action::{
    ActionError, ActionHandler, ActionOutput, ExecutionContext, SyncActionHandler, parse_config,
};
use crate::outbox::{OutboundKind, OutboundMessage, Outbox};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
struct AlertConfig {
    alert_type: String,
    severity: String,
    #[serde(default)]
    title: Option<String>,
    message: String,
    #[serde(default)]
    recipients: Vec<String>,
}

/// Raises an operator alert about the triggering record.
pub struct CreateAlert {
    outbox: Arc<dyn Outbox>,
}

impl CreateAlert {
    #[must_use]
    pub fn new(outbox: Arc<dyn Outbox>) -> Self {
        Self { outbox }
    }
}

impl ActionHandler for CreateAlert {
    fn action_type(&self) -> &str {
        "create_alert"
    }

    fn validate(&self, config: &JsonValue) -> Result<(), ActionError> {
        parse_config::<AlertConfig>(config).map(|_| ())
    }
}

#[async_trait]
impl SyncActionHandler for CreateAlert {
    async fn execute(
        &self,
        config: &JsonValue,
        ctx: &ExecutionContext,
    ) -> Result<ActionOutput, ActionError> {
        let config: AlertConfig = parse_config(config)?;
        let title = config
            .title
            .as_deref()
            .map_or_else(|| format!("{} alert", config.alert_type), |t| render(t, ctx));
        let message = render(&config.message, ctx);

        let payload = json!({
            "alert_type": config.alert_type,
            "severity": config.severity,
            "title": title,
            "message": message,
            "recipients": config.recipients,
            "entity_type": ctx.entity_type,
            "entity_id": ctx.entity_id,
            "rule_name": ctx.rule_name,
        });
        self.outbox
            .send(OutboundMessage::new(
                OutboundKind::Alert,
                ctx.idempotency_key(),
                payload.clone(),
            ))
            .await
            .map_err(|e| ActionError::transient(e.to_string()))?;

        info!(
            run_id = %ctx.run_instance_id,
            node_id = %ctx.node_id,
            severity = %config.severity,
            "alert raised"
        );
        Ok(ActionOutput::new(payload))
    }
}
