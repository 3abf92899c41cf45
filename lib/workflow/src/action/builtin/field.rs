use crate::action::{
    ActionError, ActionHandler, ActionOutput, ExecutionContext, SyncActionHandler, parse_config,
};
use crate::outbox::{OutboundKind, OutboundMessage, Outbox};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;

/// Columns automation may never overwrite.
const PROTECTED_FIELDS: &[&str] = &["id", "created_at", "created_by"];

#[derive(Debug, Deserialize)]
struct FieldConfig {
    target_field: String,
    value: JsonValue,
}

/// Sets a field on the triggering record.
///
/// The write itself belongs to the owning entity service; this handler asks
/// for it through the outbox.
pub struct UpdateField {
    outbox: Arc<dyn Outbox>,
}

impl UpdateField {
    #[must_use]
    pub fn new(outbox: Arc<dyn Outbox>) -> Self {
        Self { outbox }
    }
}

impl ActionHandler for UpdateField {
    fn action_type(&self) -> &str {
        "update_field"
    }

    fn validate(&self, config: &JsonValue) -> Result<(), ActionError> {
        let config: FieldConfig = parse_config(config)?;
        if PROTECTED_FIELDS.contains(&config.target_field.as_str()) {
            return Err(ActionError::validation(format!(
                "field '{}' cannot be updated by automation",
                config.target_field
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncActionHandler for UpdateField {
    async fn execute(
        &self,
        config: &JsonValue,
        ctx: &ExecutionContext,
    ) -> Result<ActionOutput, ActionError> {
        let config: FieldConfig = parse_config(config)?;
        let previous = ctx
            .raw_data
            .get(&config.target_field)
            .cloned()
            .unwrap_or(JsonValue::Null);

        let payload = json!({
            "entity_type": ctx.entity_type,
            "entity_id": ctx.entity_id,
            "field": config.target_field,
            "value": config.value,
        });
        self.outbox
            .send(OutboundMessage::new(
                OutboundKind::FieldUpdate,
                ctx.idempotency_key(),
                payload,
            ))
            .await
            .map_err(|e| ActionError::transient(e.to_string()))?;

        Ok(ActionOutput::new(json!({
            "field": config.target_field,
            "previous": previous,
            "value": config.value,
        })))
    }
}
