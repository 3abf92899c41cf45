use super::template::render;
use crate::action::{
    ActionError, ActionHandler, ActionOutput, ExecutionContext, SyncActionHandler, parse_config,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Level {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Deserialize)]
struct LogConfig {
    #[serde(default)]
    level: Level,
    message: String,
}

/// Writes a line to the automation log.
pub struct LogEntry;

impl ActionHandler for LogEntry {
    fn action_type(&self) -> &str {
        "log_entry"
    }

    fn validate(&self, config: &JsonValue) -> Result<(), ActionError> {
        parse_config::<LogConfig>(config).map(|_| ())
    }
}

#[async_trait]
impl SyncActionHandler for LogEntry {
    async fn execute(
        &self,
        config: &JsonValue,
        ctx: &ExecutionContext,
    ) -> Result<ActionOutput, ActionError> {
        let config: LogConfig = parse_config(config)?;
        let message = render(&config.message, ctx);
        let run_id = ctx.run_instance_id;
        let rule = ctx.rule_name.as_str();

        match config.level {
            Level::Debug => debug!(%run_id, rule, "{message}"),
            Level::Info => info!(%run_id, rule, "{message}"),
            Level::Warn => warn!(%run_id, rule, "{message}"),
            Level::Error => error!(%run_id, rule, "{message}"),
        }

        Ok(ActionOutput::new(json!({ "message": message })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::tests::context;

    #[tokio::test]
    async fn renders_message() {
        let output = LogEntry
            .execute(
                &json!({ "level": "warn", "message": "{{entity_type}} changed" }),
                &context(json!({})),
            )
            .await
            .expect("execute");
        assert_eq!(output.result["message"], "asset_conditions changed");
    }

    #[test]
    fn rejects_unknown_level() {
        assert!(
            LogEntry
                .validate(&json!({ "level": "shout", "message": "x" }))
                .is_err()
        );
    }
}
