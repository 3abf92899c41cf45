//! Action handler contract.
//!
//! Graph nodes never perform side effects themselves. Each node names an
//! action type, and the registry maps that name to a handler implementing
//! one of two capability traits:
//!
//! - [`SyncActionHandler`]: finishes within the invocation and reports the
//!   result plus, optionally, the output port to exit through.
//! - [`AsyncActionHandler`]: only records that the work was started. The
//!   node's branch then waits for an external completion signal.
//!
//! Both share [`ActionHandler`] for identification and config validation.

pub mod builtin;
pub mod registry;

use crate::trigger::EventKind;
use async_trait::async_trait;
use autorule_core::{NodeId, RunInstanceId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Everything a handler knows about the node visit it serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub entity_type: String,
    pub event_type: EventKind,
    pub rule_name: String,
    pub run_instance_id: RunInstanceId,
    pub node_id: NodeId,
    /// 1-based attempt number; retries of the same node increment it.
    pub attempt: u32,
    /// Snapshot of the triggering record.
    pub raw_data: JsonValue,
}

impl ExecutionContext {
    /// Key identifying this exact invocation.
    ///
    /// Handlers pass it to external systems so a redelivered invocation is
    /// recognised as a duplicate.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.run_instance_id, self.node_id, self.attempt)
    }
}

/// Result of a synchronous action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutput {
    /// Handler-defined result payload, recorded on the execution record.
    pub result: JsonValue,
    /// Port to exit through; `None` takes the node's default port.
    pub port: Option<String>,
}

impl ActionOutput {
    /// Output that exits through the default port.
    #[must_use]
    pub fn new(result: JsonValue) -> Self {
        Self { result, port: None }
    }

    /// Selects a named port.
    #[must_use]
    pub fn via(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }
}

/// Acknowledgement that an asynchronous action was started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Whatever the external system returned when accepting the work.
    pub ack: JsonValue,
}

/// How a handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionErrorKind {
    /// The configuration is unusable. Never retried.
    Validation,
    /// A temporary failure such as a network error. Retried with backoff.
    Transient,
    /// The business operation was refused. Never retried.
    TerminalBusiness,
}

/// An error reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    pub kind: ActionErrorKind,
    pub message: String,
}

impl ActionError {
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: ActionErrorKind::Validation,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ActionErrorKind::Transient,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: ActionErrorKind::TerminalBusiness,
            message: message.into(),
        }
    }

    /// Returns true if the failure may succeed on another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind == ActionErrorKind::Transient
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ActionErrorKind::Validation => write!(f, "invalid configuration: {}", self.message),
            ActionErrorKind::Transient => write!(f, "transient failure: {}", self.message),
            ActionErrorKind::TerminalBusiness => write!(f, "action refused: {}", self.message),
        }
    }
}

impl std::error::Error for ActionError {}

/// Identification and validation shared by every handler.
pub trait ActionHandler: Send + Sync {
    /// Catalog key this handler serves.
    fn action_type(&self) -> &str;

    /// Checks a node config beyond what the JSON Schema expresses.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error describing the problem.
    fn validate(&self, config: &JsonValue) -> Result<(), ActionError> {
        let _ = config;
        Ok(())
    }
}

/// A handler that finishes within the invocation.
#[async_trait]
pub trait SyncActionHandler: ActionHandler {
    /// Performs the action.
    async fn execute(
        &self,
        config: &JsonValue,
        ctx: &ExecutionContext,
    ) -> Result<ActionOutput, ActionError>;
}

/// A handler that starts work completed later by an external signal.
#[async_trait]
pub trait AsyncActionHandler: ActionHandler {
    /// Registers the intent to perform the action.
    async fn execute(
        &self,
        config: &JsonValue,
        ctx: &ExecutionContext,
    ) -> Result<PendingAction, ActionError>;
}

/// Deserializes a node config into a handler's typed config.
pub(crate) fn parse_config<T: serde::de::DeserializeOwned>(
    config: &JsonValue,
) -> Result<T, ActionError> {
    serde_json::from_value(config.clone()).map_err(|e| ActionError::validation(e.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn context(raw_data: JsonValue) -> ExecutionContext {
        ExecutionContext {
            entity_id: "42".to_string(),
            entity_name: Some("Pump 42".to_string()),
            entity_type: "asset_conditions".to_string(),
            event_type: EventKind::Created,
            rule_name: "Test rule".to_string(),
            run_instance_id: RunInstanceId::new(),
            node_id: NodeId::new(),
            attempt: 1,
            raw_data,
        }
    }

    #[test]
    fn idempotency_key_includes_attempt() {
        let mut ctx = context(json!({}));
        let first = ctx.idempotency_key();
        ctx.attempt = 2;
        let second = ctx.idempotency_key();

        assert_ne!(first, second);
        assert!(first.ends_with(":1"));
        assert!(first.starts_with(&ctx.run_instance_id.to_string()));
    }

    #[test]
    fn action_error_retryability() {
        assert!(ActionError::transient("timeout").is_retryable());
        assert!(!ActionError::validation("bad").is_retryable());
        assert!(!ActionError::terminal("no stock").is_retryable());
        assert_eq!(
            ActionError::terminal("no stock").to_string(),
            "action refused: no stock"
        );
    }

    #[test]
    fn output_port_selection() {
        let output = ActionOutput::new(json!({"ok": true})).via("true");
        assert_eq!(output.port.as_deref(), Some("true"));
        assert!(ActionOutput::new(json!(null)).port.is_none());
    }
}
