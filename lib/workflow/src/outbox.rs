//! Outbound side effects.
//!
//! Handlers that reach outside the engine (alerts, notifications, field
//! updates, approval/email/inventory requests) hand a message to the
//! outbox instead of calling the external system directly. Every message
//! carries the invocation's idempotency key, so a redelivered invocation
//! produces a message the transport recognises as a duplicate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::fmt;
use tokio::sync::Mutex;
use tracing::debug;

/// What an outbound message asks the receiving system to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundKind {
    Alert,
    Notification,
    FieldUpdate,
    /// Start of an asynchronous action; the receiver answers with a
    /// completion signal.
    Request {
        action_type: String,
    },
}

impl OutboundKind {
    /// Subject suffix the message is routed under.
    #[must_use]
    pub fn route(&self) -> &str {
        match self {
            Self::Alert => "alert",
            Self::Notification => "notification",
            Self::FieldUpdate => "field_update",
            Self::Request { action_type } => action_type,
        }
    }
}

/// A message bound for an external system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(flatten)]
    pub kind: OutboundKind,
    /// `run:node:attempt` key of the invocation that produced the message.
    pub idempotency_key: String,
    pub payload: JsonValue,
}

impl OutboundMessage {
    #[must_use]
    pub fn new(kind: OutboundKind, idempotency_key: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            kind,
            idempotency_key: idempotency_key.into(),
            payload,
        }
    }
}

/// Errors from outbox delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// The message could not be serialized.
    Serialization { message: String },
    /// The transport rejected or did not acknowledge the message.
    SendFailed { message: String },
}

impl fmt::Display for OutboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialization { message } => {
                write!(f, "failed to serialize outbound message: {message}")
            }
            Self::SendFailed { message } => write!(f, "outbound send failed: {message}"),
        }
    }
}

impl std::error::Error for OutboxError {}

/// Transport for outbound messages.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Sends a message. Sending the same idempotency key twice must not
    /// deliver it twice.
    async fn send(&self, message: OutboundMessage) -> Result<(), OutboxError>;
}

#[derive(Default)]
struct InMemoryOutboxState {
    messages: Vec<OutboundMessage>,
    seen: HashSet<(String, String)>,
}

/// Outbox that keeps messages in memory.
///
/// Used when no message broker is configured, and by tests.
#[derive(Default)]
pub struct InMemoryOutbox {
    state: Mutex<InMemoryOutboxState>,
}

impl InMemoryOutbox {
    /// Creates an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every delivered message in send order.
    pub async fn messages(&self) -> Vec<OutboundMessage> {
        self.state.lock().await.messages.clone()
    }
}

#[async_trait]
impl Outbox for InMemoryOutbox {
    async fn send(&self, message: OutboundMessage) -> Result<(), OutboxError> {
        let mut state = self.state.lock().await;
        let key = (
            message.kind.route().to_string(),
            message.idempotency_key.clone(),
        );
        if !state.seen.insert(key) {
            debug!(idempotency_key = %message.idempotency_key, "duplicate outbound message dropped");
            return Ok(());
        }
        state.messages.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn duplicates_are_dropped() {
        let outbox = InMemoryOutbox::new();
        let message = OutboundMessage::new(OutboundKind::Alert, "run:node:1", json!({"a": 1}));

        outbox.send(message.clone()).await.unwrap();
        outbox.send(message).await.unwrap();
        outbox
            .send(OutboundMessage::new(OutboundKind::Alert, "run:node:2", json!({})))
            .await
            .unwrap();

        assert_eq!(outbox.messages().await.len(), 2);
    }

    #[test]
    fn request_routes_by_action_type() {
        let kind = OutboundKind::Request {
            action_type: "send_email".to_string(),
        };
        assert_eq!(kind.route(), "send_email");
        assert_eq!(OutboundKind::FieldUpdate.route(), "field_update");
    }

    #[test]
    fn message_json_shape() {
        let message = OutboundMessage::new(
            OutboundKind::Request {
                action_type: "seek_approval".to_string(),
            },
            "k",
            json!({}),
        );
        let json = serde_json::to_value(&message).expect("serialize");
        assert_eq!(json["kind"], "request");
        assert_eq!(json["action_type"], "seek_approval");
        assert_eq!(json["idempotency_key"], "k");
    }
}
