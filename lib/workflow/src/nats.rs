//! NATS adapters.
//!
//! - Run journals live in a JetStream stream, one subject per run
//! - Outbound messages go to a work-queue stream, one subject per route
//! - Completion signals and trigger events arrive on core NATS subjects
//!
//! Every JetStream publish carries a `Nats-Msg-Id` header, so a message
//! written twice within the stream's duplicate window is stored once.

use crate::envelope::{self, Envelope};
use crate::execution::ExecutionEvent;
use crate::orchestrator::{EventStore, EventStoreError};
use crate::outbox::{OutboundMessage, Outbox, OutboxError};
use async_nats::jetstream;
use async_nats::HeaderMap;
use async_trait::async_trait;
use autorule_core::RunInstanceId;
use futures::StreamExt;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

const MESSAGE_ID_HEADER: &str = "Nats-Msg-Id";

/// How long a journal read waits for the next message before assuming the
/// end of the run's subject.
const LOAD_IDLE_TIMEOUT: Duration = Duration::from_millis(100);

/// NATS connection and naming.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    pub url: String,

    #[serde(default = "default_journal_stream")]
    pub journal_stream: String,

    /// Journal subjects are `<prefix>.<run_id>`.
    #[serde(default = "default_journal_subject_prefix")]
    pub journal_subject_prefix: String,

    #[serde(default = "default_outbox_stream")]
    pub outbox_stream: String,

    /// Outbound subjects are `<prefix>.<route>`.
    #[serde(default = "default_outbox_subject_prefix")]
    pub outbox_subject_prefix: String,

    /// Subject completion signals arrive on.
    #[serde(default = "default_completion_subject")]
    pub completion_subject: String,

    /// Subject entity services publish trigger events on.
    #[serde(default = "default_events_subject")]
    pub events_subject: String,
}

fn default_journal_stream() -> String {
    "AUTOMATION_RUNS".to_string()
}

fn default_journal_subject_prefix() -> String {
    "automation.run".to_string()
}

fn default_outbox_stream() -> String {
    "AUTOMATION_OUTBOX".to_string()
}

fn default_outbox_subject_prefix() -> String {
    "automation.outbox".to_string()
}

fn default_completion_subject() -> String {
    "automation.complete".to_string()
}

fn default_events_subject() -> String {
    "automation.events".to_string()
}

impl NatsConfig {
    /// Creates a config with default stream and subject names.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            journal_stream: default_journal_stream(),
            journal_subject_prefix: default_journal_subject_prefix(),
            outbox_stream: default_outbox_stream(),
            outbox_subject_prefix: default_outbox_subject_prefix(),
            completion_subject: default_completion_subject(),
            events_subject: default_events_subject(),
        }
    }

    fn journal_subject(&self, run_id: RunInstanceId) -> String {
        format!("{}.{run_id}", self.journal_subject_prefix)
    }

    fn outbox_subject(&self, route: &str) -> String {
        format!("{}.{route}", self.outbox_subject_prefix)
    }
}

/// Errors from NATS setup.
#[derive(Debug)]
pub enum NatsSetupError {
    Connect { message: String },
    Stream { stream: String, message: String },
}

impl fmt::Display for NatsSetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { message } => write!(f, "failed to connect to NATS: {message}"),
            Self::Stream { stream, message } => {
                write!(f, "failed to set up stream {stream}: {message}")
            }
        }
    }
}

impl std::error::Error for NatsSetupError {}

/// A NATS connection with the engine's streams in place.
#[derive(Clone)]
pub struct NatsConnection {
    pub client: async_nats::Client,
    pub jetstream: jetstream::Context,
    pub config: NatsConfig,
}

impl NatsConnection {
    /// Connects and creates the journal and outbox streams if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or stream setup fails.
    pub async fn connect(config: NatsConfig) -> Result<Self, NatsSetupError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| NatsSetupError::Connect {
                message: e.to_string(),
            })?;
        let jetstream = jetstream::new(client.clone());

        let streams = [
            jetstream::stream::Config {
                name: config.journal_stream.clone(),
                subjects: vec![format!("{}.>", config.journal_subject_prefix)],
                storage: jetstream::stream::StorageType::File,
                retention: jetstream::stream::RetentionPolicy::Limits,
                ..Default::default()
            },
            jetstream::stream::Config {
                name: config.outbox_stream.clone(),
                subjects: vec![format!("{}.>", config.outbox_subject_prefix)],
                storage: jetstream::stream::StorageType::File,
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                ..Default::default()
            },
        ];
        for stream in streams {
            let name = stream.name.clone();
            jetstream
                .get_or_create_stream(stream)
                .await
                .map_err(|e| NatsSetupError::Stream {
                    stream: name,
                    message: e.to_string(),
                })?;
        }

        info!(url = %config.url, "connected to NATS");
        Ok(Self {
            client,
            jetstream,
            config,
        })
    }

    /// Publishes to JetStream and waits for the stream's acknowledgement.
    async fn publish_deduplicated(
        &self,
        subject: String,
        message_id: &str,
        bytes: Vec<u8>,
    ) -> Result<(), String> {
        let mut headers = HeaderMap::new();
        headers.insert(MESSAGE_ID_HEADER, message_id);

        let ack = self
            .jetstream
            .publish_with_headers(subject, headers, bytes.into())
            .await
            .map_err(|e| e.to_string())?
            .await
            .map_err(|e| e.to_string())?;
        if ack.duplicate {
            debug!(message_id, "duplicate publish ignored by stream");
        }
        Ok(())
    }
}

/// Run journal stored in JetStream.
pub struct NatsEventStore {
    connection: NatsConnection,
}

impl NatsEventStore {
    #[must_use]
    pub fn new(connection: NatsConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl EventStore for NatsEventStore {
    async fn publish(&self, event: Envelope<ExecutionEvent>) -> Result<(), EventStoreError> {
        let subject = self.connection.config.journal_subject(event.payload.run_id());
        let bytes = event
            .to_json_bytes()
            .map_err(|e| EventStoreError::PublishFailed {
                message: format!("failed to serialize event: {e}"),
            })?;

        self.connection
            .publish_deduplicated(subject, &event.message_id, bytes)
            .await
            .map_err(|message| EventStoreError::PublishFailed { message })
    }

    async fn load_events(
        &self,
        run_id: RunInstanceId,
    ) -> Result<Vec<ExecutionEvent>, EventStoreError> {
        let config = &self.connection.config;
        let stream = self
            .connection
            .jetstream
            .get_stream(&config.journal_stream)
            .await
            .map_err(|e| EventStoreError::LoadFailed {
                message: format!("failed to get stream: {e}"),
            })?;

        let consumer = stream
            .create_consumer(jetstream::consumer::pull::Config {
                filter_subject: config.journal_subject(run_id),
                deliver_policy: jetstream::consumer::DeliverPolicy::All,
                ..Default::default()
            })
            .await
            .map_err(|e| EventStoreError::LoadFailed {
                message: format!("failed to create consumer: {e}"),
            })?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| EventStoreError::LoadFailed {
                message: format!("failed to get messages: {e}"),
            })?;

        let mut events = Vec::new();
        while let Ok(Some(message)) = tokio::time::timeout(LOAD_IDLE_TIMEOUT, messages.next()).await
        {
            let message = message.map_err(|e| EventStoreError::LoadFailed {
                message: e.to_string(),
            })?;

            let entry: Envelope<ExecutionEvent> =
                envelope::decode(&message.payload).map_err(|e| EventStoreError::LoadFailed {
                    message: format!("failed to decode journal entry: {e}"),
                })?;
            events.push(entry.into_payload());

            message
                .ack()
                .await
                .map_err(|e| EventStoreError::LoadFailed {
                    message: format!("failed to ack message: {e}"),
                })?;
        }

        debug!(%run_id, events = events.len(), "journal loaded");
        Ok(events)
    }
}

/// Outbox backed by a JetStream work queue.
pub struct NatsOutbox {
    connection: NatsConnection,
}

impl NatsOutbox {
    #[must_use]
    pub fn new(connection: NatsConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl Outbox for NatsOutbox {
    async fn send(&self, message: OutboundMessage) -> Result<(), OutboxError> {
        let route = message.kind.route().to_string();
        let message_id = format!("{route}:{}", message.idempotency_key);
        let envelope = Envelope::new(message_id.clone(), message);
        let bytes = envelope
            .to_json_bytes()
            .map_err(|e| OutboxError::Serialization {
                message: e.to_string(),
            })?;

        self.connection
            .publish_deduplicated(self.connection.config.outbox_subject(&route), &message_id, bytes)
            .await
            .map_err(|message| OutboxError::SendFailed { message })
    }
}
