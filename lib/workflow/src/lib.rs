//! Automation engine for autorule.
//!
//! Domain services report entity mutations; this crate decides which rules
//! they fire and runs each rule's action graph to completion:
//!
//! - **Catalog**: trigger types, entity types and action types with their
//!   config schemas and output ports
//! - **Graph Model**: rules as petgraph graphs of action nodes joined at
//!   output ports
//! - **Actions**: the handler contract, the registry and the built-in
//!   handlers
//! - **Matching**: domain events to run requests
//! - **Execution**: journaled run state, the per-run orchestrator, the
//!   worker and the in-process engine
//! - **NATS**: JetStream journal and outbox adapters

pub mod action;
pub mod catalog;
pub mod config;
pub mod definition;
pub mod edge;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod execution;
pub mod graph;
pub mod nats;
pub mod node;
pub mod orchestrator;
pub mod outbox;
pub mod port;
pub mod remaining_work;
pub mod retry;
pub mod rule_store;
pub mod run_state;
pub mod schema;
pub mod trigger;
pub mod worker;

pub use action::registry::{ActionRegistry, ActionRegistryBuilder};
pub use action::{ActionError, ActionErrorKind, ExecutionContext};
pub use catalog::{ActionTypeInfo, Catalog};
pub use config::{EngineConfig, RetryConfig};
pub use definition::{RuleDefinition, RuleSummary};
pub use edge::Edge;
pub use engine::{Engine, EngineError};
pub use error::{DefinitionError, GraphError};
pub use execution::{ActionExecutionRecord, ExecutionEvent, RunInstance, RunSnapshot, RunStatus};
pub use graph::RuleGraph;
pub use node::Node;
pub use orchestrator::{
    CompletionAck, CompletionOutcome, CompletionSignal, EventStore, InMemoryEventStore,
};
pub use outbox::{InMemoryOutbox, Outbox};
pub use port::OutputPort;
pub use rule_store::{InMemoryRuleStore, RuleStore};
pub use trigger::{EventKind, TriggerEvent, TriggerPublisher};
