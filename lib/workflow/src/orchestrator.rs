//! Run orchestration.
//!
//! - One orchestrator per run, owning the run's state
//! - Decides which nodes are ready and hands out work items
//! - Applies handler results, completion signals and timeouts
//! - Appends every transition to the run journal before applying it
//!
//! The orchestrator never runs handlers or sleeps. Everything that has to
//! happen later (dispatching a node, retrying it, firing a timeout) comes
//! back to the caller as a [`Followup`].

use crate::action::{ActionError, ActionErrorKind, ExecutionContext};
use crate::definition::RuleDefinition;
use crate::envelope::Envelope;
use crate::execution::{ExecutionEvent, FailureKind, NodeStatus, RunSnapshot, RunStatus};
use crate::retry::RetryPolicy;
use crate::run_state::{RunState, RunStateBuilder, RunStateError};
use crate::trigger::TriggerEvent;
use async_trait::async_trait;
use autorule_core::{NodeId, RunInstanceId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// One node invocation to hand to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub run_id: RunInstanceId,
    pub node_id: NodeId,
    pub attempt: u32,
    pub action_type: String,
    pub config: JsonValue,
    pub context: ExecutionContext,
}

/// What a node invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// A synchronous handler finished; `None` takes the default port.
    Completed {
        result: JsonValue,
        port: Option<String>,
    },
    /// An asynchronous handler started work.
    Pending {
        ack: JsonValue,
        timeout: Option<Duration>,
    },
    Failed(ActionError),
}

/// A worker's report on a work item.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItemResult {
    pub run_id: RunInstanceId,
    pub node_id: NodeId,
    pub attempt: u32,
    pub outcome: NodeOutcome,
}

/// Work the caller must schedule after an orchestrator call.
#[derive(Debug, Clone, PartialEq)]
pub enum Followup {
    /// Execute now.
    Dispatch(WorkItem),
    /// Execute after `delay`.
    Retry { item: WorkItem, delay: Duration },
    /// Call [`RunOrchestrator::timeout`] after `after` unless the node has
    /// been resolved by then.
    Timer {
        run_id: RunInstanceId,
        node_id: NodeId,
        attempt: u32,
        after: Duration,
    },
}

/// How an external system finished an asynchronous node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompletionOutcome {
    Success {
        #[serde(default)]
        result: JsonValue,
        /// Port to exit through; the node's default when absent.
        #[serde(default)]
        port: Option<String>,
    },
    Failure { error: String },
}

/// Completion signal for an asynchronous node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub run_instance_id: RunInstanceId,
    pub node_id: NodeId,
    pub outcome: CompletionOutcome,
}

/// What happened to a completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionAck {
    /// The node was awaiting its signal and is now resolved.
    Accepted,
    /// The node was already resolved; nothing changed.
    Duplicate,
    /// The run is terminal or the node had not started; nothing changed.
    Discarded,
}

/// Append-only storage for run journals.
///
/// Implemented over JetStream in production and in memory for tests and
/// single-process deployments.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends an entry to its run's journal.
    async fn publish(&self, event: Envelope<ExecutionEvent>) -> Result<(), EventStoreError>;

    /// Loads a run's journal, earliest first.
    async fn load_events(
        &self,
        run_id: RunInstanceId,
    ) -> Result<Vec<ExecutionEvent>, EventStoreError>;
}

#[async_trait]
impl<T: EventStore + ?Sized> EventStore for Arc<T> {
    async fn publish(&self, event: Envelope<ExecutionEvent>) -> Result<(), EventStoreError> {
        (**self).publish(event).await
    }

    async fn load_events(
        &self,
        run_id: RunInstanceId,
    ) -> Result<Vec<ExecutionEvent>, EventStoreError> {
        (**self).load_events(run_id).await
    }
}

/// Errors from event store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    ConnectionFailed { message: String },
    PublishFailed { message: String },
    LoadFailed { message: String },
}

impl fmt::Display for EventStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { message } => {
                write!(f, "event store connection failed: {message}")
            }
            Self::PublishFailed { message } => write!(f, "event publish failed: {message}"),
            Self::LoadFailed { message } => write!(f, "event load failed: {message}"),
        }
    }
}

impl std::error::Error for EventStoreError {}

#[derive(Default)]
struct Journals {
    runs: HashMap<RunInstanceId, Vec<Envelope<ExecutionEvent>>>,
    seen: HashSet<String>,
}

/// Journal kept in process memory.
#[derive(Default)]
pub struct InMemoryEventStore {
    journals: Mutex<Journals>,
}

impl InMemoryEventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the IDs of every run with a journal.
    pub async fn run_ids(&self) -> Vec<RunInstanceId> {
        let mut ids: Vec<RunInstanceId> = self.journals.lock().await.runs.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn publish(&self, event: Envelope<ExecutionEvent>) -> Result<(), EventStoreError> {
        let mut journals = self.journals.lock().await;
        if !journals.seen.insert(event.message_id.clone()) {
            debug!(message_id = %event.message_id, "duplicate journal entry dropped");
            return Ok(());
        }
        journals
            .runs
            .entry(event.payload.run_id())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn load_events(
        &self,
        run_id: RunInstanceId,
    ) -> Result<Vec<ExecutionEvent>, EventStoreError> {
        Ok(self
            .journals
            .lock()
            .await
            .runs
            .get(&run_id)
            .map(|entries| entries.iter().map(|e| e.payload.clone()).collect())
            .unwrap_or_default())
    }
}

/// Errors that can occur during orchestration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    EventStore(EventStoreError),
    RunState(RunStateError),
    RunNotFound { run_id: RunInstanceId },
    RunAlreadyTerminal { run_id: RunInstanceId },
    NodeNotFound { node_id: NodeId },
    /// A completion signal named a port the node does not have.
    UnknownPort { node_id: NodeId, port: String },
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventStore(e) => write!(f, "event store error: {e}"),
            Self::RunState(e) => write!(f, "run state error: {e}"),
            Self::RunNotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::RunAlreadyTerminal { run_id } => {
                write!(f, "run already in terminal state: {run_id}")
            }
            Self::NodeNotFound { node_id } => write!(f, "node not found: {node_id}"),
            Self::UnknownPort { node_id, port } => {
                write!(f, "node {node_id} has no output port '{port}'")
            }
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl OrchestratorError {
    /// True when the journal could not be written or replayed, so the
    /// in-memory state may be ahead of the followups handed out.
    #[must_use]
    pub fn is_journal_failure(&self) -> bool {
        matches!(self, Self::EventStore(_) | Self::RunState(_))
    }
}

impl From<EventStoreError> for OrchestratorError {
    fn from(e: EventStoreError) -> Self {
        Self::EventStore(e)
    }
}

impl From<RunStateError> for OrchestratorError {
    fn from(e: RunStateError) -> Self {
        Self::RunState(e)
    }
}

/// Coordinates a single run.
pub struct RunOrchestrator<E: EventStore> {
    rule: Arc<RuleDefinition>,
    event_store: E,
    retry: RetryPolicy,
    state: RunState,
    /// Journal position of the next entry; part of its message id.
    sequence: u64,
}

impl<E: EventStore> RunOrchestrator<E> {
    /// Starts a new run and returns the entry node's dispatch.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be written.
    #[instrument(skip_all, fields(run_id = %run_id, rule_id = %rule.id))]
    pub async fn start(
        rule: Arc<RuleDefinition>,
        run_id: RunInstanceId,
        trigger_event: TriggerEvent,
        event_store: E,
        retry: RetryPolicy,
    ) -> Result<(Self, Vec<Followup>), OrchestratorError> {
        let event = ExecutionEvent::RunStarted {
            run_id,
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            trigger_event,
            timestamp: Utc::now(),
        };
        event_store
            .publish(Envelope::new(format!("{run_id}:0"), event.clone()))
            .await?;
        let state = RunStateBuilder::new(&rule).build_from_events([event])?;

        info!(rule_name = %rule.name, "run started");
        let mut orchestrator = Self {
            rule,
            event_store,
            retry,
            state,
            sequence: 1,
        };
        let followups = orchestrator.advance().await?;
        Ok((orchestrator, followups))
    }

    /// Rebuilds a run from its journal.
    ///
    /// Nodes that were executing are dispatched again with the same attempt,
    /// so handlers see the same idempotency key. Waiting nodes get their
    /// timers back with whatever time is left.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for an empty journal and `RunAlreadyTerminal`
    /// for finished runs.
    #[instrument(skip_all, fields(run_id = %run_id, rule_id = %rule.id))]
    pub async fn resume(
        rule: Arc<RuleDefinition>,
        run_id: RunInstanceId,
        event_store: E,
        retry: RetryPolicy,
    ) -> Result<(Self, Vec<Followup>), OrchestratorError> {
        let events = event_store.load_events(run_id).await?;
        if events.is_empty() {
            return Err(OrchestratorError::RunNotFound { run_id });
        }
        let sequence = events.len() as u64;
        let state = RunStateBuilder::new(&rule).build_from_events(events)?;
        if state.status.is_terminal() {
            return Err(OrchestratorError::RunAlreadyTerminal { run_id });
        }

        let mut orchestrator = Self {
            rule,
            event_store,
            retry,
            state,
            sequence,
        };

        let now = Utc::now();
        let mut followups = Vec::new();
        for record in orchestrator.state.records() {
            match record.status {
                NodeStatus::Running => {
                    followups.push(Followup::Dispatch(
                        orchestrator.work_item(record.node_id, record.attempt)?,
                    ));
                }
                NodeStatus::WaitingAsync => {
                    if let Some(deadline) = record.deadline {
                        followups.push(Followup::Timer {
                            run_id,
                            node_id: record.node_id,
                            attempt: record.attempt,
                            after: (deadline - now).to_std().unwrap_or(Duration::ZERO),
                        });
                    }
                }
                _ => {}
            }
        }
        followups.extend(orchestrator.advance().await?);

        info!(resumed = followups.len(), "run resumed");
        Ok((orchestrator, followups))
    }

    /// Applies a worker's result.
    ///
    /// Results for terminal runs, resolved nodes and superseded attempts are
    /// discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be written.
    #[instrument(skip_all, fields(run_id = %result.run_id, node_id = %result.node_id, attempt = result.attempt))]
    pub async fn handle_result(
        &mut self,
        result: WorkItemResult,
    ) -> Result<Vec<Followup>, OrchestratorError> {
        if self.state.status.is_terminal() {
            debug!(status = %self.state.status, "result for finished run discarded");
            return Ok(Vec::new());
        }
        let record = self
            .state
            .record(result.node_id)
            .ok_or(OrchestratorError::NodeNotFound {
                node_id: result.node_id,
            })?;
        if record.status != NodeStatus::Running || record.attempt != result.attempt {
            debug!(current_attempt = record.attempt, "stale result discarded");
            return Ok(Vec::new());
        }

        let run_id = self.state.run_id;
        let node_id = result.node_id;
        let attempt = result.attempt;
        let mut followups = Vec::new();

        match result.outcome {
            NodeOutcome::Completed { result, port } => {
                let resolved = self
                    .node(node_id)?
                    .resolve_port(port.as_deref())
                    .map(|p| p.name.clone());
                match resolved {
                    Some(port) => {
                        self.record(ExecutionEvent::NodeCompleted {
                            run_id,
                            node_id,
                            attempt,
                            result,
                            port,
                            timestamp: Utc::now(),
                        })
                        .await?;
                    }
                    None => {
                        let port = port.unwrap_or_default();
                        warn!(%port, "handler selected unknown port");
                        self.record(ExecutionEvent::NodeFailed {
                            run_id,
                            node_id,
                            attempt,
                            kind: FailureKind::Validation,
                            error: format!("handler selected unknown port '{port}'"),
                            timestamp: Utc::now(),
                        })
                        .await?;
                    }
                }
            }
            NodeOutcome::Pending { ack, timeout } => {
                let now = Utc::now();
                let deadline = timeout
                    .and_then(|t| chrono::Duration::from_std(t).ok())
                    .map(|t| now + t);
                self.record(ExecutionEvent::NodeWaiting {
                    run_id,
                    node_id,
                    attempt,
                    ack,
                    deadline,
                    timestamp: now,
                })
                .await?;
                if let Some(after) = timeout {
                    followups.push(Followup::Timer {
                        run_id,
                        node_id,
                        attempt,
                        after,
                    });
                }
            }
            NodeOutcome::Failed(error) => {
                let delay = if error.is_retryable() {
                    self.retry.delay_after(attempt)
                } else {
                    None
                };
                match delay {
                    Some(delay) => {
                        let next_attempt = attempt + 1;
                        warn!(error = %error, next_attempt, ?delay, "retrying node");
                        self.record(ExecutionEvent::NodeRetryScheduled {
                            run_id,
                            node_id,
                            failed_attempt: attempt,
                            error: error.message,
                            next_attempt,
                            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            timestamp: Utc::now(),
                        })
                        .await?;
                        followups.push(Followup::Retry {
                            item: self.work_item(node_id, next_attempt)?,
                            delay,
                        });
                    }
                    None => {
                        warn!(error = %error, "node failed");
                        self.record(ExecutionEvent::NodeFailed {
                            run_id,
                            node_id,
                            attempt,
                            kind: error.kind.into(),
                            error: error.message,
                            timestamp: Utc::now(),
                        })
                        .await?;
                    }
                }
            }
        }

        followups.extend(self.advance().await?);
        Ok(followups)
    }

    /// Resolves an asynchronous node.
    ///
    /// A node still executing is resolved as well: its handler may have sent
    /// the request before the pending result was journaled, and that result
    /// is then discarded as stale. Callers route signals only to nodes of
    /// asynchronous action types. Signals for nodes that are already resolved
    /// are acknowledged as duplicates and change nothing.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for nodes outside the rule and `UnknownPort`
    /// for ports the node does not declare; neither changes the run.
    #[instrument(skip_all, fields(run_id = %signal.run_instance_id, node_id = %signal.node_id))]
    pub async fn complete(
        &mut self,
        signal: CompletionSignal,
    ) -> Result<(CompletionAck, Vec<Followup>), OrchestratorError> {
        let run_id = self.state.run_id;
        if signal.run_instance_id != run_id {
            return Err(OrchestratorError::RunNotFound {
                run_id: signal.run_instance_id,
            });
        }
        let node_id = signal.node_id;
        let record = self
            .state
            .record(node_id)
            .ok_or(OrchestratorError::NodeNotFound { node_id })?;

        if record.status.is_resolved() {
            debug!("duplicate completion signal");
            return Ok((CompletionAck::Duplicate, Vec::new()));
        }
        let awaiting = matches!(record.status, NodeStatus::WaitingAsync | NodeStatus::Running);
        if self.state.status.is_terminal() || !awaiting {
            debug!(status = ?record.status, "completion signal discarded");
            return Ok((CompletionAck::Discarded, Vec::new()));
        }
        let attempt = record.attempt;

        let event = match signal.outcome {
            CompletionOutcome::Success { result, port } => {
                let node = self.node(node_id)?;
                let port = node
                    .resolve_port(port.as_deref())
                    .map(|p| p.name.clone())
                    .ok_or_else(|| OrchestratorError::UnknownPort {
                        node_id,
                        port: port.unwrap_or_default(),
                    })?;
                ExecutionEvent::NodeCompleted {
                    run_id,
                    node_id,
                    attempt,
                    result,
                    port,
                    timestamp: Utc::now(),
                }
            }
            CompletionOutcome::Failure { error } => ExecutionEvent::NodeFailed {
                run_id,
                node_id,
                attempt,
                kind: FailureKind::from(ActionErrorKind::TerminalBusiness),
                error,
                timestamp: Utc::now(),
            },
        };
        self.record(event).await?;
        info!("asynchronous node completed");

        let followups = self.advance().await?;
        Ok((CompletionAck::Accepted, followups))
    }

    /// Fails a waiting node whose deadline passed.
    ///
    /// A no-op if the node was resolved or retried in the meantime.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be written.
    #[instrument(skip(self), fields(run_id = %self.state.run_id))]
    pub async fn timeout(
        &mut self,
        node_id: NodeId,
        attempt: u32,
    ) -> Result<Vec<Followup>, OrchestratorError> {
        let waiting = self.state.record(node_id).is_some_and(|r| {
            r.status == NodeStatus::WaitingAsync && r.attempt == attempt
        });
        if self.state.status.is_terminal() || !waiting {
            return Ok(Vec::new());
        }

        warn!("asynchronous node timed out");
        self.record(ExecutionEvent::NodeFailed {
            run_id: self.state.run_id,
            node_id,
            attempt,
            kind: FailureKind::Timeout,
            error: "no completion signal before the deadline".to_string(),
            timestamp: Utc::now(),
        })
        .await?;
        self.advance().await
    }

    /// Cancels the run. Returns false if it had already finished.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be written.
    #[instrument(skip(self), fields(run_id = %self.state.run_id))]
    pub async fn cancel(&mut self, reason: &str) -> Result<bool, OrchestratorError> {
        if self.state.status.is_terminal() {
            return Ok(false);
        }
        self.record(ExecutionEvent::RunCancelled {
            run_id: self.state.run_id,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        })
        .await?;
        info!("run cancelled");
        Ok(true)
    }

    #[must_use]
    pub fn state(&self) -> &RunState {
        &self.state
    }

    #[must_use]
    pub fn run_id(&self) -> RunInstanceId {
        self.state.run_id
    }

    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.state.status
    }

    #[must_use]
    pub fn snapshot(&self) -> RunSnapshot {
        self.state.snapshot()
    }

    #[must_use]
    pub fn rule(&self) -> &Arc<RuleDefinition> {
        &self.rule
    }

    /// Dispatches every ready node, then finalizes the run once no work is
    /// left.
    async fn advance(&mut self) -> Result<Vec<Followup>, OrchestratorError> {
        if self.state.status.is_terminal() {
            return Ok(Vec::new());
        }

        let mut followups = Vec::new();
        for node_id in self.state.ready_nodes() {
            self.record(ExecutionEvent::NodeStarted {
                run_id: self.state.run_id,
                node_id,
                attempt: 1,
                timestamp: Utc::now(),
            })
            .await?;
            followups.push(Followup::Dispatch(self.work_item(node_id, 1)?));
        }

        if self.state.remaining_work().is_complete() {
            self.finalize().await?;
        }
        Ok(followups)
    }

    async fn finalize(&mut self) -> Result<(), OrchestratorError> {
        let run_id = self.state.run_id;
        let timestamp = Utc::now();
        if self.state.has_failures() {
            let error = self.state.failure_summary();
            warn!(%run_id, %error, "run failed");
            self.record(ExecutionEvent::RunFailed {
                run_id,
                error,
                timestamp,
            })
            .await
        } else {
            info!(%run_id, "run succeeded");
            self.record(ExecutionEvent::RunSucceeded { run_id, timestamp })
                .await
        }
    }

    /// Journals an entry, then applies it.
    async fn record(&mut self, event: ExecutionEvent) -> Result<(), OrchestratorError> {
        let message_id = format!("{}:{}", self.state.run_id, self.sequence);
        self.event_store
            .publish(Envelope::new(message_id, event.clone()))
            .await?;
        self.sequence += 1;
        self.state.apply(&event)?;
        Ok(())
    }

    fn node(&self, node_id: NodeId) -> Result<&crate::node::Node, OrchestratorError> {
        self.rule
            .graph
            .get_node(node_id)
            .ok_or(OrchestratorError::NodeNotFound { node_id })
    }

    fn work_item(&self, node_id: NodeId, attempt: u32) -> Result<WorkItem, OrchestratorError> {
        let node = self.node(node_id)?;
        let event = &self.state.trigger_event;
        Ok(WorkItem {
            run_id: self.state.run_id,
            node_id,
            attempt,
            action_type: node.action_type.clone(),
            config: node.config.clone(),
            context: ExecutionContext {
                entity_id: event.entity_id.clone(),
                entity_name: event.entity_name.clone(),
                entity_type: event.entity_type.clone(),
                event_type: event.event_type,
                rule_name: self.rule.name.clone(),
                run_instance_id: self.state.run_id,
                node_id,
                attempt,
                raw_data: event.raw_data.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::graph::RuleGraph;
    use crate::node::Node;
    use crate::trigger::EventKind;
    use serde_json::json;

    fn node(catalog: &Catalog, action_type: &str) -> Node {
        Node::new(
            action_type,
            catalog.action_type(action_type).expect("action type"),
            json!({}),
        )
    }

    fn rule_with(graph: RuleGraph, entry: NodeId) -> Arc<RuleDefinition> {
        let catalog = Catalog::embedded().expect("catalog");
        Arc::new(RuleDefinition::new(
            "Test rule",
            catalog.trigger_type_for(EventKind::Created).expect("on_create").id,
            catalog.entity_type_by_name("orders").expect("orders").id,
            entry,
            graph,
        ))
    }

    /// condition -true-> allocate_inventory
    ///           -false-> create_alert
    fn branching_rule() -> (Arc<RuleDefinition>, [NodeId; 3]) {
        let catalog = Catalog::embedded().expect("catalog");
        let mut graph = RuleGraph::new();
        let condition = graph
            .add_node(node(&catalog, "evaluate_condition"))
            .expect("add");
        let allocate = graph
            .add_node(node(&catalog, "allocate_inventory"))
            .expect("add");
        let alert = graph.add_node(node(&catalog, "create_alert")).expect("add");
        graph.add_edge(condition, "true", allocate).expect("edge");
        graph.add_edge(condition, "false", alert).expect("edge");
        (rule_with(graph, condition), [condition, allocate, alert])
    }

    fn event() -> TriggerEvent {
        TriggerEvent::new("orders", "42", EventKind::Created, json!({ "total": 10 }))
    }

    fn dispatched(followups: &[Followup]) -> Vec<WorkItem> {
        followups
            .iter()
            .filter_map(|f| match f {
                Followup::Dispatch(item) => Some(item.clone()),
                _ => None,
            })
            .collect()
    }

    fn completed(item: &WorkItem, port: Option<&str>) -> WorkItemResult {
        WorkItemResult {
            run_id: item.run_id,
            node_id: item.node_id,
            attempt: item.attempt,
            outcome: NodeOutcome::Completed {
                result: json!({}),
                port: port.map(str::to_string),
            },
        }
    }

    fn pending(item: &WorkItem, timeout: Duration) -> WorkItemResult {
        WorkItemResult {
            run_id: item.run_id,
            node_id: item.node_id,
            attempt: item.attempt,
            outcome: NodeOutcome::Pending {
                ack: json!({ "request_id": item.context.idempotency_key() }),
                timeout: Some(timeout),
            },
        }
    }

    async fn start(
        rule: Arc<RuleDefinition>,
        store: Arc<InMemoryEventStore>,
    ) -> (RunOrchestrator<Arc<InMemoryEventStore>>, Vec<Followup>) {
        RunOrchestrator::start(rule, RunInstanceId::new(), event(), store, RetryPolicy::default())
            .await
            .expect("start")
    }

    /// Drives the run to the allocate_inventory wait.
    async fn to_waiting(
        store: Arc<InMemoryEventStore>,
    ) -> (RunOrchestrator<Arc<InMemoryEventStore>>, [NodeId; 3]) {
        let (rule, ids) = branching_rule();
        let (mut orch, followups) = start(rule, store).await;
        let entry = dispatched(&followups).remove(0);

        let followups = orch
            .handle_result(completed(&entry, Some("true")))
            .await
            .expect("handle");
        let allocate = dispatched(&followups).remove(0);
        assert_eq!(allocate.node_id, ids[1]);

        let followups = orch
            .handle_result(pending(&allocate, Duration::from_secs(3600)))
            .await
            .expect("handle");
        assert!(matches!(followups.as_slice(), [Followup::Timer { attempt: 1, .. }]));
        (orch, ids)
    }

    #[tokio::test]
    async fn start_dispatches_entry_node() {
        let store = Arc::new(InMemoryEventStore::new());
        let (rule, [condition, ..]) = branching_rule();
        let (orch, followups) = start(rule, store.clone()).await;

        let items = dispatched(&followups);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].node_id, condition);
        assert_eq!(items[0].attempt, 1);
        assert_eq!(items[0].context.entity_id, "42");
        assert_eq!(orch.status(), RunStatus::Running);

        let journal = store.load_events(orch.run_id()).await.expect("load");
        assert!(matches!(journal[0], ExecutionEvent::RunStarted { .. }));
        assert!(matches!(journal[1], ExecutionEvent::NodeStarted { attempt: 1, .. }));
    }

    #[tokio::test]
    async fn sync_node_with_default_port_succeeds() {
        let catalog = Catalog::embedded().expect("catalog");
        let mut graph = RuleGraph::new();
        let alert = graph.add_node(node(&catalog, "create_alert")).expect("add");
        let store = Arc::new(InMemoryEventStore::new());
        let (mut orch, followups) = start(rule_with(graph, alert), store).await;

        let item = dispatched(&followups).remove(0);
        let followups = orch
            .handle_result(completed(&item, None))
            .await
            .expect("handle");

        assert!(followups.is_empty());
        assert_eq!(orch.status(), RunStatus::Succeeded);
        let snapshot = orch.snapshot();
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].selected_port.as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn async_node_waits_then_completes_once() {
        let store = Arc::new(InMemoryEventStore::new());
        let (mut orch, [_, allocate, alert]) = to_waiting(store).await;

        assert_eq!(orch.status(), RunStatus::WaitingAsync);
        assert_eq!(
            orch.state().record(alert).map(|r| r.status),
            Some(NodeStatus::Skipped)
        );

        let signal = CompletionSignal {
            run_instance_id: orch.run_id(),
            node_id: allocate,
            outcome: CompletionOutcome::Success {
                result: json!({ "reserved": 2 }),
                port: Some("reserved".to_string()),
            },
        };
        let (ack, followups) = orch.complete(signal.clone()).await.expect("complete");
        assert_eq!(ack, CompletionAck::Accepted);
        assert!(followups.is_empty());
        assert_eq!(orch.status(), RunStatus::Succeeded);

        let (ack, _) = orch.complete(signal).await.expect("complete again");
        assert_eq!(ack, CompletionAck::Duplicate);
    }

    #[tokio::test]
    async fn unknown_completion_port_changes_nothing() {
        let store = Arc::new(InMemoryEventStore::new());
        let (mut orch, [_, allocate, _]) = to_waiting(store).await;

        let err = orch
            .complete(CompletionSignal {
                run_instance_id: orch.run_id(),
                node_id: allocate,
                outcome: CompletionOutcome::Success {
                    result: json!(null),
                    port: Some("shipped".to_string()),
                },
            })
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::UnknownPort { .. }));
        assert_eq!(orch.status(), RunStatus::WaitingAsync);
    }

    #[tokio::test]
    async fn timeout_fails_node_and_run() {
        let store = Arc::new(InMemoryEventStore::new());
        let (mut orch, [_, allocate, _]) = to_waiting(store).await;

        assert!(orch.timeout(allocate, 2).await.expect("stale timer").is_empty());
        assert_eq!(orch.status(), RunStatus::WaitingAsync);

        orch.timeout(allocate, 1).await.expect("timeout");
        assert_eq!(orch.status(), RunStatus::Failed);
        let record = orch.state().record(allocate).expect("record");
        assert_eq!(record.failure_kind, Some(FailureKind::Timeout));

        let (ack, _) = orch
            .complete(CompletionSignal {
                run_instance_id: orch.run_id(),
                node_id: allocate,
                outcome: CompletionOutcome::Failure {
                    error: "late".to_string(),
                },
            })
            .await
            .expect("complete");
        assert_eq!(ack, CompletionAck::Duplicate);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_with_next_attempt() {
        let catalog = Catalog::embedded().expect("catalog");
        let mut graph = RuleGraph::new();
        let log = graph.add_node(node(&catalog, "log_entry")).expect("add");
        let store = Arc::new(InMemoryEventStore::new());
        let (mut orch, followups) = start(rule_with(graph, log), store).await;
        let first = dispatched(&followups).remove(0);

        let followups = orch
            .handle_result(WorkItemResult {
                run_id: first.run_id,
                node_id: log,
                attempt: 1,
                outcome: NodeOutcome::Failed(ActionError::transient("connection reset")),
            })
            .await
            .expect("handle");
        let [Followup::Retry { item: second, delay }] = followups.as_slice() else {
            panic!("expected a retry, got {followups:?}");
        };
        assert_eq!(second.attempt, 2);
        assert_eq!(*delay, Duration::from_millis(500));
        assert_ne!(
            second.context.idempotency_key(),
            first.context.idempotency_key()
        );

        // The first attempt reporting late is ignored.
        assert!(
            orch.handle_result(completed(&first, None))
                .await
                .expect("stale")
                .is_empty()
        );
        assert_eq!(orch.status(), RunStatus::Running);

        orch.handle_result(completed(second, None))
            .await
            .expect("handle");
        assert_eq!(orch.status(), RunStatus::Succeeded);
        assert_eq!(orch.state().record(log).map(|r| r.attempt), Some(2));
    }

    #[tokio::test]
    async fn terminal_failure_is_not_retried() {
        let catalog = Catalog::embedded().expect("catalog");
        let mut graph = RuleGraph::new();
        let log = graph.add_node(node(&catalog, "log_entry")).expect("add");
        let store = Arc::new(InMemoryEventStore::new());
        let (mut orch, followups) = start(rule_with(graph, log), store).await;
        let item = dispatched(&followups).remove(0);

        let followups = orch
            .handle_result(WorkItemResult {
                run_id: item.run_id,
                node_id: log,
                attempt: 1,
                outcome: NodeOutcome::Failed(ActionError::terminal("no stock")),
            })
            .await
            .expect("handle");

        assert!(followups.is_empty());
        assert_eq!(orch.status(), RunStatus::Failed);
        assert!(
            orch.state()
                .error
                .as_deref()
                .is_some_and(|e| e.contains("no stock"))
        );
    }

    #[tokio::test]
    async fn convergence_node_runs_exactly_once() {
        let catalog = Catalog::embedded().expect("catalog");
        let mut graph = RuleGraph::new();
        let entry = graph.add_node(node(&catalog, "log_entry")).expect("add");
        let left = graph.add_node(node(&catalog, "log_entry")).expect("add");
        let right = graph.add_node(node(&catalog, "log_entry")).expect("add");
        let join = graph.add_node(node(&catalog, "create_alert")).expect("add");
        graph.add_edge(entry, "success", left).expect("edge");
        graph.add_edge(entry, "success", right).expect("edge");
        graph.add_edge(left, "success", join).expect("edge");
        graph.add_edge(right, "success", join).expect("edge");

        let store = Arc::new(InMemoryEventStore::new());
        let (mut orch, followups) = start(rule_with(graph, entry), store).await;
        let first = dispatched(&followups).remove(0);
        let branches = dispatched(&orch.handle_result(completed(&first, None)).await.expect("handle"));
        assert_eq!(branches.len(), 2);

        let after_one = orch
            .handle_result(completed(&branches[0], None))
            .await
            .expect("handle");
        assert!(dispatched(&after_one).is_empty());

        let after_both = dispatched(
            &orch
                .handle_result(completed(&branches[1], None))
                .await
                .expect("handle"),
        );
        assert_eq!(after_both.len(), 1);
        assert_eq!(after_both[0].node_id, join);

        orch.handle_result(completed(&after_both[0], None))
            .await
            .expect("handle");
        assert_eq!(orch.status(), RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn failed_branch_blocks_join_while_sibling_drains() {
        let catalog = Catalog::embedded().expect("catalog");
        let mut graph = RuleGraph::new();
        let entry = graph.add_node(node(&catalog, "log_entry")).expect("add");
        let left = graph.add_node(node(&catalog, "log_entry")).expect("add");
        let right = graph.add_node(node(&catalog, "log_entry")).expect("add");
        let join = graph.add_node(node(&catalog, "create_alert")).expect("add");
        graph.add_edge(entry, "success", left).expect("edge");
        graph.add_edge(entry, "success", right).expect("edge");
        graph.add_edge(left, "success", join).expect("edge");
        graph.add_edge(right, "success", join).expect("edge");

        let store = Arc::new(InMemoryEventStore::new());
        let (mut orch, followups) = start(rule_with(graph, entry), store).await;
        let first = dispatched(&followups).remove(0);
        let branches = dispatched(&orch.handle_result(completed(&first, None)).await.expect("handle"));
        assert_eq!(branches.len(), 2);
        let failing = branches.iter().find(|i| i.node_id == left).expect("left");
        let sibling = branches.iter().find(|i| i.node_id == right).expect("right");

        let after_failure = orch
            .handle_result(WorkItemResult {
                run_id: failing.run_id,
                node_id: left,
                attempt: 1,
                outcome: NodeOutcome::Failed(ActionError::terminal("ledger closed")),
            })
            .await
            .expect("handle");
        assert!(after_failure.is_empty());
        assert_eq!(orch.status(), RunStatus::Running);
        assert_eq!(
            orch.state().record(right).map(|r| r.status),
            Some(NodeStatus::Running)
        );

        let after_sibling = orch
            .handle_result(completed(sibling, None))
            .await
            .expect("handle");
        assert!(dispatched(&after_sibling).is_empty());
        assert_eq!(orch.status(), RunStatus::Failed);

        let state = orch.state();
        assert_eq!(state.record(left).map(|r| r.status), Some(NodeStatus::Failed));
        assert_eq!(state.record(right).map(|r| r.status), Some(NodeStatus::Succeeded));
        assert_eq!(state.record(join).map(|r| r.status), Some(NodeStatus::Pending));
        assert!(
            state
                .error
                .as_deref()
                .is_some_and(|e| e.contains("ledger closed"))
        );
    }

    #[tokio::test]
    async fn completion_before_pending_result_is_accepted() {
        let store = Arc::new(InMemoryEventStore::new());
        let (rule, [_, allocate, _]) = branching_rule();
        let (mut orch, followups) = start(rule, store).await;
        let entry = dispatched(&followups).remove(0);
        let followups = orch
            .handle_result(completed(&entry, Some("true")))
            .await
            .expect("handle");
        let request = dispatched(&followups).remove(0);
        assert_eq!(
            orch.state().record(allocate).map(|r| r.status),
            Some(NodeStatus::Running)
        );

        let (ack, _) = orch
            .complete(CompletionSignal {
                run_instance_id: orch.run_id(),
                node_id: allocate,
                outcome: CompletionOutcome::Success {
                    result: json!({ "reserved": 2 }),
                    port: Some("reserved".to_string()),
                },
            })
            .await
            .expect("complete");
        assert_eq!(ack, CompletionAck::Accepted);
        assert_eq!(orch.status(), RunStatus::Succeeded);

        let followups = orch
            .handle_result(pending(&request, Duration::from_secs(3600)))
            .await
            .expect("late pending result");
        assert!(followups.is_empty());
        let record = orch.state().record(allocate).expect("record");
        assert_eq!(record.status, NodeStatus::Succeeded);
        assert_eq!(record.selected_port.as_deref(), Some("reserved"));
    }

    #[tokio::test]
    async fn cancelled_run_discards_results() {
        let store = Arc::new(InMemoryEventStore::new());
        let (rule, _) = branching_rule();
        let (mut orch, followups) = start(rule, store).await;
        let item = dispatched(&followups).remove(0);

        assert!(orch.cancel("operator").await.expect("cancel"));
        assert!(!orch.cancel("again").await.expect("cancel"));

        let followups = orch
            .handle_result(completed(&item, Some("true")))
            .await
            .expect("handle");
        assert!(followups.is_empty());
        assert_eq!(orch.status(), RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn resume_rearms_waiting_timer() {
        let store = Arc::new(InMemoryEventStore::new());
        let (orch, [_, allocate, _]) = to_waiting(store.clone()).await;
        let rule = orch.rule().clone();
        let run_id = orch.run_id();
        drop(orch);

        let (resumed, followups) =
            RunOrchestrator::resume(rule.clone(), run_id, store.clone(), RetryPolicy::default())
                .await
                .expect("resume");
        assert_eq!(resumed.status(), RunStatus::WaitingAsync);
        assert!(matches!(
            followups.as_slice(),
            [Followup::Timer { node_id, attempt: 1, .. }] if *node_id == allocate
        ));

        let missing = RunOrchestrator::resume(
            rule,
            RunInstanceId::new(),
            store,
            RetryPolicy::default(),
        )
        .await;
        assert!(matches!(missing, Err(OrchestratorError::RunNotFound { .. })));
    }

    #[tokio::test]
    async fn resume_redispatches_in_flight_node() {
        let store = Arc::new(InMemoryEventStore::new());
        let (rule, [condition, ..]) = branching_rule();
        let (orch, _) = start(rule.clone(), store.clone()).await;
        let run_id = orch.run_id();
        drop(orch);

        let (_, followups) =
            RunOrchestrator::resume(rule.clone(), run_id, store.clone(), RetryPolicy::default())
                .await
                .expect("resume");
        let items = dispatched(&followups);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].node_id, condition);
        assert_eq!(items[0].attempt, 1);
    }

    #[tokio::test]
    async fn resume_rejects_finished_runs() {
        let store = Arc::new(InMemoryEventStore::new());
        let (rule, _) = branching_rule();
        let (mut orch, _) = start(rule.clone(), store.clone()).await;
        orch.cancel("done").await.expect("cancel");

        let result =
            RunOrchestrator::resume(rule, orch.run_id(), store, RetryPolicy::default()).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::RunAlreadyTerminal { .. })
        ));
    }
}
