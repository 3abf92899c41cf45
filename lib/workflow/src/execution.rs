//! Run and node execution records.
//!
//! Execution is event sourced: every state transition of a run is appended
//! to the run journal as an [`ExecutionEvent`], and the records in this
//! module are what replaying the journal produces.

use crate::action::ActionErrorKind;
use crate::trigger::TriggerEvent;
use autorule_core::{NodeId, RuleId, RunInstanceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// The overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// At least one node is executing or ready.
    Running,
    /// Only asynchronous nodes waiting for a completion signal remain.
    WaitingAsync,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::WaitingAsync => "waiting_async",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// The state of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting for upstream nodes.
    Pending,
    /// Every inbound edge is resolved and at least one was taken.
    Ready,
    /// Dispatched to a handler, possibly between retries.
    Running,
    /// Started asynchronous work; waiting for a completion signal.
    WaitingAsync,
    Succeeded,
    Failed,
    /// Every inbound edge left a port that was not selected.
    Skipped,
}

impl NodeStatus {
    /// Returns true once the node will not change again.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Why a node failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Transient,
    TerminalBusiness,
    /// An asynchronous node received no completion signal in time.
    Timeout,
}

impl From<ActionErrorKind> for FailureKind {
    fn from(kind: ActionErrorKind) -> Self {
        match kind {
            ActionErrorKind::Validation => Self::Validation,
            ActionErrorKind::Transient => Self::Transient,
            ActionErrorKind::TerminalBusiness => Self::TerminalBusiness,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::Transient => "transient",
            Self::TerminalBusiness => "terminal_business",
            Self::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// One node's execution within a run.
///
/// Retries reuse the record and bump `attempt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionExecutionRecord {
    pub run_instance_id: RunInstanceId,
    pub node_id: NodeId,
    pub action_type: String,
    pub status: NodeStatus,
    /// Current attempt, starting at 1. Zero for nodes never dispatched.
    pub attempt: u32,
    pub result: Option<JsonValue>,
    pub selected_port: Option<String>,
    pub last_error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// When an asynchronous node times out.
    pub deadline: Option<DateTime<Utc>>,
}

impl ActionExecutionRecord {
    /// Creates a record for a node that has not run yet.
    #[must_use]
    pub fn new(
        run_instance_id: RunInstanceId,
        node_id: NodeId,
        action_type: impl Into<String>,
    ) -> Self {
        Self {
            run_instance_id,
            node_id,
            action_type: action_type.into(),
            status: NodeStatus::Pending,
            attempt: 0,
            result: None,
            selected_port: None,
            last_error: None,
            failure_kind: None,
            started_at: None,
            completed_at: None,
            deadline: None,
        }
    }

    /// Key handed to handlers and the outbound transport.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.run_instance_id, self.node_id, self.attempt)
    }
}

/// A branch of a run that has not finished yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveBranch {
    pub node_id: NodeId,
    pub status: NodeStatus,
}

/// A run of a rule for one trigger event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInstance {
    pub id: RunInstanceId,
    pub rule_id: RuleId,
    pub rule_name: String,
    pub trigger_event: TriggerEvent,
    pub status: RunStatus,
    /// Nodes currently executing or waiting, one per live branch.
    pub active_branches: Vec<ActiveBranch>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A run together with its node records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: RunInstance,
    /// Records in graph order.
    pub records: Vec<ActionExecutionRecord>,
}

/// Journal entries for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// First entry of every journal.
    RunStarted {
        run_id: RunInstanceId,
        rule_id: RuleId,
        rule_name: String,
        trigger_event: TriggerEvent,
        timestamp: DateTime<Utc>,
    },
    /// Node dispatched for its first attempt.
    NodeStarted {
        run_id: RunInstanceId,
        node_id: NodeId,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// A transient failure will be retried.
    NodeRetryScheduled {
        run_id: RunInstanceId,
        node_id: NodeId,
        failed_attempt: u32,
        error: String,
        next_attempt: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// An asynchronous handler accepted the work.
    NodeWaiting {
        run_id: RunInstanceId,
        node_id: NodeId,
        attempt: u32,
        ack: JsonValue,
        deadline: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        run_id: RunInstanceId,
        node_id: NodeId,
        attempt: u32,
        result: JsonValue,
        port: String,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        run_id: RunInstanceId,
        node_id: NodeId,
        attempt: u32,
        kind: FailureKind,
        error: String,
        timestamp: DateTime<Utc>,
    },
    RunSucceeded {
        run_id: RunInstanceId,
        timestamp: DateTime<Utc>,
    },
    RunFailed {
        run_id: RunInstanceId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    RunCancelled {
        run_id: RunInstanceId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    /// Returns the run ID associated with this event.
    #[must_use]
    pub fn run_id(&self) -> RunInstanceId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeRetryScheduled { run_id, .. }
            | Self::NodeWaiting { run_id, .. }
            | Self::NodeCompleted { run_id, .. }
            | Self::NodeFailed { run_id, .. }
            | Self::RunSucceeded { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::RunCancelled { run_id, .. } => *run_id,
        }
    }

    /// Returns the timestamp of this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RunStarted { timestamp, .. }
            | Self::NodeStarted { timestamp, .. }
            | Self::NodeRetryScheduled { timestamp, .. }
            | Self::NodeWaiting { timestamp, .. }
            | Self::NodeCompleted { timestamp, .. }
            | Self::NodeFailed { timestamp, .. }
            | Self::RunSucceeded { timestamp, .. }
            | Self::RunFailed { timestamp, .. }
            | Self::RunCancelled { timestamp, .. } => *timestamp,
        }
    }

    /// Returns the node the event is about, if any.
    #[must_use]
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            Self::NodeStarted { node_id, .. }
            | Self::NodeRetryScheduled { node_id, .. }
            | Self::NodeWaiting { node_id, .. }
            | Self::NodeCompleted { node_id, .. }
            | Self::NodeFailed { node_id, .. } => Some(*node_id),
            _ => None,
        }
    }
}
