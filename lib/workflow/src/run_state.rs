//! Run state reconstruction from the journal.
//!
//! The journal is the source of truth for a run. Live orchestration and
//! crash recovery go through the same [`RunState::apply`], so a replayed run
//! ends up exactly where the live one left off.

use crate::definition::RuleDefinition;
use crate::execution::{
    ActionExecutionRecord, ActiveBranch, ExecutionEvent, NodeStatus, RunInstance, RunSnapshot,
    RunStatus,
};
use crate::remaining_work::RemainingWorkGraph;
use crate::trigger::TriggerEvent;
use autorule_core::{NodeId, RuleId, RunInstanceId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

/// Complete state of a run.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: RunInstanceId,
    pub rule_id: RuleId,
    pub rule_name: String,
    pub trigger_event: TriggerEvent,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    records: HashMap<NodeId, ActionExecutionRecord>,
    /// Graph order, for stable listings.
    node_order: Vec<NodeId>,
    remaining_work: RemainingWorkGraph,
}

impl RunState {
    /// Returns nodes that are ready to execute.
    #[must_use]
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        self.remaining_work.ready_nodes()
    }

    /// Returns true if the run is terminal or has no work left.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status.is_terminal() || self.remaining_work.is_complete()
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.remaining_work.has_failures()
    }

    #[must_use]
    pub fn remaining_work(&self) -> &RemainingWorkGraph {
        &self.remaining_work
    }

    /// Returns the execution record of a node.
    #[must_use]
    pub fn record(&self, node_id: NodeId) -> Option<&ActionExecutionRecord> {
        self.records.get(&node_id)
    }

    /// Returns every record in graph order.
    #[must_use]
    pub fn records(&self) -> Vec<&ActionExecutionRecord> {
        self.node_order
            .iter()
            .filter_map(|id| self.records.get(id))
            .collect()
    }

    /// Returns the nodes currently executing or waiting, in graph order.
    #[must_use]
    pub fn active_branches(&self) -> Vec<ActiveBranch> {
        self.records()
            .into_iter()
            .filter(|r| matches!(r.status, NodeStatus::Running | NodeStatus::WaitingAsync))
            .map(|r| ActiveBranch {
                node_id: r.node_id,
                status: r.status,
            })
            .collect()
    }

    /// Describes the failed nodes, for the run's error message.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        let failures: Vec<String> = self
            .records()
            .into_iter()
            .filter(|r| r.status == NodeStatus::Failed)
            .map(|r| {
                let kind = r
                    .failure_kind
                    .map_or_else(|| "unknown".to_string(), |k| k.to_string());
                format!(
                    "{} ({kind}): {}",
                    r.action_type,
                    r.last_error.as_deref().unwrap_or("no error recorded")
                )
            })
            .collect();
        format!("node failures: {}", failures.join("; "))
    }

    /// Returns the run instance with its records.
    #[must_use]
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run: RunInstance {
                id: self.run_id,
                rule_id: self.rule_id,
                rule_name: self.rule_name.clone(),
                trigger_event: self.trigger_event.clone(),
                status: self.status,
                active_branches: self.active_branches(),
                started_at: self.started_at,
                finished_at: self.finished_at,
                error: self.error.clone(),
            },
            records: self.records().into_iter().cloned().collect(),
        }
    }

    /// Applies one journal entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry belongs to another run, repeats the
    /// `RunStarted` entry, or names a node the rule does not have.
    pub fn apply(&mut self, event: &ExecutionEvent) -> Result<(), RunStateError> {
        if event.run_id() != self.run_id {
            return Err(RunStateError::WrongRun {
                expected: self.run_id,
                found: event.run_id(),
            });
        }
        if let Some(node_id) = event.node_id()
            && !self.records.contains_key(&node_id)
        {
            return Err(RunStateError::UnknownNode { node_id });
        }

        match event {
            ExecutionEvent::RunStarted { .. } => return Err(RunStateError::DuplicateRunStarted),
            ExecutionEvent::NodeStarted {
                node_id,
                attempt,
                timestamp,
                ..
            } => {
                self.remaining_work.mark_executing(*node_id);
                if let Some(record) = self.records.get_mut(node_id) {
                    record.status = NodeStatus::Running;
                    record.attempt = *attempt;
                    record.started_at.get_or_insert(*timestamp);
                }
            }
            ExecutionEvent::NodeRetryScheduled {
                node_id,
                error,
                next_attempt,
                ..
            } => {
                if let Some(record) = self.records.get_mut(node_id) {
                    record.status = NodeStatus::Running;
                    record.attempt = *next_attempt;
                    record.last_error = Some(error.clone());
                }
            }
            ExecutionEvent::NodeWaiting {
                node_id,
                ack,
                deadline,
                ..
            } => {
                self.remaining_work.mark_waiting(*node_id);
                if let Some(record) = self.records.get_mut(node_id) {
                    record.status = NodeStatus::WaitingAsync;
                    record.result = Some(ack.clone());
                    record.deadline = *deadline;
                }
            }
            ExecutionEvent::NodeCompleted {
                node_id,
                result,
                port,
                timestamp,
                ..
            } => {
                let skipped = self.remaining_work.mark_completed(*node_id, port);
                if let Some(record) = self.records.get_mut(node_id) {
                    record.status = NodeStatus::Succeeded;
                    record.result = Some(result.clone());
                    record.selected_port = Some(port.clone());
                    record.completed_at = Some(*timestamp);
                }
                for skipped_id in skipped {
                    if let Some(record) = self.records.get_mut(&skipped_id) {
                        record.status = NodeStatus::Skipped;
                        record.completed_at = Some(*timestamp);
                    }
                }
            }
            ExecutionEvent::NodeFailed {
                node_id,
                kind,
                error,
                timestamp,
                ..
            } => {
                self.remaining_work.mark_failed(*node_id);
                if let Some(record) = self.records.get_mut(node_id) {
                    record.status = NodeStatus::Failed;
                    record.failure_kind = Some(*kind);
                    record.last_error = Some(error.clone());
                    record.completed_at = Some(*timestamp);
                }
            }
            ExecutionEvent::RunSucceeded { timestamp, .. } => {
                self.status = RunStatus::Succeeded;
                self.finished_at = Some(*timestamp);
            }
            ExecutionEvent::RunFailed {
                error, timestamp, ..
            } => {
                self.status = RunStatus::Failed;
                self.error = Some(error.clone());
                self.finished_at = Some(*timestamp);
            }
            ExecutionEvent::RunCancelled {
                reason, timestamp, ..
            } => {
                self.status = RunStatus::Cancelled;
                self.error = Some(format!("cancelled: {reason}"));
                self.finished_at = Some(*timestamp);
            }
        }

        if !self.status.is_terminal() {
            self.status = if self.remaining_work.is_waiting_only() {
                RunStatus::WaitingAsync
            } else {
                RunStatus::Running
            };
        }
        Ok(())
    }
}

/// Reconstructs run state by replaying a journal.
pub struct RunStateBuilder<'a> {
    rule: &'a RuleDefinition,
}

impl<'a> RunStateBuilder<'a> {
    /// Creates a builder for runs of the given rule.
    #[must_use]
    pub fn new(rule: &'a RuleDefinition) -> Self {
        Self { rule }
    }

    /// Reconstructs run state from journal entries, earliest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal is empty, does not begin with
    /// `RunStarted`, belongs to another rule, or cannot be applied.
    pub fn build_from_events(
        &self,
        events: impl IntoIterator<Item = ExecutionEvent>,
    ) -> Result<RunState, RunStateError> {
        let mut events_iter = events.into_iter();
        let first_event = events_iter.next().ok_or(RunStateError::NoEvents)?;

        let ExecutionEvent::RunStarted {
            run_id,
            rule_id,
            rule_name,
            trigger_event,
            timestamp,
        } = first_event
        else {
            return Err(RunStateError::MissingRunStarted);
        };
        if rule_id != self.rule.id {
            return Err(RunStateError::WrongRule {
                expected: self.rule.id,
                found: rule_id,
            });
        }

        let graph = &self.rule.graph;
        let node_order: Vec<NodeId> = graph.nodes().map(|n| n.id).collect();
        let records = graph
            .nodes()
            .map(|n| {
                (
                    n.id,
                    ActionExecutionRecord::new(run_id, n.id, n.action_type.clone()),
                )
            })
            .collect();

        let mut state = RunState {
            run_id,
            rule_id,
            rule_name,
            trigger_event,
            status: RunStatus::Running,
            started_at: timestamp,
            finished_at: None,
            error: None,
            records,
            node_order,
            remaining_work: RemainingWorkGraph::from_rule(graph, self.rule.entry_node_id),
        };

        for event in events_iter {
            state.apply(&event)?;
        }

        Ok(state)
    }
}

/// Errors that can occur during run state reconstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStateError {
    /// The journal is empty.
    NoEvents,
    /// The first entry was not `RunStarted`.
    MissingRunStarted,
    /// A second `RunStarted` entry.
    DuplicateRunStarted,
    /// The journal was written for a different rule.
    WrongRule { expected: RuleId, found: RuleId },
    /// An entry belongs to a different run.
    WrongRun {
        expected: RunInstanceId,
        found: RunInstanceId,
    },
    /// An entry names a node the rule does not have.
    UnknownNode { node_id: NodeId },
}

impl fmt::Display for RunStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEvents => write!(f, "no events provided"),
            Self::MissingRunStarted => write!(f, "first event must be RunStarted"),
            Self::DuplicateRunStarted => write!(f, "duplicate RunStarted event"),
            Self::WrongRule { expected, found } => {
                write!(f, "journal belongs to rule {found}, expected {expected}")
            }
            Self::WrongRun { expected, found } => {
                write!(f, "event belongs to run {found}, expected {expected}")
            }
            Self::UnknownNode { node_id } => write!(f, "unknown node: {node_id}"),
        }
    }
}

impl std::error::Error for RunStateError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::execution::FailureKind;
    use crate::graph::RuleGraph;
    use crate::node::Node;
    use crate::trigger::EventKind;
    use serde_json::json;

    struct Fixture {
        rule: RuleDefinition,
        condition: NodeId,
        approval: NodeId,
        alert: NodeId,
    }

    /// condition -true-> seek_approval
    ///           -false-> create_alert
    fn fixture() -> Fixture {
        let catalog = Catalog::embedded().expect("catalog");
        let node = |action_type: &str| {
            Node::new(
                action_type,
                catalog.action_type(action_type).expect("action type"),
                json!({}),
            )
        };
        let mut graph = RuleGraph::new();
        let condition = graph.add_node(node("evaluate_condition")).expect("add");
        let approval = graph.add_node(node("seek_approval")).expect("add");
        let alert = graph.add_node(node("create_alert")).expect("add");
        graph.add_edge(condition, "true", approval).expect("edge");
        graph.add_edge(condition, "false", alert).expect("edge");

        let rule = RuleDefinition::new(
            "Approval rule",
            catalog.trigger_type_for(EventKind::Created).expect("on_create").id,
            catalog.entity_type_by_name("orders").expect("orders").id,
            condition,
            graph,
        );
        Fixture {
            rule,
            condition,
            approval,
            alert,
        }
    }

    fn started(rule: &RuleDefinition, run_id: RunInstanceId) -> ExecutionEvent {
        ExecutionEvent::RunStarted {
            run_id,
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            trigger_event: TriggerEvent::new("orders", "1", EventKind::Created, json!({})),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn run_started_only() {
        let f = fixture();
        let run_id = RunInstanceId::new();
        let state = RunStateBuilder::new(&f.rule)
            .build_from_events(vec![started(&f.rule, run_id)])
            .expect("build");

        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.ready_nodes(), vec![f.condition]);
        assert_eq!(state.records().len(), 3);
        assert!(state.active_branches().is_empty());
    }

    #[test]
    fn replay_to_waiting_async() {
        let f = fixture();
        let run_id = RunInstanceId::new();
        let now = Utc::now();
        let events = vec![
            started(&f.rule, run_id),
            ExecutionEvent::NodeStarted {
                run_id,
                node_id: f.condition,
                attempt: 1,
                timestamp: now,
            },
            ExecutionEvent::NodeCompleted {
                run_id,
                node_id: f.condition,
                attempt: 1,
                result: json!({ "matched": true }),
                port: "true".to_string(),
                timestamp: now,
            },
            ExecutionEvent::NodeStarted {
                run_id,
                node_id: f.approval,
                attempt: 1,
                timestamp: now,
            },
            ExecutionEvent::NodeWaiting {
                run_id,
                node_id: f.approval,
                attempt: 1,
                ack: json!({ "request_id": "r" }),
                deadline: Some(now),
                timestamp: now,
            },
        ];

        let state = RunStateBuilder::new(&f.rule)
            .build_from_events(events)
            .expect("build");

        assert_eq!(state.status, RunStatus::WaitingAsync);
        assert_eq!(
            state.record(f.alert).map(|r| r.status),
            Some(NodeStatus::Skipped)
        );
        assert_eq!(
            state.active_branches(),
            vec![ActiveBranch {
                node_id: f.approval,
                status: NodeStatus::WaitingAsync
            }]
        );
        let condition = state.record(f.condition).expect("record");
        assert_eq!(condition.selected_port.as_deref(), Some("true"));
    }

    #[test]
    fn retry_keeps_record_and_bumps_attempt() {
        let f = fixture();
        let run_id = RunInstanceId::new();
        let now = Utc::now();
        let mut state = RunStateBuilder::new(&f.rule)
            .build_from_events(vec![started(&f.rule, run_id)])
            .expect("build");

        state
            .apply(&ExecutionEvent::NodeStarted {
                run_id,
                node_id: f.condition,
                attempt: 1,
                timestamp: now,
            })
            .expect("apply");
        state
            .apply(&ExecutionEvent::NodeRetryScheduled {
                run_id,
                node_id: f.condition,
                failed_attempt: 1,
                error: "connection reset".to_string(),
                next_attempt: 2,
                delay_ms: 500,
                timestamp: now,
            })
            .expect("apply");
        state
            .apply(&ExecutionEvent::NodeFailed {
                run_id,
                node_id: f.condition,
                attempt: 2,
                kind: FailureKind::TerminalBusiness,
                error: "refused".to_string(),
                timestamp: now,
            })
            .expect("apply");

        let record = state.record(f.condition).expect("record");
        assert_eq!(record.attempt, 2);
        assert_eq!(record.status, NodeStatus::Failed);
        assert_eq!(record.failure_kind, Some(FailureKind::TerminalBusiness));
        assert!(state.is_complete());
        assert!(state.has_failures());
        assert!(state.failure_summary().contains("evaluate_condition (terminal_business)"));
    }

    #[test]
    fn terminal_status_is_absorbing() {
        let f = fixture();
        let run_id = RunInstanceId::new();
        let mut state = RunStateBuilder::new(&f.rule)
            .build_from_events(vec![
                started(&f.rule, run_id),
                ExecutionEvent::RunCancelled {
                    run_id,
                    reason: "operator".to_string(),
                    timestamp: Utc::now(),
                },
            ])
            .expect("build");
        assert_eq!(state.status, RunStatus::Cancelled);

        state
            .apply(&ExecutionEvent::NodeStarted {
                run_id,
                node_id: f.condition,
                attempt: 1,
                timestamp: Utc::now(),
            })
            .expect("apply");
        assert_eq!(state.status, RunStatus::Cancelled);
        assert_eq!(state.error.as_deref(), Some("cancelled: operator"));
    }

    #[test]
    fn rejects_bad_journals() {
        let f = fixture();
        let builder = RunStateBuilder::new(&f.rule);
        let run_id = RunInstanceId::new();

        assert_eq!(
            builder.build_from_events(Vec::new()).unwrap_err(),
            RunStateError::NoEvents
        );
        assert_eq!(
            builder
                .build_from_events(vec![ExecutionEvent::RunSucceeded {
                    run_id,
                    timestamp: Utc::now()
                }])
                .unwrap_err(),
            RunStateError::MissingRunStarted
        );
        assert_eq!(
            builder
                .build_from_events(vec![started(&f.rule, run_id), started(&f.rule, run_id)])
                .unwrap_err(),
            RunStateError::DuplicateRunStarted
        );

        let stranger = NodeId::new();
        let err = builder
            .build_from_events(vec![
                started(&f.rule, run_id),
                ExecutionEvent::NodeStarted {
                    run_id,
                    node_id: stranger,
                    attempt: 1,
                    timestamp: Utc::now(),
                },
            ])
            .unwrap_err();
        assert_eq!(err, RunStateError::UnknownNode { node_id: stranger });
    }
}
