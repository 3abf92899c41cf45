//! In-process engine.
//!
//! Ties matching, orchestration and execution together. Trigger events start
//! runs; work items execute on tokio tasks gated by a semaphore; retry
//! delays and asynchronous timeouts are tokio sleeps. Each live run's
//! orchestrator sits behind its own mutex, and finished runs are dropped
//! from memory and answered from their journal.

use crate::action::registry::ActionRegistry;
use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::definition::RuleDefinition;
use crate::execution::{ExecutionEvent, NodeStatus, RunSnapshot, RunStatus};
use crate::orchestrator::{
    CompletionAck, CompletionSignal, EventStore, Followup, OrchestratorError, RunOrchestrator,
    WorkItem,
};
use crate::retry::RetryPolicy;
use crate::rule_store::RuleStore;
use crate::run_state::{RunState, RunStateBuilder};
use crate::trigger::{MatchError, RunRequest, TriggerEvent, TriggerMatcher, TriggerPublisher};
use crate::worker::Worker;
use async_trait::async_trait;
use autorule_core::{NodeId, RuleId, RunInstanceId};
use rootcause::prelude::Report;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore, watch};
use tracing::{debug, error, info, instrument, warn};

/// Errors surfaced by the engine.
#[derive(Debug)]
pub enum EngineError {
    /// Active rules could not be looked up for an event.
    Matching(MatchError),
    /// No journal exists for the run.
    RunNotFound { run_id: RunInstanceId },
    /// The run's rule is no longer in the rule store.
    RuleNotFound { run_id: RunInstanceId, rule_id: RuleId },
    /// The node is not part of the run's rule.
    NodeNotFound {
        run_id: RunInstanceId,
        node_id: NodeId,
    },
    /// A completion signal named a port the node does not declare.
    UnknownPort { node_id: NodeId, port: String },
    /// Journal or replay failure.
    Orchestration(OrchestratorError),
}

impl EngineError {
    fn from_orchestrator(run_id: RunInstanceId, error: OrchestratorError) -> Self {
        match error {
            OrchestratorError::RunNotFound { run_id } => Self::RunNotFound { run_id },
            OrchestratorError::NodeNotFound { node_id } => Self::NodeNotFound { run_id, node_id },
            OrchestratorError::UnknownPort { node_id, port } => Self::UnknownPort { node_id, port },
            other => Self::Orchestration(other),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matching(e) => write!(f, "trigger matching failed: {e}"),
            Self::RunNotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::RuleNotFound { run_id, rule_id } => {
                write!(f, "rule {rule_id} of run {run_id} not found")
            }
            Self::NodeNotFound { run_id, node_id } => {
                write!(f, "node {node_id} is not part of run {run_id}")
            }
            Self::UnknownPort { node_id, port } => {
                write!(f, "node {node_id} has no output port '{port}'")
            }
            Self::Orchestration(e) => write!(f, "orchestration failed: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

type Orchestrator = RunOrchestrator<Arc<dyn EventStore>>;

/// A live run.
struct RunSlot {
    orchestrator: Mutex<Orchestrator>,
    status: watch::Sender<RunStatus>,
}

impl RunSlot {
    fn new(orchestrator: Orchestrator) -> Self {
        let (status, _) = watch::channel(orchestrator.status());
        Self {
            orchestrator: Mutex::new(orchestrator),
            status,
        }
    }
}

struct EngineInner {
    catalog: Arc<Catalog>,
    rules: Arc<dyn RuleStore>,
    events: Arc<dyn EventStore>,
    matcher: TriggerMatcher,
    worker: Worker,
    retry: RetryPolicy,
    permits: Semaphore,
    runs: Mutex<HashMap<RunInstanceId, Arc<RunSlot>>>,
    /// Held while a run is loaded from its journal, one gate per run.
    loads: Mutex<HashMap<RunInstanceId, Arc<Mutex<()>>>>,
}

/// The automation engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Creates an engine over the given collaborators.
    #[must_use]
    pub fn new(
        catalog: Arc<Catalog>,
        registry: Arc<ActionRegistry>,
        rules: Arc<dyn RuleStore>,
        events: Arc<dyn EventStore>,
        config: EngineConfig,
    ) -> Self {
        let retry = RetryPolicy::new(&config.retry);
        let permits = Semaphore::new(config.worker_concurrency.max(1));
        let matcher = TriggerMatcher::new(catalog.clone(), rules.clone());
        let worker = Worker::new(catalog.clone(), registry, Arc::new(config));
        Self {
            inner: Arc::new(EngineInner {
                catalog,
                rules,
                events,
                matcher,
                worker,
                retry,
                permits,
                runs: Mutex::new(HashMap::new()),
                loads: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.inner.catalog
    }

    #[must_use]
    pub fn rules(&self) -> &Arc<dyn RuleStore> {
        &self.inner.rules
    }

    /// Starts one run per active rule the event fires.
    ///
    /// Runs are independent: a run whose first journal entry cannot be
    /// written is logged and left out, and the others still start.
    ///
    /// # Errors
    ///
    /// Returns an error if rules cannot be looked up.
    #[instrument(skip_all, fields(entity_type = %event.entity_type, entity_id = %event.entity_id, event_type = %event.event_type))]
    pub async fn trigger(
        &self,
        event: TriggerEvent,
    ) -> Result<Vec<RunInstanceId>, Report<EngineError>> {
        let requests = self
            .inner
            .matcher
            .on_domain_event(&event)
            .await
            .map_err(EngineError::Matching)?;

        let mut started = Vec::with_capacity(requests.len());
        for request in requests {
            let rule_id = request.rule.id;
            match self.start_run(request).await {
                Ok(run_id) => started.push(run_id),
                Err(report) => error!(%rule_id, error = %report, "failed to start run"),
            }
        }
        Ok(started)
    }

    /// Delivers a completion signal for an asynchronous node.
    ///
    /// Runs that are not in memory are loaded from their journal first.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown runs, nodes and ports, or if the journal
    /// cannot be written.
    #[instrument(skip_all, fields(run_id = %signal.run_instance_id, node_id = %signal.node_id))]
    pub async fn complete(
        &self,
        signal: CompletionSignal,
    ) -> Result<CompletionAck, Report<EngineError>> {
        let run_id = signal.run_instance_id;
        let Some(slot) = self.slot(run_id).await? else {
            return self.complete_finished(signal).await;
        };

        let mut orchestrator = slot.orchestrator.lock().await;
        let executing_sync = orchestrator.state().record(signal.node_id).is_some_and(|r| {
            r.status == NodeStatus::Running
                && !self
                    .inner
                    .catalog
                    .action_type(&r.action_type)
                    .is_some_and(|info| info.is_async)
        });
        if executing_sync {
            debug!("completion signal for synchronous node discarded");
            return Ok(CompletionAck::Discarded);
        }

        let (ack, followups) = match orchestrator.complete(signal).await {
            Ok(applied) => applied,
            Err(e) => {
                if e.is_journal_failure() {
                    self.evict(run_id, &slot).await;
                }
                return Err(EngineError::from_orchestrator(run_id, e).into());
            }
        };
        let status = orchestrator.status();
        self.after_transition(run_id, &slot, status, followups).await;
        Ok(ack)
    }

    /// Cancels a run. Returns false if the run had already finished.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown runs or if the journal cannot be written.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        run_id: RunInstanceId,
        reason: &str,
    ) -> Result<bool, Report<EngineError>> {
        let Some(slot) = self.slot(run_id).await? else {
            return Ok(false);
        };

        let mut orchestrator = slot.orchestrator.lock().await;
        let cancelled = match orchestrator.cancel(reason).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                if e.is_journal_failure() {
                    self.evict(run_id, &slot).await;
                }
                return Err(EngineError::from_orchestrator(run_id, e).into());
            }
        };
        let status = orchestrator.status();
        self.after_transition(run_id, &slot, status, Vec::new()).await;
        Ok(cancelled)
    }

    /// Returns the run and its execution records.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if no journal exists for the run.
    pub async fn snapshot(&self, run_id: RunInstanceId) -> Result<RunSnapshot, Report<EngineError>> {
        if let Some(slot) = self.live_slot(run_id).await {
            return Ok(slot.orchestrator.lock().await.snapshot());
        }
        let state = self.replay(run_id).await?;
        Ok(state.snapshot())
    }

    /// Loads an unfinished run from its journal and continues it.
    ///
    /// In-flight nodes are dispatched again and waiting nodes get their
    /// timers back. Returns the run's status.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal or the run's rule cannot be loaded.
    #[instrument(skip(self))]
    pub async fn resume(&self, run_id: RunInstanceId) -> Result<RunStatus, Report<EngineError>> {
        match self.slot(run_id).await? {
            Some(slot) => Ok(*slot.status.borrow()),
            None => Ok(self.replay(run_id).await?.status),
        }
    }

    /// Watches a run's status.
    ///
    /// For finished runs the receiver holds the final status and its sender
    /// is already gone.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if no journal exists for the run.
    pub async fn subscribe(
        &self,
        run_id: RunInstanceId,
    ) -> Result<watch::Receiver<RunStatus>, Report<EngineError>> {
        if let Some(slot) = self.live_slot(run_id).await {
            return Ok(slot.status.subscribe());
        }
        let state = self.replay(run_id).await?;
        let (_, receiver) = watch::channel(state.status);
        Ok(receiver)
    }

    async fn start_run(&self, request: RunRequest) -> Result<RunInstanceId, Report<EngineError>> {
        let RunRequest { run_id, rule, event } = request;
        let (orchestrator, followups) = RunOrchestrator::start(
            rule,
            run_id,
            event,
            self.inner.events.clone(),
            self.inner.retry.clone(),
        )
        .await
        .map_err(|e| EngineError::from_orchestrator(run_id, e))?;

        let status = orchestrator.status();
        let slot = Arc::new(RunSlot::new(orchestrator));
        self.inner.runs.lock().await.insert(run_id, slot.clone());
        self.after_transition(run_id, &slot, status, followups).await;
        Ok(run_id)
    }

    async fn live_slot(&self, run_id: RunInstanceId) -> Option<Arc<RunSlot>> {
        self.inner.runs.lock().await.get(&run_id).cloned()
    }

    /// Returns the live run, loading it from the journal if needed. `None`
    /// means the run has finished.
    ///
    /// The run map is not held while the journal is replayed; concurrent
    /// loads of the same run wait on that run's gate instead.
    async fn slot(&self, run_id: RunInstanceId) -> Result<Option<Arc<RunSlot>>, Report<EngineError>> {
        if let Some(slot) = self.live_slot(run_id).await {
            return Ok(Some(slot));
        }

        let gate = self
            .inner
            .loads
            .lock()
            .await
            .entry(run_id)
            .or_default()
            .clone();
        let loaded = {
            let _loading = gate.lock().await;
            match self.live_slot(run_id).await {
                Some(slot) => Ok(Some(slot)),
                None => self.load_slot(run_id).await,
            }
        };

        let mut loads = self.inner.loads.lock().await;
        if loads
            .get(&run_id)
            .is_some_and(|current| Arc::ptr_eq(current, &gate) && Arc::strong_count(&gate) <= 2)
        {
            loads.remove(&run_id);
        }
        loaded
    }

    async fn load_slot(
        &self,
        run_id: RunInstanceId,
    ) -> Result<Option<Arc<RunSlot>>, Report<EngineError>> {
        let events = self.load_events(run_id).await?;
        let rule = self.rule_for(run_id, &events).await?;
        match RunOrchestrator::resume(
            rule,
            run_id,
            self.inner.events.clone(),
            self.inner.retry.clone(),
        )
        .await
        {
            Ok((orchestrator, followups)) => {
                info!(%run_id, "run loaded from journal");
                let status = orchestrator.status();
                let slot = Arc::new(RunSlot::new(orchestrator));
                self.inner.runs.lock().await.insert(run_id, slot.clone());
                self.after_transition(run_id, &slot, status, followups).await;
                Ok(Some(slot))
            }
            Err(OrchestratorError::RunAlreadyTerminal { .. }) => Ok(None),
            Err(e) => Err(EngineError::from_orchestrator(run_id, e).into()),
        }
    }

    async fn is_current(&self, run_id: RunInstanceId, slot: &Arc<RunSlot>) -> bool {
        self.inner
            .runs
            .lock()
            .await
            .get(&run_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Drops a run whose memory may be ahead of its journal and loads it
    /// again, so nodes left in flight are dispatched anew.
    ///
    /// Called with the run's orchestrator locked; tasks still holding the
    /// old slot see it is no longer current and drop their results.
    async fn evict(&self, run_id: RunInstanceId, slot: &Arc<RunSlot>) {
        {
            let mut runs = self.inner.runs.lock().await;
            if runs
                .get(&run_id)
                .is_some_and(|current| Arc::ptr_eq(current, slot))
            {
                runs.remove(&run_id);
            }
        }
        warn!(%run_id, "run dropped from memory after a journal failure");

        let engine = self.clone();
        tokio::spawn(async move {
            match engine.resume(run_id).await {
                Ok(status) => info!(%run_id, %status, "run reloaded"),
                Err(report) => error!(%run_id, error = %report, "failed to reload run"),
            }
        });
    }

    async fn load_events(
        &self,
        run_id: RunInstanceId,
    ) -> Result<Vec<ExecutionEvent>, Report<EngineError>> {
        let events = self
            .inner
            .events
            .load_events(run_id)
            .await
            .map_err(|e| EngineError::Orchestration(OrchestratorError::EventStore(e)))?;
        if events.is_empty() {
            return Err(EngineError::RunNotFound { run_id }.into());
        }
        Ok(events)
    }

    async fn rule_for(
        &self,
        run_id: RunInstanceId,
        events: &[ExecutionEvent],
    ) -> Result<Arc<RuleDefinition>, Report<EngineError>> {
        let rule_id = events
            .iter()
            .find_map(|event| match event {
                ExecutionEvent::RunStarted { rule_id, .. } => Some(*rule_id),
                _ => None,
            })
            .ok_or_else(|| {
                EngineError::Orchestration(OrchestratorError::RunState(
                    crate::run_state::RunStateError::MissingRunStarted,
                ))
            })?;

        self.inner
            .rules
            .get(rule_id)
            .await
            .map_err(|e| EngineError::Matching(MatchError::RuleStore(e)))?
            .ok_or_else(|| EngineError::RuleNotFound { run_id, rule_id }.into())
    }

    /// Rebuilds a run's state from its journal without taking it live.
    async fn replay(&self, run_id: RunInstanceId) -> Result<RunState, Report<EngineError>> {
        let events = self.load_events(run_id).await?;
        let rule = self.rule_for(run_id, &events).await?;
        RunStateBuilder::new(&rule)
            .build_from_events(events)
            .map_err(|e| EngineError::Orchestration(OrchestratorError::RunState(e)).into())
    }

    /// Answers a completion signal for a run that has already finished.
    async fn complete_finished(
        &self,
        signal: CompletionSignal,
    ) -> Result<CompletionAck, Report<EngineError>> {
        let run_id = signal.run_instance_id;
        let state = self.replay(run_id).await?;
        let record = state
            .record(signal.node_id)
            .ok_or(EngineError::NodeNotFound {
                run_id,
                node_id: signal.node_id,
            })?;
        if record.status.is_resolved() {
            debug!("duplicate completion signal for finished run");
            Ok(CompletionAck::Duplicate)
        } else {
            debug!("completion signal for finished run discarded");
            Ok(CompletionAck::Discarded)
        }
    }

    /// Publishes the run's status, schedules its followups and drops it from
    /// memory once it has finished.
    async fn after_transition(
        &self,
        run_id: RunInstanceId,
        slot: &RunSlot,
        status: RunStatus,
        followups: Vec<Followup>,
    ) {
        slot.status.send_replace(status);
        self.schedule(followups);
        if status.is_terminal() {
            self.inner.runs.lock().await.remove(&run_id);
            debug!(%run_id, %status, "run finished");
        }
    }

    fn schedule(&self, followups: Vec<Followup>) {
        for followup in followups {
            let engine = self.clone();
            match followup {
                Followup::Dispatch(item) => {
                    tokio::spawn(engine.execute(item));
                }
                Followup::Retry { item, delay } => {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        engine.execute(item).await;
                    });
                }
                Followup::Timer {
                    run_id,
                    node_id,
                    attempt,
                    after,
                } => {
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        engine.fire_timeout(run_id, node_id, attempt).await;
                    });
                }
            }
        }
    }

    async fn execute(self, item: WorkItem) {
        let run_id = item.run_id;
        let Some(slot) = self.live_slot(run_id).await else {
            debug!(%run_id, node_id = %item.node_id, "work item for finished run dropped");
            return;
        };

        let result = {
            let Ok(_permit) = self.inner.permits.acquire().await else {
                return;
            };
            if slot.status.borrow().is_terminal() {
                debug!(%run_id, node_id = %item.node_id, "work item for finished run dropped");
                return;
            }
            self.inner.worker.execute(item).await
        };

        let mut orchestrator = slot.orchestrator.lock().await;
        if !self.is_current(run_id, &slot).await {
            debug!(%run_id, "result for reloaded run dropped");
            return;
        }
        match orchestrator.handle_result(result).await {
            Ok(followups) => {
                let status = orchestrator.status();
                self.after_transition(run_id, &slot, status, followups).await;
            }
            Err(e) => {
                error!(%run_id, error = %e, "failed to apply node result");
                self.evict(run_id, &slot).await;
            }
        }
    }

    async fn fire_timeout(self, run_id: RunInstanceId, node_id: NodeId, attempt: u32) {
        let Some(slot) = self.live_slot(run_id).await else {
            return;
        };

        let mut orchestrator = slot.orchestrator.lock().await;
        if !self.is_current(run_id, &slot).await {
            return;
        }
        match orchestrator.timeout(node_id, attempt).await {
            Ok(followups) => {
                let status = orchestrator.status();
                self.after_transition(run_id, &slot, status, followups).await;
            }
            Err(e) => {
                error!(%run_id, %node_id, error = %e, "failed to apply timeout");
                self.evict(run_id, &slot).await;
            }
        }
    }
}

#[async_trait]
impl TriggerPublisher for Engine {
    async fn publish(&self, event: TriggerEvent) {
        match self.trigger(event).await {
            Ok(runs) if !runs.is_empty() => info!(runs = runs.len(), "runs started"),
            Ok(_) => {}
            Err(report) => error!(error = %report, "automation trigger failed"),
        }
    }
}
