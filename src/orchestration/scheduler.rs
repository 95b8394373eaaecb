//! Orchestrator for lane-based parallel execution.
//!
//! The orchestrator owns every piece of mutable run state: the task graph's
//! node statuses, the lane registry, the stall detector and the circuit
//! breaker. It repeatedly computes the ready set, dispatches up to
//! `max_concurrent_lanes` lane pipelines concurrently, waits for the whole
//! batch, then merges verified lanes one at a time in queue order.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{Config, ToolMode};
use crate::core::{GraphId, NodeId, NodeStatus, TaskGraph, TaskNode};
use crate::guard::{
    BudgetSnapshot, BudgetTracker, CircuitBreaker, PermissionGate, Role, StallDetector, StepKind,
    TtlCache,
};
use crate::lane::{Actor, Lane, LaneId, LaneRegistry, LaneStatus};
use crate::orchestration::consensus::{collect_votes, requires_consensus};
use crate::orchestration::events::{EventSink, OrchestratorEvent};
use crate::orchestration::merge::{MergeArbiter, MergeOutcome};
use crate::orchestration::model::{ModelClient, ModelGateway};
use crate::orchestration::planner;
use crate::orchestration::tools::{Caller, ToolExecutor, ToolName, ToolRecord, ToolRunner};
use crate::orchestration::verifier::{self, needs_quality_gate, QualityReport};
use crate::orchestration::worker::{self, WorkerArtifact, WorkerRole};
use crate::{llog, llog_error, llog_warn, Error, Result};

/// Unique identifier for one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structured outcome of a run, returned even on partial failure.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: RunId,
    pub graph_id: GraphId,
    pub goal: String,
    /// Every node completed.
    pub success: bool,
    /// The planner's graph was unusable and the single-node graph ran instead.
    pub fallback_graph: bool,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub nodes: Vec<TaskNode>,
    /// Every lane of the run, terminal ones included, in creation order.
    pub lanes: Vec<Lane>,
    pub tokens: BudgetSnapshot,
    pub cost_usd: f64,
    pub duration_ms: u64,
    /// Why dispatch stopped early, if it did.
    pub halt_reason: Option<String>,
    pub review: Option<QualityReport>,
    pub summary: String,
}

impl RunResult {
    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.id.as_str() == id)
    }

    pub fn lanes_for(&self, node_id: &str) -> Vec<&Lane> {
        self.lanes
            .iter()
            .filter(|l| l.node_id.as_str() == node_id)
            .collect()
    }
}

/// A lane pipeline's return: the lane, the working copy of its node (with
/// any rework notes appended) and the run-ending error that stopped it.
#[derive(Debug)]
pub struct LaneRun {
    pub lane: Lane,
    pub node: TaskNode,
    pub fatal: Option<Error>,
}

/// Mutable state of the dispatch loop.
struct RunState {
    registry: LaneRegistry,
    breaker: CircuitBreaker,
    /// Working copies of nodes carrying rework notes between iterations.
    working: HashMap<NodeId, TaskNode>,
    budget_warned: bool,
    halt_reason: Option<String>,
}

/// Drives one orchestration run.
///
/// Budget, permissions, cache and stall detection are owned by the
/// orchestrator rather than held globally; build a new one per goal.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use lanes::config::Config;
/// use lanes::orchestration::{CommandModel, DryRunExecutor, Orchestrator};
///
/// let model = Arc::new(CommandModel::new("claude", &std::env::current_dir()?)?);
/// let orchestrator = Orchestrator::new(Config::default(), model, Arc::new(DryRunExecutor::new()));
/// let result = orchestrator.run("Add a users table then expose it over the API").await?;
/// println!("{}", result.summary);
/// ```
pub struct Orchestrator {
    config: Config,
    run_id: RunId,
    gateway: ModelGateway,
    tools: ToolRunner,
    budget: Arc<BudgetTracker>,
    permissions: Arc<PermissionGate>,
    stall: Mutex<StallDetector>,
    events: EventSink,
}

impl Orchestrator {
    /// Create an orchestrator for a single run.
    ///
    /// # Arguments
    ///
    /// * `config` - Run configuration
    /// * `model` - Text-completion backend every role calls through
    /// * `executor` - Tool backend reached through the permission gate
    pub fn new(
        config: Config,
        model: Arc<dyn ModelClient>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        let timeout = Duration::from_secs(config.orchestrator.worker_timeout_secs.max(1));
        let budget = Arc::new(BudgetTracker::new(
            config.budget.clone(),
            config.models.rates.clone(),
        ));
        let permissions = Arc::new(PermissionGate::new());
        let gateway = ModelGateway::new(
            model,
            Arc::clone(&budget),
            config.retry.clone(),
            timeout,
            CancellationToken::new(),
        );
        let tools = ToolRunner::new(
            executor,
            Arc::clone(&permissions),
            Arc::new(TtlCache::new(&config.cache)),
            config.retry.clone(),
            timeout,
        );
        let stall = Mutex::new(StallDetector::new(config.stall.clone()));

        Self {
            config,
            run_id: RunId::new(),
            gateway,
            tools,
            budget,
            permissions,
            stall,
            events: EventSink::silent(),
        }
    }

    /// Send events to `events` instead of only logging them.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn budget(&self) -> &BudgetTracker {
        &self.budget
    }

    pub fn permissions(&self) -> &PermissionGate {
        &self.permissions
    }

    /// Cancel the run; lanes stop at their next model call.
    pub fn cancel(&self) {
        self.gateway.cancel_token().cancel();
    }

    fn stall(&self) -> MutexGuard<'_, StallDetector> {
        self.stall.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_step(&self, kind: StepKind, progress: bool, signature: Option<String>) {
        self.stall().record_step(kind, progress, signature);
    }

    fn begin(&self) -> Instant {
        *self.stall() = StallDetector::new(self.config.stall.clone());
        Instant::now()
    }

    /// Decompose `goal` and run the resulting graph.
    ///
    /// # Errors
    /// Only budget exhaustion (or an external cancel) escapes; every other
    /// failure is reported inside the [`RunResult`].
    pub async fn run(&self, goal: &str) -> Result<RunResult> {
        let started = self.begin();
        llog!("run {} started: {}", self.run_id.short(), goal);
        self.events.emit(OrchestratorEvent::RunStarted {
            run_id: self.run_id,
            goal: goal.to_string(),
        });

        let decomposition = match planner::decompose(
            &self.gateway,
            &self.config.models.planner,
            &self.config.orchestrator,
            goal,
        )
        .await
        {
            Ok(decomposition) => decomposition,
            Err(e) => return Err(self.abort(e)),
        };
        self.execute(decomposition.graph, decomposition.fallback, started)
            .await
    }

    /// Run a pre-built graph, skipping decomposition.
    pub async fn run_graph(&self, graph: TaskGraph) -> Result<RunResult> {
        let started = self.begin();
        llog!("run {} started with {} nodes", self.run_id.short(), graph.len());
        self.events.emit(OrchestratorEvent::RunStarted {
            run_id: self.run_id,
            goal: graph.goal().to_string(),
        });
        self.execute(graph, false, started).await
    }

    fn abort(&self, err: Error) -> Error {
        llog_error!("run {} aborted: {}", self.run_id.short(), err);
        self.events.emit(OrchestratorEvent::RunError {
            message: err.to_string(),
        });
        err
    }

    async fn execute(
        &self,
        mut graph: TaskGraph,
        fallback: bool,
        started: Instant,
    ) -> Result<RunResult> {
        self.events.emit(OrchestratorEvent::GraphCreated {
            graph_id: graph.id(),
            nodes: graph.len(),
            fallback,
        });

        let mut state = RunState {
            registry: LaneRegistry::new(),
            breaker: CircuitBreaker::new(&self.config.circuit_breaker),
            working: HashMap::new(),
            budget_warned: false,
            halt_reason: None,
        };

        if let Err(e) = self.dispatch_loop(&mut graph, &mut state).await {
            return Err(self.abort(e));
        }
        self.close_out(&mut graph, &mut state);

        let review = if self.config.quality_gate.run_review && state.halt_reason.is_none() {
            match verifier::review_run(&self.gateway, &self.config.models.judge, &graph).await {
                Ok(report) => Some(report),
                Err(e) => return Err(self.abort(e)),
            }
        } else {
            None
        };

        let result = self.build_result(graph, state, fallback, review, started);
        llog!("run {} finished: {}", self.run_id.short(), result.summary);
        self.events.emit(OrchestratorEvent::RunComplete {
            success: result.success,
            completed: result.completed,
            failed: result.failed,
            blocked: result.blocked,
        });
        Ok(result)
    }

    /// Why dispatch must stop, if it must.
    fn halt_check(&self, state: &RunState) -> Option<String> {
        if state.breaker.is_open() {
            return Some(format!(
                "circuit breaker open after {} consecutive lane failures",
                state.breaker.consecutive_failures()
            ));
        }
        let stalled = self.stall().halt_reason();
        stalled.map(|reason| {
            self.events
                .emit(OrchestratorEvent::StallWarning { reason: reason.clone() });
            format!("stalled: {}", reason)
        })
    }

    async fn dispatch_loop(&self, graph: &mut TaskGraph, state: &mut RunState) -> Result<()> {
        let limit = self.config.orchestrator.max_concurrent_lanes.max(1);
        let max_failures = self.config.orchestrator.max_rework_attempts + 1;

        loop {
            if let Some(reason) = self.halt_check(state) {
                llog_warn!("run {} halting: {}", self.run_id.short(), reason);
                self.block_pending(graph, &reason);
                self.events.emit(OrchestratorEvent::RunError {
                    message: reason.clone(),
                });
                state.halt_reason = Some(reason);
                return Ok(());
            }

            let resolved: HashSet<NodeId> = graph
                .nodes()
                .filter(|n| n.is_resolved())
                .map(|n| n.id.clone())
                .collect();
            let resumable: Vec<LaneId> = state
                .registry
                .lanes()
                .iter()
                .filter(|l| matches!(l.status, LaneStatus::Queued | LaneStatus::PendingRework))
                .map(|l| l.lane_id.clone())
                .collect();
            let ready = graph.ready_nodes(&resolved);

            if resumable.is_empty() && ready.is_empty() {
                if graph.all_resolved() {
                    return Ok(());
                }
                let reason = "deadlock: remaining dependencies can never resolve".to_string();
                llog_warn!("run {}: {}", self.run_id.short(), reason);
                self.block_pending(graph, &reason);
                state.halt_reason = Some(reason);
                return Ok(());
            }

            let mut batch: Vec<(Lane, TaskNode)> = Vec::with_capacity(limit);
            for lane_id in resumable.into_iter().take(limit) {
                let lane = state
                    .registry
                    .get(&lane_id)
                    .cloned()
                    .ok_or_else(|| Error::Validation(format!("lane {} not found", lane_id)))?;
                let node = self.working_node(graph, state, &lane.node_id)?;
                batch.push((lane, node));
            }
            for node_id in ready.into_iter().take(limit - batch.len()) {
                graph.set_status(&node_id, NodeStatus::Dispatched)?;
                let lane_id = state.registry.create(&node_id, max_failures);
                let lane = state
                    .registry
                    .get(&lane_id)
                    .cloned()
                    .ok_or_else(|| Error::Validation(format!("lane {} not found", lane_id)))?;
                let node = self.working_node(graph, state, &node_id)?;
                batch.push((lane, node));
            }

            llog!("dispatching {} lanes", batch.len());
            let runs = join_all(
                batch
                    .into_iter()
                    .map(|(lane, node)| self.run_lane(lane, node)),
            )
            .await;

            let mut fatal: Option<Error> = None;
            for run in runs {
                if let Some(e) = run.fatal {
                    // Siblings of an exhausted lane see only the cancellation.
                    if fatal.is_none() || e.is_budget_exhausted() {
                        fatal = Some(e);
                    }
                }
                let mut lane = run.lane;
                match lane.status {
                    LaneStatus::Verified => {
                        lane.verified_seq = Some(state.registry.next_verify_seq());
                        state.breaker.record_success();
                    }
                    LaneStatus::Failed => {
                        let reason = last_reason(&lane);
                        graph.set_status(&lane.node_id, NodeStatus::Failed { reason })?;
                        state.breaker.record_failure();
                    }
                    _ => {}
                }
                state.working.insert(run.node.id.clone(), run.node);
                state.registry.insert(lane);
            }
            if let Some(e) = fatal {
                return Err(e);
            }

            self.check_budget_warning(state);
            self.merge_phase(graph, state).await?;
        }
    }

    fn working_node(&self, graph: &TaskGraph, state: &RunState, id: &NodeId) -> Result<TaskNode> {
        if let Some(node) = state.working.get(id) {
            return Ok(node.clone());
        }
        graph
            .node(id)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("node {} not in graph", id)))
    }

    fn block_pending(&self, graph: &mut TaskGraph, reason: &str) {
        let blocked = graph.block_pending(reason);
        if !blocked.is_empty() {
            self.events.emit(OrchestratorEvent::NodesBlocked {
                nodes: blocked,
                reason: reason.to_string(),
            });
        }
    }

    fn check_budget_warning(&self, state: &mut RunState) {
        if state.budget_warned || !self.budget.should_warn() {
            return;
        }
        state.budget_warned = true;
        let ratio = self.budget.usage_ratio();
        let tokens_used = self.budget.snapshot().request_tokens;
        llog_warn!("budget {:.0}% used ({} tokens)", ratio * 100.0, tokens_used);
        self.events
            .emit(OrchestratorEvent::BudgetWarning { ratio, tokens_used });
    }

    async fn merge_phase(&self, graph: &mut TaskGraph, state: &mut RunState) -> Result<()> {
        let session = self.run_id.to_string();
        let arbiter = MergeArbiter::new(&self.tools, &self.config.merge, &self.events, &session);

        for lane_id in state.registry.verified_queue() {
            let outcome = match arbiter.merge(&mut state.registry, graph, &lane_id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    llog_error!("merge of lane {} failed: {}", lane_id, e);
                    self.fail_lane(graph, state, &lane_id, &e.to_string())?;
                    continue;
                }
            };
            match outcome {
                MergeOutcome::Merged { .. } => {}
                MergeOutcome::Conflict { with, .. } => {
                    self.reconcile(graph, state, &lane_id, &with)?
                }
                MergeOutcome::Rejected { reason } => {
                    self.rework_after_merge(graph, state, &lane_id, &reason)?
                }
            }
        }
        Ok(())
    }

    /// Retire a conflicted lane and queue a fresh one for its node.
    fn reconcile(
        &self,
        graph: &mut TaskGraph,
        state: &mut RunState,
        lane_id: &LaneId,
        with: &LaneId,
    ) -> Result<()> {
        let lane = state.registry.require_mut(lane_id)?;
        let node_id = lane.node_id.clone();
        self.events.advance(
            lane,
            LaneStatus::PendingReconciliation,
            Actor::Supervisor,
            &format!("stale after conflict with {}", with),
        )?;

        let limit = self.config.orchestrator.max_reconciliations;
        if state.registry.reconciliations_for(&node_id) >= limit {
            let reason = format!("reconciliation limit of {} reached", limit);
            return self.fail_lane(graph, state, lane_id, &reason);
        }

        let new_lane = state.registry.create_reconciliation(lane_id)?;
        let stale = state.registry.require_mut(lane_id)?;
        self.events.advance(
            stale,
            LaneStatus::Archived,
            Actor::Supervisor,
            &format!("superseded by {}", new_lane),
        )?;
        // The new lane starts from the merged state; old rework notes no longer apply.
        state.working.remove(&node_id);
        llog!("queued reconciliation lane {} for {}", new_lane, node_id);
        self.events.emit(OrchestratorEvent::ReconciliationQueued {
            stale_lane: lane_id.clone(),
            new_lane,
            node_id,
        });
        Ok(())
    }

    /// A build rejection at merge time parks the lane for rework.
    fn rework_after_merge(
        &self,
        graph: &mut TaskGraph,
        state: &mut RunState,
        lane_id: &LaneId,
        reason: &str,
    ) -> Result<()> {
        let node_id = state
            .registry
            .get(lane_id)
            .map(|l| l.node_id.clone())
            .ok_or_else(|| Error::Validation(format!("lane {} not found", lane_id)))?;
        let mut node = self.working_node(graph, state, &node_id)?;
        let feedback = format!("Merge validation failed.\n- {}", reason);

        let lane = state.registry.require_mut(lane_id)?;
        if self.schedule_rework(lane, &mut node, &feedback)? {
            state.working.insert(node_id, node);
        } else {
            let reason = last_reason(lane);
            graph.set_status(&node_id, NodeStatus::Failed { reason })?;
            state.breaker.record_failure();
        }
        Ok(())
    }

    fn fail_lane(
        &self,
        graph: &mut TaskGraph,
        state: &mut RunState,
        lane_id: &LaneId,
        reason: &str,
    ) -> Result<()> {
        let lane = state.registry.require_mut(lane_id)?;
        if !lane.is_terminal() {
            self.events
                .advance(lane, LaneStatus::Failed, Actor::Supervisor, reason)?;
        }
        let node_id = lane.node_id.clone();
        graph.set_status(
            &node_id,
            NodeStatus::Failed {
                reason: reason.to_string(),
            },
        )?;
        state.breaker.record_failure();
        Ok(())
    }

    /// After dispatch stops, fail lanes left open and block unresolved nodes.
    fn close_out(&self, graph: &mut TaskGraph, state: &mut RunState) {
        let reason = state
            .halt_reason
            .clone()
            .unwrap_or_else(|| "run ended before the node resolved".to_string());

        let open: Vec<LaneId> = state
            .registry
            .lanes()
            .iter()
            .filter(|l| !l.is_terminal())
            .map(|l| l.lane_id.clone())
            .collect();
        for lane_id in open {
            if let Some(lane) = state.registry.get_mut(&lane_id) {
                if let Err(e) = self
                    .events
                    .advance(lane, LaneStatus::Failed, Actor::System, &reason)
                {
                    llog_error!("could not close lane {}: {}", lane_id, e);
                }
            }
        }

        let unresolved: Vec<NodeId> = graph
            .nodes()
            .filter(|n| !n.is_resolved())
            .map(|n| n.id.clone())
            .collect();
        for node_id in unresolved {
            let status = NodeStatus::Blocked {
                reason: reason.clone(),
            };
            if let Err(e) = graph.set_status(&node_id, status) {
                llog_error!("could not block {}: {}", node_id, e);
            }
        }
    }

    fn build_result(
        &self,
        graph: TaskGraph,
        state: RunState,
        fallback: bool,
        review: Option<QualityReport>,
        started: Instant,
    ) -> RunResult {
        let completed = graph.count_where(|s| matches!(s, NodeStatus::Complete));
        let failed = graph.count_where(|s| matches!(s, NodeStatus::Failed { .. }));
        let blocked = graph.count_where(|s| matches!(s, NodeStatus::Blocked { .. }));
        let tokens = self.budget.snapshot();
        let lanes = state.registry.into_lanes();

        let mut summary = format!(
            "{}/{} nodes complete ({} failed, {} blocked) across {} lanes; {} tokens, ${:.4}",
            completed,
            graph.len(),
            failed,
            blocked,
            lanes.len(),
            tokens.request_tokens,
            tokens.cost_usd
        );
        if let Some(reason) = &state.halt_reason {
            summary.push_str(&format!("; halted: {}", reason));
        }
        if let Some(review) = &review {
            summary.push_str(&format!(
                "; review {} ({:.1}/10)",
                if review.passed { "passed" } else { "failed" },
                review.score
            ));
        }

        RunResult {
            run_id: self.run_id,
            graph_id: graph.id(),
            goal: graph.goal().to_string(),
            success: completed == graph.len(),
            fallback_graph: fallback,
            completed,
            failed,
            blocked,
            nodes: graph.nodes().cloned().collect(),
            lanes,
            cost_usd: tokens.cost_usd,
            tokens,
            duration_ms: started.elapsed().as_millis() as u64,
            halt_reason: state.halt_reason,
            review,
            summary,
        }
    }

    // ========== Lane pipeline ==========

    /// Run one lane from QUEUED (or PENDING_REWORK) until it is VERIFIED
    /// and cleared every pre-merge gate, or FAILED.
    ///
    /// Bounded by the lane's `max_failures` attempts. Never panics and never
    /// loses the lane: a run-ending error is returned in [`LaneRun::fatal`]
    /// with the lane moved to FAILED.
    pub async fn run_lane(&self, mut lane: Lane, mut node: TaskNode) -> LaneRun {
        let started = Instant::now();
        let fatal = match self.drive(&mut lane, &mut node).await {
            Ok(()) => None,
            Err(e) => {
                if !lane.is_terminal() {
                    let reason = e.to_string();
                    if let Err(inner) =
                        self.events
                            .advance(&mut lane, LaneStatus::Failed, Actor::System, &reason)
                    {
                        llog_error!("could not fail lane {}: {}", lane.lane_id, inner);
                    }
                }
                if e.halts_run() {
                    Some(e)
                } else {
                    llog_error!("lane {} aborted: {}", lane.lane_id, e);
                    None
                }
            }
        };
        lane.metrics.duration_ms += started.elapsed().as_millis() as u64;
        LaneRun { lane, node, fatal }
    }

    async fn drive(&self, lane: &mut Lane, node: &mut TaskNode) -> Result<()> {
        let events = &self.events;
        match lane.status {
            LaneStatus::Queued => {
                events.advance(lane, LaneStatus::Provisioning, Actor::System, "provisioning")?;
                events.advance(
                    lane,
                    LaneStatus::Assigned,
                    Actor::Supervisor,
                    &format!("assigned {}", node.id),
                )?;
            }
            LaneStatus::PendingRework => {
                events.advance(lane, LaneStatus::Assigned, Actor::Supervisor, "resuming rework")?;
            }
            LaneStatus::Assigned => {}
            other => {
                return Err(Error::Validation(format!(
                    "lane {} cannot start from {}",
                    lane.lane_id, other
                )))
            }
        }
        events.emit(OrchestratorEvent::LaneStarted {
            lane_id: lane.lane_id.clone(),
            node_id: node.id.clone(),
        });

        loop {
            let attempt = lane.metrics.rework_count;
            events.advance(
                lane,
                LaneStatus::Working,
                Actor::Worker,
                &format!("attempt {}", attempt + 1),
            )?;
            let artifact = worker::run_worker(
                &self.gateway,
                &self.config.models,
                node,
                attempt,
                self.worker_tools(),
                &mut lane.metrics,
            )
            .await?;
            self.record_step(StepKind::Worker, !artifact.is_error(), Some(artifact.signature()));

            let tool_results = self.execute_tools(lane, node, &artifact).await?;
            lane.files_touched = artifact.files.clone();
            events.advance(lane, LaneStatus::PendingVerify, Actor::Worker, "artifact submitted")?;
            events.advance(lane, LaneStatus::Verifying, Actor::Verifier, "checking criteria")?;

            let verdict = verifier::verify(
                &self.gateway,
                &self.config.models.verifier,
                node,
                &artifact,
                &tool_results,
                &mut lane.metrics,
            )
            .await?;
            self.record_step(StepKind::Verification, verdict.passed(), None);
            events.emit(OrchestratorEvent::VerificationResult {
                lane_id: lane.lane_id.clone(),
                attempt: attempt + 1,
                passed: verdict.passed(),
                issues: verdict.issues.clone(),
                criteria_met: verdict.criteria_met,
            });
            lane.artifacts.worker = Some(artifact);
            lane.artifacts.verdict = Some(verdict.clone());

            let feedback = if verdict.passed() {
                events.advance(
                    lane,
                    LaneStatus::Verified,
                    Actor::Verifier,
                    &format!("{} criteria met", verdict.criteria_met),
                )?;
                match self.pre_merge_gates(lane, node).await? {
                    Some(feedback) => feedback,
                    None => return Ok(()),
                }
            } else {
                events.advance(
                    lane,
                    LaneStatus::Rejected,
                    Actor::Verifier,
                    &format!("{} issues", verdict.issues.len()),
                )?;
                verdict.feedback()
            };

            if !self.schedule_rework(lane, node, &feedback)? {
                return Ok(());
            }
            let reason = format!(
                "rework {} escalated to {}",
                lane.metrics.rework_count,
                WorkerRole::Architect
            );
            events.advance(lane, LaneStatus::Assigned, Actor::Supervisor, &reason)?;
        }
    }

    /// Tools a worker may propose: in direct mode its calls run as the
    /// Worker role, so only that role's tools are offered.
    fn worker_tools(&self) -> &'static [ToolName] {
        match self.config.orchestrator.tool_mode {
            ToolMode::Direct => Role::Worker.allowed_tools(),
            ToolMode::Translated => &ToolName::ALL,
        }
    }

    /// Run the worker's tool calls through the permission gate.
    async fn execute_tools(
        &self,
        lane: &mut Lane,
        node: &TaskNode,
        artifact: &WorkerArtifact,
    ) -> Result<Vec<ToolRecord>> {
        let (calls, role) = match self.config.orchestrator.tool_mode {
            ToolMode::Direct => (artifact.tool_calls.clone(), Role::Worker),
            ToolMode::Translated => {
                let calls = worker::translate_tool_calls(
                    &self.gateway,
                    &self.config.models.translator,
                    node,
                    artifact,
                    &mut lane.metrics,
                )
                .await?;
                (calls, Role::Operator)
            }
        };

        let session = self.run_id.to_string();
        let agent = lane.lane_id.to_string();
        let caller = Caller {
            session_id: &session,
            agent_id: &agent,
            role,
        };
        let mut records = Vec::with_capacity(calls.len());
        for raw in &calls {
            let record = self.tools.run_raw(&caller, raw).await;
            // Refusals count against the lane, not the run.
            if !record.denied {
                self.record_step(StepKind::Tool, record.outcome.success, None);
            }
            lane.metrics.tool_calls += 1;
            records.push(record);
        }
        lane.artifacts.tool_results.extend(records.iter().cloned());
        Ok(records)
    }

    /// Quality gate and consensus for a VERIFIED lane.
    ///
    /// Returns rework feedback when consensus rejected the lane (now
    /// REJECTED); `None` when the lane cleared every gate or the quality
    /// gate failed it.
    async fn pre_merge_gates(&self, lane: &mut Lane, node: &TaskNode) -> Result<Option<String>> {
        let Some(artifact) = lane.artifacts.worker.clone() else {
            return Ok(None);
        };

        if needs_quality_gate(node, &self.config.quality_gate) {
            let report = verifier::quality_gate(
                &self.gateway,
                &self.config.models.judge,
                &self.config.quality_gate,
                node,
                &artifact,
                &mut lane.metrics,
            )
            .await?;
            self.events.emit(OrchestratorEvent::QualityGateResult {
                lane_id: lane.lane_id.clone(),
                passed: report.passed,
                score: report.score,
            });
            let passed = report.passed;
            let score = report.score;
            lane.artifacts.quality = Some(report);
            if !passed {
                self.events.advance(
                    lane,
                    LaneStatus::Failed,
                    Actor::Supervisor,
                    &format!("quality gate failed with score {:.1}", score),
                )?;
                return Ok(None);
            }
        }

        if requires_consensus(node, &self.config.consensus) {
            let outcome = collect_votes(
                &self.gateway,
                &self.config.consensus,
                node,
                &artifact,
                &mut lane.metrics,
            )
            .await?;
            self.events.emit(OrchestratorEvent::ConsensusResult {
                lane_id: lane.lane_id.clone(),
                approved: outcome.approved,
                approvals: outcome.approvals,
                quorum: outcome.quorum,
            });
            let approved = outcome.approved;
            let feedback = outcome.feedback();
            lane.artifacts.consensus = Some(outcome);
            if !approved {
                self.events
                    .advance(lane, LaneStatus::Rejected, Actor::Supervisor, "consensus rejected")?;
                return Ok(Some(feedback));
            }
        }
        Ok(None)
    }

    /// Count a failure on a REJECTED lane. With attempts left the lane moves
    /// to PENDING_REWORK and `feedback` is appended to the node description;
    /// otherwise it fails. Returns whether rework was scheduled.
    fn schedule_rework(&self, lane: &mut Lane, node: &mut TaskNode, feedback: &str) -> Result<bool> {
        lane.failure_count += 1;
        if !lane.has_attempts_left() {
            let reason = format!(
                "rework attempts exhausted after {} failures",
                lane.failure_count
            );
            self.events
                .advance(lane, LaneStatus::Failed, Actor::Supervisor, &reason)?;
            return Ok(false);
        }

        lane.metrics.rework_count += 1;
        let reason = format!("failure {} of {}", lane.failure_count, lane.max_failures);
        self.events
            .advance(lane, LaneStatus::PendingRework, Actor::Supervisor, &reason)?;
        self.events.emit(OrchestratorEvent::ReworkTriggered {
            lane_id: lane.lane_id.clone(),
            attempt: lane.metrics.rework_count,
            feedback: feedback.to_string(),
        });
        node.description = format!("{}\n\n{}", node.description.trim_end(), feedback);
        Ok(true)
    }
}

/// Reason on the lane's latest audit entry.
fn last_reason(lane: &Lane) -> String {
    lane.audit_trail
        .last()
        .map(|e| e.reason.clone())
        .unwrap_or_else(|| "lane failed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::model::{ChatMessage, ModelReply};
    use crate::orchestration::tools::DryRunExecutor;
    use async_trait::async_trait;

    /// One reply that satisfies every role's schema.
    struct Agreeable;

    #[async_trait]
    impl ModelClient for Agreeable {
        async fn invoke(&self, _model: &str, messages: &[ChatMessage]) -> Result<ModelReply> {
            let n = messages.iter().map(|m| m.content.len()).sum::<usize>();
            Ok(ModelReply::text(format!(
                r#"{{"summary": "done {}", "verdict": "pass", "criteriaMet": 1,
                   "passed": true, "score": 9, "approved": true, "rationale": "fine"}}"#,
                n
            )))
        }
    }

    fn orchestrator(config: Config) -> Orchestrator {
        Orchestrator::new(config, Arc::new(Agreeable), Arc::new(DryRunExecutor::new()))
    }

    #[test]
    fn test_run_id_short() {
        let id = RunId::new();
        assert_eq!(id.short().len(), 8);
        assert!(id.to_string().starts_with(&id.short()));
    }

    #[tokio::test]
    async fn test_single_node_goal_merges() {
        let orch = orchestrator(Config::default());
        let result = orch.run("Fix the typo in README").await.unwrap();
        assert!(result.success);
        assert_eq!(result.lanes.len(), 1);
        assert_eq!(result.lanes[0].status, LaneStatus::Merged);
        assert!(result.review.is_some());
        assert!(result.summary.starts_with("1/1 nodes complete"));
    }

    #[tokio::test]
    async fn test_run_lane_rejects_terminal_start() {
        let orch = orchestrator(Config::default());
        let node = TaskNode::new("a", "A", "a");
        let mut lane = Lane::new(LaneId::from("lane-x"), node.id.clone(), 1);
        lane.advance(LaneStatus::Archived, Actor::System, "test").unwrap();
        let run = orch.run_lane(lane, node).await;
        assert!(run.fatal.is_none());
        assert_eq!(run.lane.status, LaneStatus::Archived);
    }

    #[tokio::test]
    async fn test_each_run_starts_a_fresh_stall_detector() {
        let mut config = Config::default();
        config.stall.max_steps = 3;
        let orch = orchestrator(config);

        for _ in 0..2 {
            let result = orch
                .run_graph(TaskGraph::single_node("Fix the typo"))
                .await
                .unwrap();
            assert!(result.success);
            assert_eq!(result.halt_reason, None);
        }
    }

    #[test]
    fn test_worker_tools_follow_tool_mode() {
        let orch = orchestrator(Config::default());
        assert_eq!(orch.worker_tools(), Role::Worker.allowed_tools());
        assert!(orch.worker_tools().iter().all(|t| !t.is_mutating()));

        let mut config = Config::default();
        config.orchestrator.tool_mode = ToolMode::Translated;
        assert_eq!(orchestrator(config).worker_tools(), &ToolName::ALL);
    }

    #[tokio::test]
    async fn test_cancelled_run_returns_error() {
        let orch = orchestrator(Config::default());
        orch.cancel();
        let graph = TaskGraph::single_node("anything");
        let err = orch.run_graph(graph).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }
}
