//! Rework, bounded failure and run-level halts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use lanes::core::{NodeStatus, TaskGraph, TaskNode};
use lanes::lane::{Lane, LaneId, LaneStatus};
use lanes::orchestration::{
    EventSink, Orchestrator, OrchestratorEvent, ToolCall, ToolExecutor, ToolName, ToolOutcome,
};
use lanes::{Error, Result};
use tokio_test::{assert_err, assert_ok};

use crate::fixtures::{
    count_kind, drain, independent_graph, orchestrator, test_config, ScriptedModel, VERIFIER,
    WORKER_STANDARD, WORKER_STRONG,
};

#[tokio::test]
async fn test_lane_reworks_until_verifier_passes() {
    let model = Arc::new(ScriptedModel::new().failing("flaky", 2));
    let (orch, mut rx) = orchestrator(test_config(), Arc::clone(&model));

    let node = TaskNode::new("flaky", "Flaky", "make the parser strict")
        .with_criteria(&["rejects trailing commas"]);
    let lane = Lane::new(LaneId::from("lane-rework"), node.id.clone(), 3);

    let run = orch.run_lane(lane, node).await;

    assert!(run.fatal.is_none());
    assert_eq!(run.lane.status, LaneStatus::Verified);
    assert_eq!(run.lane.metrics.worker_invocations, 3);
    assert_eq!(run.lane.metrics.rework_count, 2);
    assert_eq!(run.lane.failure_count, 2);
    assert_eq!(
        model.worker_calls_for("flaky"),
        vec![WORKER_STANDARD, WORKER_STRONG, WORKER_STRONG]
    );
    assert_eq!(model.calls_to(VERIFIER), 3);
    // Each rejection's notes travel with the node into the next attempt.
    assert_eq!(
        run.node
            .description
            .matches("Previous attempt was rejected")
            .count(),
        2
    );

    let history = run.lane.status_history();
    assert_eq!(
        history
            .iter()
            .filter(|s| **s == LaneStatus::PendingRework)
            .count(),
        2
    );

    let events = drain(&mut rx);
    assert_eq!(count_kind(&events, "rework_triggered"), 2);
    assert_eq!(count_kind(&events, "verification_result"), 3);
}

#[tokio::test]
async fn test_exhausted_rework_fails_node() {
    let model = Arc::new(ScriptedModel::new().failing("t0", 10));
    let mut config = test_config();
    config.orchestrator.max_rework_attempts = 2;
    let (orch, _rx) = orchestrator(config, Arc::clone(&model));

    let result = orch.run_graph(independent_graph(1)).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.failed, 1);
    let lane = &result.lanes[0];
    assert_eq!(lane.status, LaneStatus::Failed);
    assert_eq!(lane.failure_count, 3);
    assert_eq!(lane.metrics.worker_invocations, 3);
    assert!(matches!(
        result.nodes[0].status,
        NodeStatus::Failed { ref reason } if reason.contains("exhausted")
    ));
}

#[tokio::test]
async fn test_circuit_breaker_blocks_remaining_nodes() {
    let mut model = ScriptedModel::new();
    for i in 0..5 {
        model = model.failing(&format!("t{}", i), 10);
    }
    let model = Arc::new(model);
    let mut config = test_config();
    config.orchestrator.max_concurrent_lanes = 1;
    config.orchestrator.max_rework_attempts = 0;
    let (orch, mut rx) = orchestrator(config, Arc::clone(&model));

    let result = orch.run_graph(independent_graph(5)).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.failed, 3);
    assert_eq!(result.blocked, 2);
    assert_eq!(result.lanes.len(), 3);
    assert!(result
        .halt_reason
        .as_deref()
        .unwrap()
        .contains("circuit breaker"));
    assert!(result.review.is_none());

    let events = drain(&mut rx);
    assert_eq!(count_kind(&events, "run_error"), 1);
    assert_eq!(count_kind(&events, "nodes_blocked"), 1);
    assert_eq!(events.last().map(|e| e.kind()), Some("run_complete"));
}

#[tokio::test]
async fn test_budget_exhaustion_aborts_run() {
    let model = Arc::new(ScriptedModel::new());
    let mut config = test_config();
    config.budget.per_request_tokens = 200;
    let (orch, mut rx) = orchestrator(config, Arc::clone(&model));

    let err = assert_err!(orch.run_graph(independent_graph(3)).await);

    assert!(err.is_budget_exhausted(), "unexpected error: {}", err);
    assert!(orch.budget().snapshot().request_tokens <= 200);
    let events = drain(&mut rx);
    assert_eq!(count_kind(&events, "run_error"), 1);
    assert_eq!(count_kind(&events, "run_complete"), 0);
}

/// Fails the first build, passes every later one.
#[derive(Default)]
struct FlakyBuild {
    builds: AtomicUsize,
}

#[async_trait]
impl ToolExecutor for FlakyBuild {
    async fn execute(&self, call: &ToolCall) -> Result<ToolOutcome> {
        if call.tool == ToolName::RunCommand && self.builds.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(ToolOutcome::failure("error[E0308]: mismatched types"));
        }
        Ok(ToolOutcome::ok("ok"))
    }
}

#[tokio::test]
async fn test_failed_build_parks_lane_for_rework() {
    let model = Arc::new(ScriptedModel::new());
    let mut config = test_config();
    config.merge.build_command = Some("cargo build".to_string());
    let (events, mut rx) = EventSink::channel();
    let orch = Orchestrator::new(config, model.clone(), Arc::new(FlakyBuild::default()))
        .with_events(events);

    let graph = TaskGraph::new("one", vec![TaskNode::new("build", "Build", "change types")])
        .unwrap();
    let result = assert_ok!(orch.run_graph(graph).await);

    assert!(result.success, "{}", result.summary);
    assert_eq!(result.lanes.len(), 1);
    let lane = &result.lanes[0];
    assert_eq!(lane.status, LaneStatus::Merged);
    assert_eq!(lane.metrics.rework_count, 1);
    assert_eq!(
        model.worker_calls_for("build"),
        vec![WORKER_STANDARD, WORKER_STRONG]
    );

    let events = drain(&mut rx);
    let feedback = events
        .iter()
        .find_map(|e| match e {
            OrchestratorEvent::ReworkTriggered { feedback, .. } => Some(feedback.clone()),
            _ => None,
        })
        .unwrap();
    assert!(feedback.contains("Merge validation failed"));
}

#[tokio::test]
async fn test_cancelled_run_returns_cancelled() {
    let model = Arc::new(ScriptedModel::new());
    let (orch, _rx) = orchestrator(test_config(), Arc::clone(&model));
    orch.cancel();

    let err = assert_err!(orch.run_graph(independent_graph(2)).await);

    assert!(matches!(err, Error::Cancelled(_)));
}
