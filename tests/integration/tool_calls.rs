//! Tool calls proposed by workers: direct mode, translated mode, and how
//! their outcomes feed the stall detector.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use lanes::config::ToolMode;
use lanes::core::{NodeStatus, TaskGraph, TaskNode};
use lanes::guard::Role;
use lanes::lane::LaneStatus;
use lanes::orchestration::{
    DryRunExecutor, OrchestratorEvent, ToolCall, ToolExecutor, ToolName, ToolOutcome,
};
use lanes::Result;
use tokio_test::assert_ok;

use crate::fixtures::{
    count_kind, drain, independent_graph, orchestrator, orchestrator_with, test_config,
    ScriptedModel, TRANSLATOR,
};

fn one_node(id: &str) -> TaskGraph {
    match TaskGraph::new("tools", vec![TaskNode::new(id, "Users", "add the users module")]) {
        Ok(graph) => graph,
        Err(e) => panic!("graph is valid: {}", e),
    }
}

fn four_edits() -> serde_json::Value {
    json!((0..4)
        .map(|i| json!({"tool": "write_file",
                        "args": {"path": format!("src/m{}.rs", i), "content": "pub fn f() {}"}}))
        .collect::<Vec<_>>())
}

#[tokio::test]
async fn test_translated_mutations_run_as_operator() {
    let model = Arc::new(ScriptedModel::new().translating(
        "users",
        json!([{"tool": "write_file", "args": {"path": "src/users.rs", "content": "pub struct User;"}}]),
    ));
    let mut config = test_config();
    config.orchestrator.tool_mode = ToolMode::Translated;
    let executor = Arc::new(DryRunExecutor::new());
    let (orch, _rx) = orchestrator_with(config, Arc::clone(&model), executor.clone());

    let result = assert_ok!(orch.run_graph(one_node("users")).await);

    assert!(result.success, "{}", result.summary);
    assert_eq!(model.calls_to(TRANSLATOR), 1);
    let writes: Vec<ToolCall> = executor
        .calls()
        .into_iter()
        .filter(|c| c.tool == ToolName::WriteFile)
        .collect();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].path(), Some("src/users.rs"));

    let lane = &result.lanes[0];
    assert_eq!(lane.metrics.tool_calls, 1);
    assert!(lane.artifacts.tool_results[0].outcome.success);
    let audit = orch.permissions().audit_for_agent(lane.lane_id.as_str());
    assert_eq!(audit.len(), 1);
    assert!(audit[0].approved);
    assert_eq!(audit[0].role, Role::Operator);
    assert_eq!(audit[0].tool, "write_file");
}

#[tokio::test]
async fn test_direct_mode_denies_and_audits_worker_mutations() {
    let model = Arc::new(ScriptedModel::new().proposing(
        "users",
        json!([
            {"tool": "write_file", "args": {"path": "src/users.rs", "content": "x"}},
            {"tool": "read_file", "args": {"path": "src/lib.rs"}},
            {"tool": "read_file", "args": {}}
        ]),
    ));
    let executor = Arc::new(DryRunExecutor::new());
    let (orch, _rx) = orchestrator_with(test_config(), Arc::clone(&model), executor.clone());

    let result = assert_ok!(orch.run_graph(one_node("users")).await);

    assert!(result.success, "{}", result.summary);
    assert_eq!(model.calls_to(TRANSLATOR), 0);
    assert!(executor.calls().iter().all(|c| c.tool != ToolName::WriteFile));
    assert!(executor
        .calls()
        .iter()
        .any(|c| c.tool == ToolName::ReadFile && c.path() == Some("src/lib.rs")));

    let lane = &result.lanes[0];
    let records = &lane.artifacts.tool_results;
    assert_eq!(records.len(), 3);
    assert!(records[0].denied && !records[0].outcome.success);
    assert!(!records[1].denied && records[1].outcome.success);
    assert!(records[2].denied);

    let session = orch.run_id().to_string();
    let audit = orch.permissions().audit_for_session(&session);
    let lane_audit: Vec<_> = audit
        .iter()
        .filter(|r| r.agent_id == lane.lane_id.as_str())
        .collect();
    assert_eq!(lane_audit.len(), 3);
    assert!(lane_audit.iter().all(|r| r.role == Role::Worker));
    let denied: Vec<&str> = lane_audit
        .iter()
        .filter(|r| !r.approved)
        .map(|r| r.tool.as_str())
        .collect();
    assert_eq!(denied, vec!["write_file", "read_file"]);
    assert_eq!(lane_audit[0].reason, "role worker may not call write_file");
}

#[tokio::test]
async fn test_refused_edits_do_not_stall_the_run() {
    let model = Arc::new(
        ScriptedModel::new()
            .proposing("t0", four_edits())
            .proposing("t1", four_edits())
            .failing("t0", 1)
            .failing("t1", 1),
    );
    let mut config = test_config();
    config.orchestrator.max_concurrent_lanes = 1;
    config.orchestrator.max_rework_attempts = 0;
    let (orch, mut rx) = orchestrator(config, Arc::clone(&model));

    let result = assert_ok!(orch.run_graph(independent_graph(2)).await);

    assert_eq!(result.failed, 2);
    assert_eq!(result.blocked, 0);
    assert_eq!(result.halt_reason, None);
    assert_eq!(result.lanes.len(), 2);
    assert_eq!(orch.permissions().denials().len(), 8);

    let events = drain(&mut rx);
    assert_eq!(count_kind(&events, "stall_warning"), 0);
    assert_eq!(count_kind(&events, "nodes_blocked"), 0);
}

/// Runs every call and reports each one as failed.
struct FailingExecutor;

#[async_trait]
impl ToolExecutor for FailingExecutor {
    async fn execute(&self, call: &ToolCall) -> Result<ToolOutcome> {
        Ok(ToolOutcome::failure(format!("{} failed", call.tool)))
    }
}

#[tokio::test]
async fn test_failing_tool_steps_halt_the_run() {
    let reads = json!([
        {"tool": "read_file", "args": {"path": "src/a.rs"}},
        {"tool": "search", "args": {"query": "fn main"}}
    ]);
    let mut model = ScriptedModel::new();
    for i in 0..3 {
        let node = format!("t{}", i);
        model = model.proposing(&node, reads.clone()).failing(&node, 1);
    }
    let model = Arc::new(model);
    let mut config = test_config();
    config.orchestrator.max_concurrent_lanes = 1;
    config.orchestrator.max_rework_attempts = 0;
    config.stall.max_no_progress = 3;
    let (orch, mut rx) = orchestrator_with(config, Arc::clone(&model), Arc::new(FailingExecutor));

    let result = assert_ok!(orch.run_graph(independent_graph(3)).await);

    assert!(!result.success);
    assert_eq!(result.failed, 1);
    assert_eq!(result.blocked, 2);
    assert_eq!(result.lanes.len(), 1);
    assert_eq!(result.lanes[0].status, LaneStatus::Failed);
    assert_eq!(
        result.halt_reason.as_deref(),
        Some("stalled: no progress in 3 consecutive steps")
    );
    assert!(result.review.is_none());
    let blocked: Vec<_> = result
        .nodes
        .iter()
        .filter(|n| matches!(n.status, NodeStatus::Blocked { .. }))
        .collect();
    assert_eq!(blocked.len(), 2);

    let events = drain(&mut rx);
    let warning = events.iter().find_map(|e| match e {
        OrchestratorEvent::StallWarning { reason } => Some(reason.to_string()),
        _ => None,
    });
    assert_eq!(warning.as_deref(), Some("no progress in 3 consecutive steps"));
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::NodesBlocked { nodes, reason }
            if nodes.len() == 2 && reason.starts_with("stalled")
    )));
    assert_eq!(count_kind(&events, "run_error"), 1);
    assert_eq!(events.last().map(|e| e.kind()), Some("run_complete"));
}
