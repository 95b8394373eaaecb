//! End-to-end runs from goal to merged result.

use std::sync::Arc;

use serde_json::json;

use lanes::core::{NodeId, NodeStatus, TaskGraph, TaskNode, SINGLE_NODE_ID};
use lanes::lane::LaneStatus;
use lanes::orchestration::OrchestratorEvent;
use tokio_test::assert_ok;

use crate::fixtures::{
    count_kind, diamond_graph, drain, orchestrator, test_config, ScriptedModel, JUDGE, PLANNER,
    VERIFIER, WORKER_STANDARD,
};

#[tokio::test]
async fn test_short_goal_runs_single_lane_without_planner() {
    let model = Arc::new(ScriptedModel::new());
    let (orch, mut rx) = orchestrator(test_config(), Arc::clone(&model));

    let result = assert_ok!(orch.run("Fix the typo in README").await);

    assert!(result.success);
    assert!(!result.fallback_graph);
    assert_eq!(model.calls_to(PLANNER), 0);
    assert_eq!(result.nodes.len(), 1);
    assert_eq!(result.nodes[0].id.as_str(), SINGLE_NODE_ID);
    assert_eq!(result.lanes.len(), 1);

    let lane = &result.lanes[0];
    assert_eq!(
        lane.status_history(),
        vec![
            LaneStatus::Queued,
            LaneStatus::Provisioning,
            LaneStatus::Assigned,
            LaneStatus::Working,
            LaneStatus::PendingVerify,
            LaneStatus::Verifying,
            LaneStatus::Verified,
            LaneStatus::Merged,
        ]
    );
    assert_eq!(lane.merge_seq, Some(1));
    assert_eq!(lane.metrics.worker_invocations, 1);
    assert_eq!(model.worker_calls_for(SINGLE_NODE_ID), vec![WORKER_STANDARD]);
    assert_eq!(model.calls_to(VERIFIER), 1);
    assert_eq!(model.calls_to(JUDGE), 1);
    assert!(result.review.as_ref().is_some_and(|r| r.passed));
    assert!(result.tokens.request_tokens > 0);

    let events = drain(&mut rx);
    assert_eq!(events.first().map(|e| e.kind()), Some("run_started"));
    assert_eq!(events.last().map(|e| e.kind()), Some("run_complete"));
    assert_eq!(count_kind(&events, "merge_complete"), 1);
}

#[tokio::test]
async fn test_planned_graph_runs_dependents_after_their_dependencies_merge() {
    let plan = json!({
        "nodes": [
            {"id": "schema", "title": "Schema", "description": "Add the users table",
             "acceptanceCriteria": ["table exists"]},
            {"id": "config", "title": "Config", "description": "Add the feature flag",
             "acceptanceCriteria": ["flag read"]},
            {"id": "api", "title": "API", "description": "Expose users over HTTP",
             "dependencies": ["schema", "config"], "acceptanceCriteria": ["endpoint responds"]}
        ]
    });
    let model = Arc::new(ScriptedModel::new().with_plan(plan));
    let (orch, mut rx) = orchestrator(test_config(), Arc::clone(&model));

    let result = orch
        .run("Add a users table then expose it over the API")
        .await
        .unwrap();

    assert!(result.success, "{}", result.summary);
    assert_eq!(model.calls_to(PLANNER), 1);
    assert_eq!(result.completed, 3);
    assert_eq!(result.lanes.len(), 3);

    let events = drain(&mut rx);
    let position = |pred: &dyn Fn(&OrchestratorEvent) -> bool| {
        events.iter().position(|e| pred(e)).unwrap()
    };
    let started = |id: &'static str| {
        move |e: &OrchestratorEvent| {
            matches!(e, OrchestratorEvent::LaneStarted { node_id, .. } if node_id.as_str() == id)
        }
    };
    let merged = |id: &'static str| {
        move |e: &OrchestratorEvent| {
            matches!(e, OrchestratorEvent::MergeComplete { node_id, .. } if node_id.as_str() == id)
        }
    };

    let api_started = position(&started("api"));
    assert!(position(&merged("schema")) < api_started);
    assert!(position(&merged("config")) < api_started);
    // Both independent lanes start before either merges.
    assert!(position(&started("config")) < position(&merged("schema")));
    assert!(position(&started("schema")) < position(&merged("config")));
}

#[tokio::test]
async fn test_unusable_plan_falls_back_to_single_node() {
    let model = Arc::new(ScriptedModel::new().with_unusable_plan());
    let (orch, _rx) = orchestrator(test_config(), Arc::clone(&model));

    let result = orch
        .run("Migrate the billing service to the new queue then remove the old consumer")
        .await
        .unwrap();

    assert!(result.fallback_graph);
    assert!(result.success);
    assert_eq!(result.nodes.len(), 1);
    assert_eq!(result.nodes[0].id.as_str(), SINGLE_NODE_ID);
}

#[tokio::test]
async fn test_run_graph_skips_planner() {
    let model = Arc::new(ScriptedModel::new());
    let (orch, _rx) = orchestrator(test_config(), Arc::clone(&model));

    let result = assert_ok!(orch.run_graph(diamond_graph()).await);

    assert!(result.success);
    assert_eq!(model.calls_to(PLANNER), 0);
    for node in &result.nodes {
        assert_eq!(node.status, NodeStatus::Complete);
        assert!(node.merged_lane.is_some());
    }
}

#[tokio::test]
async fn test_unsatisfiable_dependencies_block_instead_of_hanging() {
    let mut graph = TaskGraph::new(
        "stuck",
        vec![
            TaskNode::new("a", "A", "held elsewhere"),
            TaskNode::new("b", "B", "needs a").with_dependencies(&["a"]),
        ],
    )
    .unwrap();
    graph
        .set_status(&NodeId::from("a"), NodeStatus::Dispatched)
        .unwrap();

    let model = Arc::new(ScriptedModel::new());
    let (orch, mut rx) = orchestrator(test_config(), Arc::clone(&model));
    let result = orch.run_graph(graph).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.blocked, 2);
    assert!(result.lanes.is_empty());
    assert!(result.halt_reason.as_deref().unwrap().contains("deadlock"));
    assert!(result.review.is_none());
    assert!(model.invocations().is_empty());

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::NodesBlocked { nodes, .. } if nodes == &vec![NodeId::from("b")]
    )));
}
