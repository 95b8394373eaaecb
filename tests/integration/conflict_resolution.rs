//! Merge conflicts between parallel lanes and their reconciliation.

use std::sync::Arc;

use lanes::core::{NodeStatus, TaskGraph, TaskNode};
use lanes::lane::{FileRegion, LaneStatus};
use lanes::orchestration::OrchestratorEvent;

use crate::fixtures::{count_kind, drain, orchestrator, test_config, ScriptedModel};

fn pair() -> TaskGraph {
    TaskGraph::new(
        "two edits",
        vec![
            TaskNode::new("left", "Left", "edit the parser"),
            TaskNode::new("right", "Right", "edit the parser too"),
        ],
    )
    .unwrap()
}

#[tokio::test]
async fn test_overlapping_lanes_reconcile_and_both_merge() {
    let shared = FileRegion::lines("src/parser.rs", 10, 20);
    let model = Arc::new(
        ScriptedModel::new()
            .touching("left", &[shared.clone()])
            .touching("right", &[FileRegion::lines("src/parser.rs", 15, 30)]),
    );
    let (orch, mut rx) = orchestrator(test_config(), Arc::clone(&model));

    let result = orch.run_graph(pair()).await.unwrap();

    assert!(result.success, "{}", result.summary);
    assert_eq!(result.lanes.len(), 3);

    let events = drain(&mut rx);
    assert_eq!(count_kind(&events, "merge_conflict"), 1);
    assert_eq!(count_kind(&events, "reconciliation_queued"), 1);
    assert_eq!(count_kind(&events, "merge_complete"), 2);

    // Whichever lane lost the race was archived and replaced.
    let stale = result
        .lanes
        .iter()
        .find(|l| l.status == LaneStatus::Archived)
        .unwrap();
    let history = stale.status_history();
    assert!(history.ends_with(&[
        LaneStatus::Verified,
        LaneStatus::MergeConflict,
        LaneStatus::PendingReconciliation,
        LaneStatus::Archived,
    ]));

    let replacement = result
        .lanes
        .iter()
        .find(|l| l.spawned_from.as_ref() == Some(&stale.lane_id))
        .unwrap();
    assert_eq!(replacement.node_id, stale.node_id);
    assert_eq!(replacement.status, LaneStatus::Merged);
    assert_eq!(replacement.base_merge_seq, 1);
    assert_eq!(replacement.merge_seq, Some(2));
    assert_eq!(
        replacement.status_history().first(),
        Some(&LaneStatus::PendingReconciliation)
    );

    let conflict = events
        .iter()
        .find_map(|e| match e {
            OrchestratorEvent::MergeConflict {
                lane_id,
                conflicting_lane,
                ..
            } => Some((lane_id.clone(), conflicting_lane.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(conflict.0, stale.lane_id);
    assert_ne!(conflict.1, stale.lane_id);
}

#[tokio::test]
async fn test_disjoint_ranges_in_one_file_do_not_conflict() {
    let model = Arc::new(
        ScriptedModel::new()
            .touching("left", &[FileRegion::lines("src/parser.rs", 1, 10)])
            .touching("right", &[FileRegion::lines("src/parser.rs", 40, 60)]),
    );
    let (orch, mut rx) = orchestrator(test_config(), Arc::clone(&model));

    let result = orch.run_graph(pair()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.lanes.len(), 2);
    assert_eq!(count_kind(&drain(&mut rx), "merge_conflict"), 0);
}

#[tokio::test]
async fn test_whole_file_edit_conflicts_with_any_range() {
    let model = Arc::new(
        ScriptedModel::new()
            .touching("left", &[FileRegion::whole_file("Cargo.toml")])
            .touching("right", &[FileRegion::lines("Cargo.toml", 3, 4)]),
    );
    let (orch, mut rx) = orchestrator(test_config(), Arc::clone(&model));

    let result = orch.run_graph(pair()).await.unwrap();

    assert!(result.success);
    assert_eq!(count_kind(&drain(&mut rx), "merge_conflict"), 1);
}

#[tokio::test]
async fn test_reconciliation_limit_fails_node() {
    let model = Arc::new(
        ScriptedModel::new()
            .touching("left", &[FileRegion::whole_file("src/parser.rs")])
            .touching("right", &[FileRegion::whole_file("src/parser.rs")]),
    );
    let mut config = test_config();
    config.orchestrator.max_reconciliations = 0;
    let (orch, mut rx) = orchestrator(config, Arc::clone(&model));

    let result = orch.run_graph(pair()).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.completed, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.lanes.len(), 2);

    let failed = result
        .nodes
        .iter()
        .find(|n| matches!(n.status, NodeStatus::Failed { .. }))
        .unwrap();
    let lanes = result.lanes_for(failed.id.as_str());
    let lane = lanes[0];
    assert_eq!(lane.status, LaneStatus::Failed);
    assert!(lane.spawned_from.is_none());

    let events = drain(&mut rx);
    assert_eq!(count_kind(&events, "reconciliation_queued"), 0);
}
