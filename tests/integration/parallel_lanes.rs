//! Parallel dispatch bounds and serial merge ordering.

use std::sync::Arc;
use std::time::Duration;

use lanes::lane::LaneStatus;

use crate::fixtures::{independent_graph, orchestrator, test_config, ScriptedModel};

#[tokio::test]
async fn test_concurrency_never_exceeds_lane_limit() {
    let model = Arc::new(ScriptedModel::new().with_worker_delay(Duration::from_millis(50)));
    let mut config = test_config();
    config.orchestrator.max_concurrent_lanes = 3;
    let (orch, _rx) = orchestrator(config, Arc::clone(&model));

    let result = orch.run_graph(independent_graph(7)).await.unwrap();

    assert!(result.success, "{}", result.summary);
    assert_eq!(result.lanes.len(), 7);
    assert_eq!(model.peak_concurrency(), 3);
}

#[tokio::test]
async fn test_single_lane_limit_runs_serially() {
    let model = Arc::new(ScriptedModel::new().with_worker_delay(Duration::from_millis(10)));
    let mut config = test_config();
    config.orchestrator.max_concurrent_lanes = 1;
    let (orch, _rx) = orchestrator(config, Arc::clone(&model));

    let result = orch.run_graph(independent_graph(3)).await.unwrap();

    assert!(result.success);
    assert_eq!(model.peak_concurrency(), 1);
}

#[tokio::test]
async fn test_merge_sequence_follows_verification_order() {
    let model = Arc::new(ScriptedModel::new());
    let (orch, _rx) = orchestrator(test_config(), Arc::clone(&model));

    let result = orch.run_graph(independent_graph(5)).await.unwrap();

    let mut merged: Vec<_> = result
        .lanes
        .iter()
        .filter(|l| l.status == LaneStatus::Merged)
        .collect();
    assert_eq!(merged.len(), 5);
    merged.sort_by_key(|l| l.verified_seq);

    let seqs: Vec<u64> = merged.iter().filter_map(|l| l.merge_seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_lane_ids_are_unique_and_isolated() {
    let model = Arc::new(ScriptedModel::new());
    let (orch, _rx) = orchestrator(test_config(), Arc::clone(&model));

    let result = orch.run_graph(independent_graph(4)).await.unwrap();

    let mut ids: Vec<_> = result.lanes.iter().map(|l| l.lane_id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    for lane in &result.lanes {
        let worker = lane.artifacts.worker.as_ref().unwrap();
        assert!(worker.summary.starts_with(lane.node_id.as_str()));
        assert!(lane.artifacts.merge.is_some());
    }
}
