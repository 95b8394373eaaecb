//! Typed event stream emitted by an orchestration run.
//!
//! Events are fire-and-forget: a dropped receiver never affects the run.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::{GraphId, NodeId};
use crate::guard::StallReason;
use crate::lane::{Actor, FileRegion, Lane, LaneId, LaneStatus};
use crate::orchestration::RunId;
use crate::{llog_debug, Result};

/// Events emitted by the orchestrator for run, lane and merge lifecycle changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    RunStarted {
        run_id: RunId,
        goal: String,
    },
    GraphCreated {
        graph_id: GraphId,
        nodes: usize,
        /// The single-node fallback was used instead of the planner's graph.
        fallback: bool,
    },
    LaneStarted {
        lane_id: LaneId,
        node_id: NodeId,
    },
    LaneStatusChanged {
        lane_id: LaneId,
        from: LaneStatus,
        to: LaneStatus,
        actor: Actor,
        reason: String,
    },
    VerificationResult {
        lane_id: LaneId,
        attempt: u32,
        passed: bool,
        issues: Vec<String>,
        criteria_met: u32,
    },
    ReworkTriggered {
        lane_id: LaneId,
        attempt: u32,
        feedback: String,
    },
    QualityGateResult {
        lane_id: LaneId,
        passed: bool,
        score: f64,
    },
    ConsensusResult {
        lane_id: LaneId,
        approved: bool,
        approvals: usize,
        quorum: usize,
    },
    MergeStarted {
        lane_id: LaneId,
    },
    MergeConflict {
        lane_id: LaneId,
        conflicting_lane: LaneId,
        region: FileRegion,
    },
    MergeComplete {
        lane_id: LaneId,
        node_id: NodeId,
        merge_seq: u64,
    },
    ReconciliationQueued {
        stale_lane: LaneId,
        new_lane: LaneId,
        node_id: NodeId,
    },
    BudgetWarning {
        ratio: f64,
        tokens_used: u64,
    },
    StallWarning {
        reason: StallReason,
    },
    NodesBlocked {
        nodes: Vec<NodeId>,
        reason: String,
    },
    RunComplete {
        success: bool,
        completed: usize,
        failed: usize,
        blocked: usize,
    },
    RunError {
        message: String,
    },
}

impl OrchestratorEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorEvent::RunStarted { .. } => "run_started",
            OrchestratorEvent::GraphCreated { .. } => "graph_created",
            OrchestratorEvent::LaneStarted { .. } => "lane_started",
            OrchestratorEvent::LaneStatusChanged { .. } => "lane_status_changed",
            OrchestratorEvent::VerificationResult { .. } => "verification_result",
            OrchestratorEvent::ReworkTriggered { .. } => "rework_triggered",
            OrchestratorEvent::QualityGateResult { .. } => "quality_gate_result",
            OrchestratorEvent::ConsensusResult { .. } => "consensus_result",
            OrchestratorEvent::MergeStarted { .. } => "merge_started",
            OrchestratorEvent::MergeConflict { .. } => "merge_conflict",
            OrchestratorEvent::MergeComplete { .. } => "merge_complete",
            OrchestratorEvent::ReconciliationQueued { .. } => "reconciliation_queued",
            OrchestratorEvent::BudgetWarning { .. } => "budget_warning",
            OrchestratorEvent::StallWarning { .. } => "stall_warning",
            OrchestratorEvent::NodesBlocked { .. } => "nodes_blocked",
            OrchestratorEvent::RunComplete { .. } => "run_complete",
            OrchestratorEvent::RunError { .. } => "run_error",
        }
    }
}

/// Sending half of the event stream. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
}

impl EventSink {
    /// A sink that only logs.
    pub fn silent() -> Self {
        Self { tx: None }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: OrchestratorEvent) {
        llog_debug!(
            "event {}: {}",
            event.kind(),
            serde_json::to_string(&event).unwrap_or_default()
        );
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    /// Apply a lane transition and report it.
    pub fn advance(
        &self,
        lane: &mut Lane,
        target: LaneStatus,
        actor: Actor,
        reason: &str,
    ) -> Result<()> {
        let from = lane.status;
        lane.advance(target, actor, reason)?;
        self.emit(OrchestratorEvent::LaneStatusChanged {
            lane_id: lane.lane_id.clone(),
            from,
            to: target,
            actor,
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(OrchestratorEvent::MergeStarted {
            lane_id: LaneId::from("lane-1"),
        });
        sink.emit(OrchestratorEvent::RunError {
            message: "boom".to_string(),
        });
        assert_eq!(rx.try_recv().unwrap().kind(), "merge_started");
        assert_eq!(rx.try_recv().unwrap().kind(), "run_error");
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(OrchestratorEvent::RunError {
            message: "nobody listening".to_string(),
        });
        EventSink::silent().emit(OrchestratorEvent::RunError {
            message: "x".to_string(),
        });
    }

    #[test]
    fn test_advance_reports_transition() {
        let (sink, mut rx) = EventSink::channel();
        let mut lane = Lane::new(LaneId::from("lane-1"), "a".into(), 3);
        sink.advance(&mut lane, LaneStatus::Provisioning, Actor::System, "start")
            .unwrap();
        match rx.try_recv().unwrap() {
            OrchestratorEvent::LaneStatusChanged { from, to, .. } => {
                assert_eq!(from, LaneStatus::Queued);
                assert_eq!(to, LaneStatus::Provisioning);
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert!(sink
            .advance(&mut lane, LaneStatus::Merged, Actor::System, "skip")
            .is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = OrchestratorEvent::GraphCreated {
            graph_id: GraphId::new(),
            nodes: 3,
            fallback: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "graph_created");
        assert_eq!(json["fallback"], true);
    }
}
