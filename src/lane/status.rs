//! Lane status and the transition table.
//!
//! [`transition`] is pure: it validates a move against the table and hands
//! back the [`AuditEntry`] to append. Mutation happens in
//! [`Lane::advance`](super::Lane::advance).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::LaneId;
use crate::error::{Error, Result};

/// Status of a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LaneStatus {
    Queued,
    Provisioning,
    Assigned,
    Working,
    PendingVerify,
    Verifying,
    Verified,
    Rejected,
    PendingRework,
    MergeConflict,
    PendingReconciliation,
    Merged,
    Failed,
    Archived,
}

use LaneStatus::*;

impl LaneStatus {
    pub const ALL: [LaneStatus; 14] = [
        Queued,
        Provisioning,
        Assigned,
        Working,
        PendingVerify,
        Verifying,
        Verified,
        Rejected,
        PendingRework,
        MergeConflict,
        PendingReconciliation,
        Merged,
        Failed,
        Archived,
    ];

    /// Statuses reachable from `self` in one step.
    pub fn allowed_targets(self) -> &'static [LaneStatus] {
        match self {
            Queued => &[Provisioning, Failed, Archived],
            Provisioning => &[Assigned, Failed, Archived],
            Assigned => &[Working, Failed, Archived],
            Working => &[PendingVerify, Failed, Archived],
            PendingVerify => &[Verifying, Failed, Archived],
            Verifying => &[Verified, Rejected, Failed, Archived],
            Verified => &[Merged, MergeConflict, Rejected, Failed, Archived],
            Rejected => &[PendingRework, Failed, Archived],
            PendingRework => &[Assigned, Failed, Archived],
            MergeConflict => &[PendingReconciliation, Failed, Archived],
            PendingReconciliation => &[Queued, Failed, Archived],
            Merged => &[Archived],
            Failed => &[Archived],
            Archived => &[],
        }
    }

    pub fn can_transition(self, target: LaneStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Merged, failed and archived lanes accept no further work.
    pub fn is_terminal(self) -> bool {
        matches!(self, Merged | Failed | Archived)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Queued => "QUEUED",
            Provisioning => "PROVISIONING",
            Assigned => "ASSIGNED",
            Working => "WORKING",
            PendingVerify => "PENDING_VERIFY",
            Verifying => "VERIFYING",
            Verified => "VERIFIED",
            Rejected => "REJECTED",
            PendingRework => "PENDING_REWORK",
            MergeConflict => "MERGE_CONFLICT",
            PendingReconciliation => "PENDING_RECONCILIATION",
            Merged => "MERGED",
            Failed => "FAILED",
            Archived => "ARCHIVED",
        }
    }
}

impl std::fmt::Display for LaneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who drove a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Actor {
    Supervisor,
    Worker,
    Verifier,
    MergeArbiter,
    System,
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Actor::Supervisor => "supervisor",
            Actor::Worker => "worker",
            Actor::Verifier => "verifier",
            Actor::MergeArbiter => "merge-arbiter",
            Actor::System => "system",
        };
        write!(f, "{}", s)
    }
}

/// One entry in a lane's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub from_status: LaneStatus,
    pub to_status: LaneStatus,
    pub actor: Actor,
    pub reason: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl AuditEntry {
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Validate `current -> target` for `lane_id` and produce the audit entry.
///
/// # Errors
/// `InvalidLaneTransition` naming the lane and listing the allowed targets.
pub fn transition(
    current: LaneStatus,
    target: LaneStatus,
    lane_id: &LaneId,
    actor: Actor,
    reason: &str,
) -> Result<AuditEntry> {
    if !current.can_transition(target) {
        let allowed = current.allowed_targets();
        let allowed = if allowed.is_empty() {
            "none".to_string()
        } else {
            allowed
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        return Err(Error::InvalidLaneTransition {
            lane_id: lane_id.clone(),
            from: current.to_string(),
            to: target.to_string(),
            allowed,
        });
    }

    Ok(AuditEntry {
        timestamp: Utc::now(),
        from_status: current,
        to_status: target,
        actor,
        reason: reason.to_string(),
        metadata: serde_json::Value::Null,
    })
}
