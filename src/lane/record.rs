//! The lane record: one execution attempt of a task node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::{transition, Actor, AuditEntry, LaneStatus};
use crate::core::NodeId;
use crate::error::Result;
use crate::guard::budget::UsageReceipt;
use crate::orchestration::consensus::ConsensusOutcome;
use crate::orchestration::merge::MergeRecord;
use crate::orchestration::tools::ToolRecord;
use crate::orchestration::verifier::{QualityReport, Verdict};
use crate::orchestration::worker::WorkerArtifact;

/// Globally unique lane identifier: `lane-<sequence>-<random>`.
///
/// The sequence makes ids sort by creation order within a run; the random
/// suffix keeps ids from separate runs apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaneId(String);

impl LaneId {
    pub fn generate(seq: u64) -> Self {
        let random = Uuid::new_v4().simple().to_string();
        Self(format!("lane-{:06}-{}", seq, &random[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LaneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LaneId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A file, or a line range within it, touched by a lane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRegion {
    #[serde(alias = "path")]
    pub file_path: String,
    #[serde(default)]
    pub start_line: Option<u32>,
    #[serde(default)]
    pub end_line: Option<u32>,
}

impl FileRegion {
    pub fn whole_file(path: &str) -> Self {
        Self {
            file_path: path.to_string(),
            start_line: None,
            end_line: None,
        }
    }

    pub fn lines(path: &str, start: u32, end: u32) -> Self {
        Self {
            file_path: path.to_string(),
            start_line: Some(start.min(end)),
            end_line: Some(start.max(end)),
        }
    }

    /// Line bounds, or `None` when the region covers the whole file.
    fn bounds(&self) -> Option<(u32, u32)> {
        match (self.start_line, self.end_line) {
            (Some(s), Some(e)) => Some((s.min(e), s.max(e))),
            _ => None,
        }
    }

    /// Same path, and either side is unbounded or the ranges intersect.
    pub fn overlaps(&self, other: &FileRegion) -> bool {
        if self.file_path != other.file_path {
            return false;
        }
        match (self.bounds(), other.bounds()) {
            (Some((a_start, a_end)), Some((b_start, b_end))) => {
                a_start <= b_end && b_start <= a_end
            }
            _ => true,
        }
    }
}

impl std::fmt::Display for FileRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.bounds() {
            Some((s, e)) => write!(f, "{}:{}-{}", self.file_path, s, e),
            None => write!(f, "{}", self.file_path),
        }
    }
}

/// Outputs collected while the lane runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneArtifacts {
    pub worker: Option<WorkerArtifact>,
    pub verdict: Option<Verdict>,
    #[serde(default)]
    pub tool_results: Vec<ToolRecord>,
    pub quality: Option<QualityReport>,
    pub consensus: Option<ConsensusOutcome>,
    pub merge: Option<MergeRecord>,
}

/// Counters accumulated across every attempt of a lane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub tool_calls: u32,
    pub rework_count: u32,
    pub worker_invocations: u32,
}

impl LaneMetrics {
    pub fn add_usage(&mut self, receipt: &UsageReceipt) {
        self.input_tokens += receipt.input_tokens;
        self.output_tokens += receipt.output_tokens;
        self.cost_usd += receipt.cost_usd;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Execution record for one dispatched attempt at a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lane {
    pub lane_id: LaneId,
    pub node_id: NodeId,
    pub status: LaneStatus,
    pub artifacts: LaneArtifacts,
    pub files_touched: Vec<FileRegion>,
    pub audit_trail: Vec<AuditEntry>,
    pub metrics: LaneMetrics,
    pub failure_count: u32,
    pub max_failures: u32,
    /// Merge sequence number current when the lane was provisioned.
    pub base_merge_seq: u64,
    /// Position in the merge queue, assigned on reaching VERIFIED.
    pub verified_seq: Option<u64>,
    /// Assigned on reaching MERGED.
    pub merge_seq: Option<u64>,
    /// Stale lane this one reconciles, if any.
    pub spawned_from: Option<LaneId>,
    pub created_at: DateTime<Utc>,
}

impl Lane {
    pub fn new(lane_id: LaneId, node_id: NodeId, max_failures: u32) -> Self {
        Self {
            lane_id,
            node_id,
            status: LaneStatus::Queued,
            artifacts: LaneArtifacts::default(),
            files_touched: Vec::new(),
            audit_trail: Vec::new(),
            metrics: LaneMetrics::default(),
            failure_count: 0,
            max_failures: max_failures.max(1),
            base_merge_seq: 0,
            verified_seq: None,
            merge_seq: None,
            spawned_from: None,
            created_at: Utc::now(),
        }
    }

    /// A fresh lane replacing `stale`, which must be PENDING_RECONCILIATION.
    ///
    /// The new lane's history opens with the reconciliation hand-off.
    pub fn reconciliation(lane_id: LaneId, stale: &Lane) -> Result<Self> {
        let entry = transition(
            stale.status,
            LaneStatus::Queued,
            &lane_id,
            Actor::Supervisor,
            &format!("reconciles {}", stale.lane_id),
        )?
        .with_metadata(serde_json::json!({ "spawnedFrom": stale.lane_id }));

        let mut lane = Self::new(lane_id, stale.node_id.clone(), stale.max_failures);
        lane.spawned_from = Some(stale.lane_id.clone());
        lane.audit_trail.push(entry);
        Ok(lane)
    }

    /// Validate and apply a transition, appending its audit entry.
    pub fn advance(&mut self, target: LaneStatus, actor: Actor, reason: &str) -> Result<()> {
        self.advance_with(target, actor, reason, serde_json::Value::Null)
    }

    pub fn advance_with(
        &mut self,
        target: LaneStatus,
        actor: Actor,
        reason: &str,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let entry =
            transition(self.status, target, &self.lane_id, actor, reason)?.with_metadata(metadata);
        crate::llog_debug!(
            "lane {} {} -> {} ({}): {}",
            self.lane_id,
            entry.from_status,
            entry.to_status,
            actor,
            reason
        );
        self.status = target;
        self.audit_trail.push(entry);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether another failed attempt is still allowed.
    pub fn has_attempts_left(&self) -> bool {
        self.failure_count < self.max_failures
    }

    /// Statuses visited, in order, starting with the initial one.
    pub fn status_history(&self) -> Vec<LaneStatus> {
        let mut history = Vec::with_capacity(self.audit_trail.len() + 1);
        match self.audit_trail.first() {
            Some(first) => history.push(first.from_status),
            None => history.push(self.status),
        }
        history.extend(self.audit_trail.iter().map(|e| e.to_status));
        history
    }

    /// First pair of overlapping regions between the two lanes.
    pub fn conflict_with(&self, other: &Lane) -> Option<(FileRegion, FileRegion)> {
        self.files_touched.iter().find_map(|mine| {
            other
                .files_touched
                .iter()
                .find(|theirs| mine.overlaps(theirs))
                .map(|theirs| (mine.clone(), theirs.clone()))
        })
    }
}
