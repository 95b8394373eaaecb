//! Merge arbiter: conflict detection, integration checks, atomic merge.
//!
//! The arbiter only ever sees lanes the orchestrator hands it in VERIFIED
//! state, one at a time and strictly after a batch has resolved, so no two
//! lanes with overlapping regions can both reach MERGED.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::MergeConfig;
use crate::core::TaskGraph;
use crate::guard::Role;
use crate::lane::{Actor, FileRegion, Lane, LaneId, LaneRegistry, LaneStatus};
use crate::orchestration::events::{EventSink, OrchestratorEvent};
use crate::orchestration::tools::{Caller, ToolCall, ToolName, ToolOutcome, ToolRunner};
use crate::{llog, llog_warn, Error, Result};

const ARBITER_AGENT: &str = "merge-arbiter";

/// Metadata stored on a lane when it merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRecord {
    pub merge_seq: u64,
    pub merged_at: DateTime<Utc>,
    /// Build check result, when a build command is configured.
    pub build: Option<ToolOutcome>,
    /// Lint result; a failure here is recorded but never blocks.
    pub lint: Option<ToolOutcome>,
}

impl MergeRecord {
    pub fn lint_clean(&self) -> bool {
        self.lint.as_ref().map_or(true, |l| l.success)
    }
}

/// Result of one merge attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The lane merged and its node is complete.
    Merged { merge_seq: u64 },
    /// Level 1 found an overlapping region; the lane is in MERGE_CONFLICT.
    Conflict {
        /// Lane whose region overlaps.
        with: LaneId,
        /// The candidate's overlapping region.
        region: FileRegion,
    },
    /// Level 2 build check failed; the lane is in REJECTED.
    Rejected { reason: String },
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, Self::Merged { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Level 1: the first lane whose touched regions overlap `candidate`'s.
///
/// A MERGED lane only counts when it merged after the candidate was
/// provisioned; earlier merges were already visible to the candidate's
/// worker. A VERIFIED lane only counts when it sits ahead of the
/// candidate in the merge queue.
pub fn find_conflict(lanes: &[Lane], candidate: &Lane) -> Option<(LaneId, FileRegion)> {
    lanes
        .iter()
        .filter(|other| other.lane_id != candidate.lane_id)
        .filter(|other| match other.status {
            LaneStatus::Merged => other
                .merge_seq
                .is_some_and(|seq| seq > candidate.base_merge_seq),
            LaneStatus::Verified => match (other.verified_seq, candidate.verified_seq) {
                (Some(theirs), Some(ours)) => theirs < ours,
                _ => false,
            },
            _ => false,
        })
        .find_map(|other| {
            candidate
                .conflict_with(other)
                .map(|(mine, _)| (other.lane_id.clone(), mine))
        })
}

/// Runs the three merge levels for verified lanes.
pub struct MergeArbiter<'a> {
    tools: &'a ToolRunner,
    config: &'a MergeConfig,
    events: &'a EventSink,
    session_id: &'a str,
}

impl<'a> MergeArbiter<'a> {
    pub fn new(
        tools: &'a ToolRunner,
        config: &'a MergeConfig,
        events: &'a EventSink,
        session_id: &'a str,
    ) -> Self {
        Self {
            tools,
            config,
            events,
            session_id,
        }
    }

    fn caller(&self) -> Caller<'a> {
        Caller {
            session_id: self.session_id,
            agent_id: ARBITER_AGENT,
            role: Role::Operator,
        }
    }

    /// Merge `lane_id`, which must be VERIFIED.
    ///
    /// # Errors
    /// `Validation` when the lane is unknown or not VERIFIED.
    pub async fn merge(
        &self,
        registry: &mut LaneRegistry,
        graph: &mut TaskGraph,
        lane_id: &LaneId,
    ) -> Result<MergeOutcome> {
        let candidate = registry
            .get(lane_id)
            .ok_or_else(|| Error::Validation(format!("lane {} not found", lane_id)))?;
        if candidate.status != LaneStatus::Verified {
            return Err(Error::Validation(format!(
                "lane {} is {}, only VERIFIED lanes can merge",
                lane_id, candidate.status
            )));
        }
        self.events.emit(OrchestratorEvent::MergeStarted {
            lane_id: lane_id.clone(),
        });

        // Level 1
        if let Some((with, region)) = find_conflict(registry.lanes(), candidate) {
            llog_warn!("lane {} conflicts with {} on {}", lane_id, with, region);
            let lane = registry.require_mut(lane_id)?;
            self.events.advance(
                lane,
                LaneStatus::MergeConflict,
                Actor::MergeArbiter,
                &format!("{} overlaps lane {}", region, with),
            )?;
            self.events.emit(OrchestratorEvent::MergeConflict {
                lane_id: lane_id.clone(),
                conflicting_lane: with.clone(),
                region: region.clone(),
            });
            return Ok(MergeOutcome::Conflict { with, region });
        }

        // Level 2
        let build = match &self.config.build_command {
            Some(command) => {
                let call = ToolCall::new(ToolName::RunCommand, json!({ "command": command }));
                Some(self.tools.run(&self.caller(), &call).await.outcome)
            }
            None => None,
        };
        if let Some(outcome) = build.as_ref().filter(|b| !b.success) {
            let reason = format!(
                "build failed: {}",
                outcome.error.as_deref().unwrap_or(outcome.output.as_str())
            );
            let lane = registry.require_mut(lane_id)?;
            self.events
                .advance(lane, LaneStatus::Rejected, Actor::MergeArbiter, &reason)?;
            return Ok(MergeOutcome::Rejected { reason });
        }

        let lint = if self.config.lint {
            let call = ToolCall::new(ToolName::LintCheck, json!({}));
            let outcome = self.tools.run(&self.caller(), &call).await.outcome;
            if !outcome.success {
                llog_warn!(
                    "lint failed for lane {}: {}",
                    lane_id,
                    outcome.error.as_deref().unwrap_or("")
                );
            }
            Some(outcome)
        } else {
            None
        };

        // Level 3
        let merge_seq = registry.next_merge_seq();
        let lane = registry.require_mut(lane_id)?;
        let node_id = lane.node_id.clone();
        lane.merge_seq = Some(merge_seq);
        lane.artifacts.merge = Some(MergeRecord {
            merge_seq,
            merged_at: Utc::now(),
            build,
            lint,
        });
        self.events.advance(
            lane,
            LaneStatus::Merged,
            Actor::MergeArbiter,
            &format!("merge #{}", merge_seq),
        )?;
        graph.complete(&node_id, lane_id)?;

        llog!("merged lane {} for {} as #{}", lane_id, node_id, merge_seq);
        self.events.emit(OrchestratorEvent::MergeComplete {
            lane_id: lane_id.clone(),
            node_id,
            merge_seq,
        });
        Ok(MergeOutcome::Merged { merge_seq })
    }
}
