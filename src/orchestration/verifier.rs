//! Verification, the per-node quality gate and the run review.

use serde::{Deserialize, Serialize};

use crate::config::QualityGateConfig;
use crate::core::{RiskLevel, TaskGraph, TaskNode};
use crate::decode::{decode_json, Decoded};
use crate::lane::LaneMetrics;
use crate::orchestration::model::{ChatMessage, ModelGateway};
use crate::orchestration::tools::ToolRecord;
use crate::orchestration::worker::{describe_node, WorkerArtifact};
use crate::util::truncate;
use crate::{llog_debug, llog_warn, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictKind {
    Pass,
    Fail,
}

/// Verifier report for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub verdict: VerdictKind,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub criteria_met: u32,
}

impl Verdict {
    pub fn pass(criteria_met: u32) -> Self {
        Self {
            verdict: VerdictKind::Pass,
            issues: Vec::new(),
            suggestions: Vec::new(),
            criteria_met,
        }
    }

    pub fn fail(issue: impl Into<String>) -> Self {
        Self {
            verdict: VerdictKind::Fail,
            issues: vec![issue.into()],
            suggestions: Vec::new(),
            criteria_met: 0,
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == VerdictKind::Pass
    }

    /// Rework notes appended to the node description for the next attempt.
    pub fn feedback(&self) -> String {
        let mut out = String::from("Previous attempt was rejected.");
        if !self.issues.is_empty() {
            out.push_str("\nIssues:");
            for issue in &self.issues {
                out.push_str(&format!("\n- {}", issue));
            }
        }
        if !self.suggestions.is_empty() {
            out.push_str("\nSuggestions:");
            for suggestion in &self.suggestions {
                out.push_str(&format!("\n- {}", suggestion));
            }
        }
        out
    }
}

const VERIFIER_SYSTEM: &str = "You verify one subtask against its acceptance criteria. \
Reply with JSON only: {\"verdict\": \"pass\"|\"fail\", \"issues\": [string], \
\"suggestions\": [string], \"criteriaMet\": number}.";

fn tool_summary(tool_results: &[ToolRecord]) -> String {
    if tool_results.is_empty() {
        return "No tool calls.".to_string();
    }
    tool_results
        .iter()
        .map(|r| {
            let detail = if r.outcome.success {
                truncate(&r.outcome.output, 300)
            } else {
                r.outcome.error.as_deref().unwrap_or("failed")
            };
            let status = if r.outcome.success { "ok" } else { "failed" };
            format!("- {} {} [{}]: {}", r.tool, r.args, status, detail)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Check `artifact` against the node's acceptance criteria.
///
/// A worker error fails locally without a model call. An unparseable or
/// failed verifier reply fails the attempt.
pub async fn verify(
    gateway: &ModelGateway,
    model: &str,
    node: &TaskNode,
    artifact: &WorkerArtifact,
    tool_results: &[ToolRecord],
    metrics: &mut LaneMetrics,
) -> Result<Verdict> {
    if let Some(error) = &artifact.error {
        return Ok(Verdict::fail(format!("worker call failed: {}", error)));
    }

    let messages = [
        ChatMessage::system(VERIFIER_SYSTEM),
        ChatMessage::user(format!(
            "{}\nWorker summary:\n{}\n\nTool results:\n{}",
            describe_node(node),
            artifact.summary,
            tool_summary(tool_results)
        )),
    ];
    let reply = match gateway.call(model, &messages).await {
        Ok(reply) => reply,
        Err(e) if e.halts_run() => return Err(e),
        Err(e) => {
            llog_warn!("verifier call for {} failed: {}", node.id, e);
            return Ok(Verdict::fail(format!("verifier unavailable: {}", e)));
        }
    };
    metrics.add_usage(&reply.receipt);

    let decoded = decode_json(&reply.content, || {
        Verdict::fail("verifier reply could not be parsed")
    });
    if decoded.is_fallback() {
        llog_warn!("verifier reply for {} unparseable", node.id);
    }
    let mut verdict = decoded.into_inner();
    let total = node.acceptance_criteria.len() as u32;
    if total > 0 {
        verdict.criteria_met = verdict.criteria_met.min(total);
    }
    llog_debug!(
        "verdict for {}: {:?} ({} issues)",
        node.id,
        verdict.verdict,
        verdict.issues.len()
    );
    Ok(verdict)
}

/// Holistic pass/fail plus a 0-10 score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    pub passed: bool,
    pub score: f64,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl QualityReport {
    fn passing(note: &str) -> Self {
        Self {
            passed: true,
            score: 10.0,
            notes: vec![note.to_string()],
        }
    }
}

/// Nodes at or above the complexity threshold, or at high risk, are judged.
pub fn needs_quality_gate(node: &TaskNode, config: &QualityGateConfig) -> bool {
    config.enabled
        && (node.effective_complexity() >= config.complexity_threshold
            || node.risk_level >= RiskLevel::High)
}

const JUDGE_SYSTEM: &str = "You are a strict reviewer judging finished work as a whole. \
Reply with JSON only: {\"passed\": bool, \"score\": number 0-10, \"notes\": [string]}.";

/// Judge a verified artifact. A judge that cannot answer does not block the
/// lane: verification already passed.
pub async fn quality_gate(
    gateway: &ModelGateway,
    model: &str,
    config: &QualityGateConfig,
    node: &TaskNode,
    artifact: &WorkerArtifact,
    metrics: &mut LaneMetrics,
) -> Result<QualityReport> {
    let messages = [
        ChatMessage::system(JUDGE_SYSTEM),
        ChatMessage::user(format!(
            "{}\nVerified work:\n{}",
            describe_node(node),
            artifact.summary
        )),
    ];
    let reply = match gateway.call(model, &messages).await {
        Ok(reply) => reply,
        Err(e) if e.halts_run() => return Err(e),
        Err(e) => {
            llog_warn!("quality gate for {} unavailable: {}", node.id, e);
            return Ok(QualityReport::passing("judge unavailable"));
        }
    };
    metrics.add_usage(&reply.receipt);

    let mut report = match decode_json(&reply.content, || QualityReport::passing("")) {
        Decoded::Parsed(report) => report,
        Decoded::Fallback(_) => QualityReport::passing("judge reply could not be parsed"),
    };
    report.score = report.score.clamp(0.0, 10.0);
    report.passed = report.passed && report.score >= config.min_score;
    Ok(report)
}

/// Review the whole run once every node has resolved.
///
/// Fallback: pass iff every node completed, scored by completion ratio.
pub async fn review_run(gateway: &ModelGateway, model: &str, graph: &TaskGraph) -> Result<QualityReport> {
    let completed = graph.count_where(|s| matches!(s, crate::core::NodeStatus::Complete));
    let total = graph.len().max(1);
    let fallback = || QualityReport {
        passed: completed == graph.len(),
        score: 10.0 * completed as f64 / total as f64,
        notes: vec![format!("{}/{} nodes completed", completed, graph.len())],
    };

    let outline = graph
        .nodes()
        .map(|n| format!("- [{}] {}: {}", n.status, n.id, n.title))
        .collect::<Vec<_>>()
        .join("\n");
    let messages = [
        ChatMessage::system(JUDGE_SYSTEM),
        ChatMessage::user(format!(
            "Goal:\n{}\n\nSubtasks:\n{}\n\nCheck the completed set for coverage of the goal, \
             consistency between subtasks and missing tests or docs.",
            graph.goal(),
            outline
        )),
    ];
    let reply = match gateway.call(model, &messages).await {
        Ok(reply) => reply,
        Err(e) if e.halts_run() => return Err(e),
        Err(e) => {
            llog_warn!("run review unavailable: {}", e);
            return Ok(fallback());
        }
    };
    let mut report = decode_json(&reply.content, fallback).into_inner();
    report.score = report.score.clamp(0.0, 10.0);
    Ok(report)
}
