//! Worker stage: one model call that proposes a solution for a node.
//!
//! Workers never touch lane status. They return a [`WorkerArtifact`] and the
//! orchestrator drives transitions from it. Call failures other than budget
//! exhaustion and cancellation become an artifact with `error` set, so they
//! count against the lane's rework budget instead of aborting the run.

use serde::{Deserialize, Serialize};

use crate::config::ModelsConfig;
use crate::core::{RiskLevel, TaskNode, TaskType};
use crate::decode::{decode_json, Decoded};
use crate::lane::{FileRegion, LaneMetrics};
use crate::orchestration::model::{ChatMessage, ModelGateway};
use crate::orchestration::tools::{RawToolCall, ToolName};
use crate::util::truncate;
use crate::{llog_debug, llog_warn, Error, Result};

/// Complexity at which a node is routed to the strong model.
pub const STRONG_COMPLEXITY: u8 = 7;

/// Persona a worker call runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    /// Implements code, tests, docs and config changes.
    Coder,
    /// Gathers information; used for research nodes.
    Scout,
    /// Escalation role for rework attempts.
    Architect,
}

impl WorkerRole {
    pub fn for_task(task_type: TaskType) -> Self {
        match task_type {
            TaskType::Research => WorkerRole::Scout,
            _ => WorkerRole::Coder,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerRole::Coder => "coder",
            WorkerRole::Scout => "scout",
            WorkerRole::Architect => "architect",
        }
    }

    fn brief(self) -> &'static str {
        match self {
            WorkerRole::Coder => "You are a careful software engineer implementing one subtask.",
            WorkerRole::Scout => "You are a research scout gathering the facts one subtask needs.",
            WorkerRole::Architect => {
                "You are a senior architect. A previous attempt at this subtask was \
                 rejected; address every listed issue."
            }
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Model and role chosen for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub model: String,
    pub role: WorkerRole,
}

/// Risk-based routing; every rework attempt escalates to the strong model
/// and the architect role.
pub fn route(node: &TaskNode, attempt: u32, models: &ModelsConfig) -> Route {
    if attempt > 0 {
        return Route {
            model: models.strong.clone(),
            role: WorkerRole::Architect,
        };
    }

    let model = if node.effective_complexity() >= STRONG_COMPLEXITY {
        &models.strong
    } else {
        match node.risk_level {
            RiskLevel::Low => &models.fast,
            RiskLevel::Medium => &models.standard,
            RiskLevel::High | RiskLevel::Critical => &models.strong,
        }
    };
    Route {
        model: model.clone(),
        role: WorkerRole::for_task(node.task_type),
    }
}

/// What a worker produced for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerArtifact {
    pub summary: String,
    #[serde(default)]
    pub files: Vec<FileRegion>,
    #[serde(default)]
    pub tool_calls: Vec<RawToolCall>,
    pub model: String,
    pub role: WorkerRole,
    pub attempt: u32,
    /// Set when the call failed; the artifact then carries no work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerArtifact {
    fn failed(route: &Route, attempt: u32, error: &Error) -> Self {
        Self {
            summary: String::new(),
            files: Vec::new(),
            tool_calls: Vec::new(),
            model: route.model.clone(),
            role: route.role,
            attempt,
            error: Some(error.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Fingerprint used for repeated-output stall detection.
    pub fn signature(&self) -> String {
        match &self.error {
            Some(e) => format!("error:{}", e),
            None => {
                let files: Vec<String> = self.files.iter().map(|f| f.to_string()).collect();
                format!("{}|{}", self.summary.trim(), files.join(","))
            }
        }
    }
}

/// Worker reply as models write it.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WorkerReply {
    summary: String,
    files: Vec<FileRegion>,
    #[serde(alias = "tool_calls")]
    tool_calls: Vec<RawToolCall>,
}

/// Prompt lines describing `node`; shared by every stage that reviews it.
pub fn describe_node(node: &TaskNode) -> String {
    let mut out = format!(
        "Task ID: {}\nTitle: {}\nType: {}\nRisk: {}\n\n{}\n",
        node.id, node.title, node.task_type, node.risk_level, node.description
    );
    if !node.acceptance_criteria.is_empty() {
        out.push_str("\nAcceptance criteria:\n");
        for (i, criterion) in node.acceptance_criteria.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, criterion));
        }
    }
    if !node.relevant_files.is_empty() {
        out.push_str(&format!("\nRelevant files: {}\n", node.relevant_files.join(", ")));
    }
    out
}

fn tool_list(tools: &[ToolName]) -> String {
    tools
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn worker_messages(
    node: &TaskNode,
    route: &Route,
    attempt: u32,
    tools: &[ToolName],
) -> Vec<ChatMessage> {
    let system = format!(
        "{} Reply with JSON only: {{\"summary\": string, \"files\": [{{\"filePath\", \
         \"startLine\", \"endLine\"}}], \"toolCalls\": [{{\"tool\", \"args\"}}]}}. \
         Available tools: {}.",
        route.role.brief(),
        tool_list(tools)
    );
    let user = format!("{}\nAttempt: {}", describe_node(node), attempt + 1);
    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

/// Run attempt `attempt` (0-based) of `node`, offering the worker only
/// `tools`.
///
/// # Errors
/// Only `BudgetExhausted` and `Cancelled`; other failures are folded into
/// the artifact.
pub async fn run_worker(
    gateway: &ModelGateway,
    models: &ModelsConfig,
    node: &TaskNode,
    attempt: u32,
    tools: &[ToolName],
    metrics: &mut LaneMetrics,
) -> Result<WorkerArtifact> {
    let route = route(node, attempt, models);
    llog_debug!(
        "worker {} on {} via {} (attempt {})",
        route.role,
        node.id,
        route.model,
        attempt + 1
    );
    metrics.worker_invocations += 1;

    let reply = match gateway
        .call(&route.model, &worker_messages(node, &route, attempt, tools))
        .await
    {
        Ok(reply) => reply,
        Err(e) if e.halts_run() => return Err(e),
        Err(e) => {
            llog_warn!("worker call for {} failed: {}", node.id, e);
            return Ok(WorkerArtifact::failed(&route, attempt, &e));
        }
    };
    metrics.add_usage(&reply.receipt);

    let parsed = match decode_json(&reply.content, WorkerReply::default) {
        Decoded::Parsed(parsed) => parsed,
        // Unstructured prose still counts as an answer; it simply proposes
        // no file edits or tool calls.
        Decoded::Fallback(_) => WorkerReply {
            summary: truncate(reply.content.trim(), 2000).to_string(),
            ..WorkerReply::default()
        },
    };

    Ok(WorkerArtifact {
        summary: parsed.summary,
        files: parsed.files,
        tool_calls: parsed.tool_calls,
        model: route.model,
        role: route.role,
        attempt,
        error: None,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TranslatorReply {
    #[serde(alias = "tool_calls")]
    tool_calls: Vec<RawToolCall>,
}

/// Translated tool mode: ask the translator model to turn a worker artifact
/// into concrete tool calls.
///
/// An unusable translation yields no calls; the verifier then judges the
/// artifact on its own.
pub async fn translate_tool_calls(
    gateway: &ModelGateway,
    translator: &str,
    node: &TaskNode,
    artifact: &WorkerArtifact,
    metrics: &mut LaneMetrics,
) -> Result<Vec<RawToolCall>> {
    if artifact.is_error() {
        return Ok(Vec::new());
    }
    let proposal = serde_json::to_string_pretty(artifact)?;
    let messages = [
        ChatMessage::system(format!(
            "Convert the proposed change into tool calls. Reply with JSON only: \
             {{\"toolCalls\": [{{\"tool\", \"args\"}}]}}. Available tools: {}.",
            tool_list(&ToolName::ALL)
        )),
        ChatMessage::user(format!("{}\nProposal:\n{}", describe_node(node), proposal)),
    ];

    let reply = match gateway.call(translator, &messages).await {
        Ok(reply) => reply,
        Err(e) if e.halts_run() => return Err(e),
        Err(e) => {
            llog_warn!("translator call for {} failed: {}", node.id, e);
            return Ok(Vec::new());
        }
    };
    metrics.add_usage(&reply.receipt);
    Ok(decode_json(&reply.content, TranslatorReply::default)
        .into_inner()
        .tool_calls)
}
