//! Goal decomposition into a task graph.
//!
//! The planner model proposes nodes as JSON. Anything unusable (bad JSON,
//! duplicate ids, unknown dependencies, cycles, a failed call) falls back
//! to the deterministic single-node graph.

use serde::Deserialize;

use crate::config::{DecompositionMode, OrchestratorConfig};
use crate::core::{TaskGraph, TaskNode};
use crate::decode::{decode_json, Decoded};
use crate::guard::UsageReceipt;
use crate::orchestration::model::{ChatMessage, ModelGateway};
use crate::{llog, llog_warn, Result};

const PLANNER_SYSTEM: &str = "You decompose software goals into a dependency graph of subtasks. \
Reply with JSON only: {\"nodes\": [{\"id\", \"title\", \"description\", \"taskType\" \
(code|research|test|docs|config|review), \"riskLevel\" (low|medium|high|critical), \
\"complexity\" (1-10), \"dependencies\": [ids], \"relevantFiles\": [paths], \
\"acceptanceCriteria\": [strings]}]}. Keep nodes independent where possible.";

/// Planner output: either `{"nodes": [...]}` or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlannerOutput {
    Wrapped {
        #[serde(alias = "tasks", alias = "subtasks")]
        nodes: Vec<TaskNode>,
    },
    Bare(Vec<TaskNode>),
}

impl PlannerOutput {
    fn into_nodes(self) -> Vec<TaskNode> {
        match self {
            PlannerOutput::Wrapped { nodes } | PlannerOutput::Bare(nodes) => nodes,
        }
    }
}

/// Result of decomposing one goal.
#[derive(Debug)]
pub struct Decomposition {
    pub graph: TaskGraph,
    /// The single-node graph replaced an unusable planner response.
    pub fallback: bool,
    pub planner_called: bool,
    pub receipt: Option<UsageReceipt>,
}

/// Whether `goal` should go to the planner under `config`.
///
/// In auto mode only short single-step goals skip it: at most
/// `auto_single_node_max_words` words, one line, no sequencing.
pub fn needs_planner(goal: &str, config: &OrchestratorConfig) -> bool {
    match config.decomposition {
        DecompositionMode::Always => true,
        DecompositionMode::Never => false,
        DecompositionMode::Auto => {
            let trimmed = goal.trim();
            let words = trimmed.split_whitespace().count();
            let lower = trimmed.to_lowercase();
            words > config.auto_single_node_max_words
                || trimmed.contains('\n')
                || lower.contains(" then ")
                || lower.contains("; ")
        }
    }
}

/// Build the task graph for `goal`.
///
/// Only budget exhaustion and cancellation propagate; every other planner
/// failure degrades to the single-node graph.
pub async fn decompose(
    gateway: &ModelGateway,
    planner_model: &str,
    config: &OrchestratorConfig,
    goal: &str,
) -> Result<Decomposition> {
    if !needs_planner(goal, config) {
        return Ok(Decomposition {
            graph: TaskGraph::single_node(goal),
            fallback: false,
            planner_called: false,
            receipt: None,
        });
    }

    let messages = [
        ChatMessage::system(PLANNER_SYSTEM),
        ChatMessage::user(format!("Goal:\n{}", goal)),
    ];
    let reply = match gateway.call(planner_model, &messages).await {
        Ok(reply) => reply,
        Err(e) if e.halts_run() => return Err(e),
        Err(e) => {
            llog_warn!("planner call failed, using single-node graph: {}", e);
            return Ok(fallback(goal, None));
        }
    };

    let nodes = match decode_json(&reply.content, || PlannerOutput::Bare(Vec::new())) {
        Decoded::Parsed(output) => output.into_nodes(),
        Decoded::Fallback(_) => {
            llog_warn!("planner reply unparseable, using single-node graph");
            return Ok(fallback(goal, Some(reply.receipt)));
        }
    };

    match TaskGraph::new(goal, nodes) {
        Ok(graph) => {
            llog!("decomposed goal into {} nodes", graph.len());
            Ok(Decomposition {
                graph,
                fallback: false,
                planner_called: true,
                receipt: Some(reply.receipt),
            })
        }
        Err(e) => {
            llog_warn!("planner graph rejected ({}), using single-node graph", e);
            Ok(fallback(goal, Some(reply.receipt)))
        }
    }
}

fn fallback(goal: &str, receipt: Option<UsageReceipt>) -> Decomposition {
    Decomposition {
        graph: TaskGraph::single_node(goal),
        fallback: true,
        planner_called: true,
        receipt,
    }
}
