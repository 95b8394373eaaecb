//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted model that answers every role deterministically
//! - Orchestrators over the dry-run executor or a caller-supplied one
//! - Configs with test model ids and predefined task sets

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use lanes::config::Config;
use lanes::core::{TaskGraph, TaskNode};
use lanes::lane::FileRegion;
use lanes::orchestration::{
    ChatMessage, DryRunExecutor, EventSink, ModelClient, ModelReply, Orchestrator,
    OrchestratorEvent, ToolExecutor,
};
use lanes::Result;

pub const PLANNER: &str = "planner";
pub const WORKER_FAST: &str = "worker-fast";
pub const WORKER_STANDARD: &str = "worker-standard";
pub const WORKER_STRONG: &str = "worker-strong";
pub const VERIFIER: &str = "verifier";
pub const JUDGE: &str = "judge";
pub const TRANSLATOR: &str = "translator";

/// One model invocation as the scripted model saw it.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub model: String,
    pub node: Option<String>,
}

/// Model that answers by role, keyed on the model id it is called with.
///
/// Workers report the file regions registered for their node, the verifier
/// fails a node a configured number of times before passing it, and the
/// planner returns the configured plan (or prose when none is set).
#[derive(Default)]
pub struct ScriptedModel {
    plan: Option<String>,
    regions: HashMap<String, Vec<FileRegion>>,
    proposals: HashMap<String, serde_json::Value>,
    translations: HashMap<String, serde_json::Value>,
    failures: HashMap<String, u32>,
    worker_delay: Duration,
    verdicts: Mutex<HashMap<String, u32>>,
    invocations: Mutex<Vec<Invocation>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, plan: serde_json::Value) -> Self {
        self.plan = Some(plan.to_string());
        self
    }

    /// Planner replies with prose that contains no task graph.
    pub fn with_unusable_plan(mut self) -> Self {
        self.plan = Some("I would split this into a few steps.".to_string());
        self
    }

    pub fn touching(mut self, node: &str, regions: &[FileRegion]) -> Self {
        self.regions.insert(node.to_string(), regions.to_vec());
        self
    }

    /// Workers on `node` propose these tool calls.
    pub fn proposing(mut self, node: &str, calls: serde_json::Value) -> Self {
        self.proposals.insert(node.to_string(), calls);
        self
    }

    /// The translator turns any proposal for `node` into these tool calls.
    pub fn translating(mut self, node: &str, calls: serde_json::Value) -> Self {
        self.translations.insert(node.to_string(), calls);
        self
    }

    /// The verifier rejects `node` this many times before passing it.
    pub fn failing(mut self, node: &str, times: u32) -> Self {
        self.failures.insert(node.to_string(), times);
        self
    }

    pub fn with_worker_delay(mut self, delay: Duration) -> Self {
        self.worker_delay = delay;
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .map(|i| i.clone())
            .unwrap_or_default()
    }

    pub fn calls_to(&self, model: &str) -> usize {
        self.invocations()
            .iter()
            .filter(|i| i.model == model)
            .count()
    }

    pub fn worker_calls_for(&self, node: &str) -> Vec<String> {
        self.invocations()
            .into_iter()
            .filter(|i| i.model.starts_with("worker") && i.node.as_deref() == Some(node))
            .map(|i| i.model)
            .collect()
    }

    /// Most worker calls that were in flight at the same moment.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn worker_reply(&self, model: &str, node: &str, attempt: usize) -> String {
        let files = self.regions.get(node).cloned().unwrap_or_default();
        let calls = self.proposals.get(node).cloned().unwrap_or_else(|| json!([]));
        json!({
            "summary": format!("{} attempt {} by {}", node, attempt, model),
            "files": files,
            "toolCalls": calls,
        })
        .to_string()
    }

    fn verifier_reply(&self, node: &str) -> String {
        let seen = {
            let mut verdicts = match self.verdicts.lock() {
                Ok(v) => v,
                Err(e) => e.into_inner(),
            };
            let count = verdicts.entry(node.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let allowed = self.failures.get(node).copied().unwrap_or(0);
        if seen as u32 <= allowed {
            json!({
                "verdict": "fail",
                "issues": [format!("{} is missing tests (review {})", node, seen)],
                "suggestions": ["add a unit test"],
                "criteriaMet": 0,
            })
            .to_string()
        } else {
            json!({"verdict": "pass", "criteriaMet": 1}).to_string()
        }
    }
}

/// Node id from the `Task ID:` line every stage prompt carries.
fn node_of(messages: &[ChatMessage]) -> Option<String> {
    messages.iter().find_map(|m| {
        m.content
            .lines()
            .find_map(|l| l.strip_prefix("Task ID: "))
            .map(|id| id.trim().to_string())
    })
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn invoke(&self, model: &str, messages: &[ChatMessage]) -> Result<ModelReply> {
        let node = node_of(messages);
        let attempt = {
            let mut invocations = match self.invocations.lock() {
                Ok(i) => i,
                Err(e) => e.into_inner(),
            };
            invocations.push(Invocation {
                model: model.to_string(),
                node: node.clone(),
            });
            invocations
                .iter()
                .filter(|i| i.model.starts_with("worker") && i.node == node)
                .count()
        };

        let content = match model {
            PLANNER => self
                .plan
                .clone()
                .unwrap_or_else(|| "no plan available".to_string()),
            m if m.starts_with("worker") => {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                if !self.worker_delay.is_zero() {
                    tokio::time::sleep(self.worker_delay).await;
                }
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.worker_reply(m, node.as_deref().unwrap_or("?"), attempt)
            }
            VERIFIER => self.verifier_reply(node.as_deref().unwrap_or("?")),
            JUDGE => json!({"passed": true, "score": 8, "notes": "looks complete"}).to_string(),
            TRANSLATOR => {
                let calls = node
                    .as_deref()
                    .and_then(|n| self.translations.get(n).cloned())
                    .unwrap_or_else(|| json!([]));
                json!({ "toolCalls": calls }).to_string()
            }
            _ => json!({"approved": true, "rationale": "fine"}).to_string(),
        };
        Ok(ModelReply::text(content))
    }
}

/// Default config with the scripted model ids.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.models.fast = WORKER_FAST.to_string();
    config.models.standard = WORKER_STANDARD.to_string();
    config.models.strong = WORKER_STRONG.to_string();
    config.models.planner = PLANNER.to_string();
    config.models.verifier = VERIFIER.to_string();
    config.models.judge = JUDGE.to_string();
    config.models.translator = TRANSLATOR.to_string();
    config.retry.max_attempts = 1;
    config
}

/// An orchestrator wired to `model` plus the receiving end of its events.
pub fn orchestrator(
    config: Config,
    model: Arc<ScriptedModel>,
) -> (Orchestrator, mpsc::UnboundedReceiver<OrchestratorEvent>) {
    orchestrator_with(config, model, Arc::new(DryRunExecutor::new()))
}

/// Like [`orchestrator`], with a caller-supplied tool executor.
pub fn orchestrator_with(
    config: Config,
    model: Arc<ScriptedModel>,
    executor: Arc<dyn ToolExecutor>,
) -> (Orchestrator, mpsc::UnboundedReceiver<OrchestratorEvent>) {
    let (events, rx) = EventSink::channel();
    let orchestrator = Orchestrator::new(config, model, executor).with_events(events);
    (orchestrator, rx)
}

/// Everything emitted so far.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn count_kind(events: &[OrchestratorEvent], kind: &str) -> usize {
    events.iter().filter(|e| e.kind() == kind).count()
}

/// Two independent nodes plus one depending on both.
pub fn diamond_graph() -> TaskGraph {
    let nodes = vec![
        TaskNode::new("schema", "Schema", "Add the users table").with_criteria(&["table exists"]),
        TaskNode::new("config", "Config", "Add the feature flag").with_criteria(&["flag read"]),
        TaskNode::new("api", "API", "Expose users over HTTP")
            .with_dependencies(&["schema", "config"])
            .with_criteria(&["endpoint responds"]),
    ];
    match TaskGraph::new("users feature", nodes) {
        Ok(graph) => graph,
        Err(e) => panic!("diamond graph is valid: {}", e),
    }
}

/// `count` nodes without dependencies.
pub fn independent_graph(count: usize) -> TaskGraph {
    let nodes = (0..count)
        .map(|i| TaskNode::new(format!("t{}", i), &format!("Task {}", i), "independent work"))
        .collect();
    match TaskGraph::new("independent work", nodes) {
        Ok(graph) => graph,
        Err(e) => panic!("independent graph is valid: {}", e),
    }
}
