//! Task node data model for the execution graph.
//!
//! A node is the atomic unit of work produced by decomposition. Its
//! definition (title, criteria, dependencies) is fixed once the graph is
//! built; only `status` and `merged_lane` change, and only through the
//! orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lane::LaneId;

/// Identifier of a node within one task graph.
///
/// Decomposition output names nodes with short strings ("task-1",
/// "schema"), so ids are free-form rather than generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a task graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphId(pub Uuid);

impl GraphId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for GraphId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of work a node asks for. Drives the initial worker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Code,
    Research,
    Test,
    Docs,
    Config,
    Review,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskType::Code => "code",
            TaskType::Research => "research",
            TaskType::Test => "test",
            TaskType::Docs => "docs",
            TaskType::Config => "config",
            TaskType::Review => "review",
        };
        write!(f, "{}", s)
    }
}

/// Risk of a node's change. Ordered from least to most risky.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Complexity assumed when decomposition does not provide one.
    pub fn default_complexity(&self) -> u8 {
        match self {
            RiskLevel::Low => 2,
            RiskLevel::Medium => 5,
            RiskLevel::High => 7,
            RiskLevel::Critical => 9,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Node status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum NodeStatus {
    /// Waiting for dependencies or for a dispatch slot.
    #[default]
    Pending,
    /// A lane is working on this node.
    Dispatched,
    /// A lane for this node merged.
    Complete,
    /// Rework attempts or reconciliations ran out.
    Failed { reason: String },
    /// Never dispatched: the run halted or its dependencies can never resolve.
    Blocked { reason: String },
}

impl NodeStatus {
    /// Complete, failed and blocked nodes never change again.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            NodeStatus::Complete | NodeStatus::Failed { .. } | NodeStatus::Blocked { .. }
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Pending => write!(f, "pending"),
            NodeStatus::Dispatched => write!(f, "dispatched"),
            NodeStatus::Complete => write!(f, "complete"),
            NodeStatus::Failed { reason } => write!(f, "failed: {}", reason),
            NodeStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
        }
    }
}

/// A single subtask in the task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNode {
    pub id: NodeId,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub risk_level: RiskLevel,
    /// Estimated complexity on a 1-10 scale.
    #[serde(default)]
    pub complexity: Option<u8>,
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
    #[serde(default)]
    pub relevant_files: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub status: NodeStatus,
    /// Lane whose merge completed this node.
    #[serde(default)]
    pub merged_lane: Option<LaneId>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl TaskNode {
    /// Create a pending node with default type, medium risk and no edges.
    pub fn new(id: impl Into<String>, title: &str, description: &str) -> Self {
        Self {
            id: NodeId::new(id),
            title: title.to_string(),
            description: description.to_string(),
            task_type: TaskType::default(),
            risk_level: RiskLevel::default(),
            complexity: None,
            dependencies: Vec::new(),
            relevant_files: Vec::new(),
            acceptance_criteria: Vec::new(),
            status: NodeStatus::Pending,
            merged_lane: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| NodeId::from(*d)).collect();
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk_level = risk;
        self
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.complexity = Some(complexity.clamp(1, 10));
        self
    }

    pub fn with_criteria(mut self, criteria: &[&str]) -> Self {
        self.acceptance_criteria = criteria.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_files(mut self, files: &[&str]) -> Self {
        self.relevant_files = files.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Effective complexity: explicit value, else derived from risk.
    pub fn effective_complexity(&self) -> u8 {
        self.complexity
            .unwrap_or_else(|| self.risk_level.default_complexity())
    }

    pub fn is_pending(&self) -> bool {
        self.status == NodeStatus::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.status.is_resolved()
    }

    pub fn is_complete(&self) -> bool {
        self.status == NodeStatus::Complete
    }
}
