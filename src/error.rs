use thiserror::Error;

use crate::lane::LaneId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task graph contains a cycle through node {node}")]
    CyclicGraph { node: String },

    #[error("Lane {lane_id}: invalid transition from {from} to {to} (allowed: {allowed})")]
    InvalidLaneTransition {
        lane_id: LaneId,
        from: String,
        to: String,
        allowed: String,
    },

    #[error("Budget exhausted ({scope}): {used} used + {requested} requested exceeds cap {cap}")]
    BudgetExhausted {
        scope: String,
        used: u64,
        requested: u64,
        cap: u64,
    },

    #[error("Cost cap reached: ${spent:.4} spent + ${requested:.4} requested exceeds ${cap:.4}")]
    CostCapExceeded { spent: f64, requested: f64, cap: f64 },

    #[error("Cache entry of {size} bytes exceeds budget of {max} bytes")]
    CacheEntryTooLarge { size: usize, max: usize },

    #[error("Schema violation for {tool}: {detail}")]
    SchemaViolation { tool: String, detail: String },

    #[error("Permission denied for {tool}: {reason}")]
    PermissionDenied { tool: String, reason: String },

    #[error("Model call failed ({model}): {message}")]
    ModelCall { model: String, message: String },

    #[error("Tool call failed ({tool}): {message}")]
    ToolCall { tool: String, message: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Model command not found: {0}")]
    BinaryNotFound(String),
}

impl Error {
    /// Whether a failed model or tool call is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ModelCall { .. } | Error::ToolCall { .. } | Error::Timeout(_)
        )
    }

    pub fn is_budget_exhausted(&self) -> bool {
        matches!(
            self,
            Error::BudgetExhausted { .. } | Error::CostCapExceeded { .. }
        )
    }

    /// Errors that end the whole run rather than one attempt.
    pub fn halts_run(&self) -> bool {
        self.is_budget_exhausted() || matches!(self, Error::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
