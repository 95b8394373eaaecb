//! Orchestration layer: planning, lane pipelines and the merge arbiter.
//!
//! The [`Orchestrator`] decomposes a goal into a task graph, runs each ready
//! node in its own lane (worker, tool calls, verifier, optional quality gate
//! and consensus) and merges verified lanes serially through the
//! [`MergeArbiter`].

pub mod consensus;
pub mod events;
pub mod merge;
pub mod model;
pub mod planner;
pub mod scheduler;
pub mod tools;
pub mod verifier;
pub mod worker;

pub use consensus::{ConsensusOutcome, Vote};
pub use events::{EventSink, OrchestratorEvent};
pub use merge::{MergeArbiter, MergeOutcome, MergeRecord};
pub use model::{ChatMessage, ChatRole, CommandModel, ModelClient, ModelGateway, ModelReply};
pub use planner::Decomposition;
pub use scheduler::{LaneRun, Orchestrator, RunId, RunResult};
pub use tools::{
    Caller, DryRunExecutor, RawToolCall, ToolCall, ToolExecutor, ToolName, ToolOutcome,
    ToolRecord, ToolRunner,
};
pub use verifier::{QualityReport, Verdict, VerdictKind};
pub use worker::{WorkerArtifact, WorkerRole};
