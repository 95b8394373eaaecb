//! Core domain models for lane orchestration.
//!
//! Task nodes and the dependency graph they form.

pub mod dag;
pub mod task;

pub use dag::{TaskGraph, SINGLE_NODE_ID};
pub use task::{GraphId, NodeId, NodeStatus, RiskLevel, TaskNode, TaskType};
