//! Lane-based parallel orchestration of model-driven workers.
//!
//! A goal is decomposed into a dependency graph of subtasks. Each ready
//! subtask runs in an isolated lane with its own state machine and audit
//! trail; verified lanes are merged one at a time through a tiered conflict
//! check, and stale lanes are re-queued for reconciliation.

pub mod config;
pub mod core;
pub mod decode;
pub mod error;
pub mod guard;
pub mod lane;
pub mod log;
pub mod orchestration;
pub mod util;

pub use error::{Error, Result};
