//! Integration test suite for lanes.
//!
//! These tests drive whole runs, from goal to merged result, through a
//! scripted model and in-memory tool executors. No model or shell command is
//! ever invoked, so the suite is safe to run in CI.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Goal decomposition and full runs
//! - `parallel_lanes`: Concurrency bounds and merge ordering
//! - `conflict_resolution`: Merge conflicts and reconciliation lanes
//! - `recovery`: Rework, circuit breaker, budget and cancellation
//! - `tool_calls`: Direct and translated tool calls, stall halts

mod fixtures;

mod conflict_resolution;
mod parallel_lanes;
mod recovery;
mod tool_calls;
mod workflow_e2e;
