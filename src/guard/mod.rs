//! Run guards: budget caps, stall detection, tool permissions and the read cache.

pub mod budget;
pub mod cache;
pub mod permission;
pub mod stall;

pub use budget::{BudgetSnapshot, BudgetTracker, UsageReceipt};
pub use cache::TtlCache;
pub use permission::{PermissionDecision, PermissionGate, PermissionRecord, Role};
pub use stall::{CircuitBreaker, StallDetector, StallReason, StepKind};
