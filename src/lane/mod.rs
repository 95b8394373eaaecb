//! Lanes: execution records for dispatched task nodes.
//!
//! A lane carries one node from QUEUED to a terminal status. Every status
//! change goes through the transition table in [`status`] and leaves an
//! [`AuditEntry`] behind.

pub mod record;
pub mod registry;
pub mod status;

pub use record::{FileRegion, Lane, LaneArtifacts, LaneId, LaneMetrics};
pub use registry::LaneRegistry;
pub use status::{transition, Actor, AuditEntry, LaneStatus};
