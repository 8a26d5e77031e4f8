//! In-memory reconciliation planner.
//!
//! The plan partitions the retention window into contiguous segments and tracks what is
//! known about each one. It performs no I/O: the sync loop queries the stores between
//! planner calls and feeds the results back in. Nothing here is persisted; a restarted
//! process rebuilds the partition from a single dirty segment.

mod pacing;
mod partition;
mod sampler;
mod segment;

pub use pacing::{plan_next_cycle, PacingDecision, PacingInputs};
pub use partition::{ReconciliationPlan, RetentionWindow, SegmentLinks, StatusCounts, DAY_MS};
pub use sampler::PrioritySampler;
pub use segment::{
    format_epoch_millis, MergeRejection, PlanError, Segment, SegmentStatus, TimeWindow,
};
