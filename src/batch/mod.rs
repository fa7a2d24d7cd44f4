//! Batch execution: a plan of many sessions run under a concurrency
//! bound.

mod plan;
mod scheduler;

pub use plan::{BatchPlan, PlanItem, ResolvedItem};
pub use scheduler::{AbortHandle, BatchOptions, BatchScheduler, BatchSummary};
