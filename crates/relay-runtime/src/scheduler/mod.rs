//! Scheduler: cadence-driven dispatch of due schedules
//!
//! The backend controls WHEN ticks happen; the service controls WHAT happens
//! on each tick. Swapping the single-process tokio backend for a distributed
//! one changes no schedule definitions or dispatch logic.

mod backend;
mod service;

pub use backend::{BackendHealth, SchedulerBackend, SchedulerError, TickFn, TokioSchedulerBackend};
pub use service::{SchedulerService, TickSummary};
