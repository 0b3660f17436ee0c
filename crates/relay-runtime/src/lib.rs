//! # Relay Runtime
//!
//! The execution services of the Relay core, wired over `relay-core` types
//! and the `relay-storage` ledger:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                           │
//! │   (validate → create run → enqueue → record → return id)    │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//! ┌────────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │ LocalExecutor  │  │  WorkflowRunner  │  │ SchedulerService │
//! │ (lane workers) │  │ (step evaluation)│  │ (tick + leases)  │
//! └────────────────┘  └──────────────────┘  └──────────────────┘
//!          │                    │                     │
//!          └────────────────────┴─────────────────────┘
//!                               ▼
//!                     Ledger + Event Bus
//! ```
//!
//! Also here: the concurrency guard, the dead-letter service with its
//! auto-retry sweeper, watermark/backfill services, and the source fetch
//! layer.

pub mod dispatcher;
pub mod dlq;
pub mod executor;
pub mod fetch;
pub mod guard;
pub mod runner;
pub mod scheduler;
pub mod telemetry;
pub mod watermarks;

/// Prelude for common imports
pub mod prelude {
    pub use crate::dispatcher::{DispatchError, Dispatcher};
    pub use crate::dlq::{DeadLetterService, DlqError, RetrySweeper, SweepSummary};
    pub use crate::executor::{Executor, ExecutorError, LocalExecutor};
    pub use crate::fetch::{FetchOutcome, FetchPayload, FetchReport, FetchService, SourceFetcher};
    pub use crate::guard::ConcurrencyGuard;
    pub use crate::runner::{WorkflowRegistrationError, WorkflowRunResult, WorkflowRunner};
    pub use crate::scheduler::{
        BackendHealth, SchedulerBackend, SchedulerService, TickSummary, TokioSchedulerBackend,
    };
    pub use crate::watermarks::{BackfillService, ProgressError, WatermarkService};
}

pub use dispatcher::{DispatchError, Dispatcher};
pub use dlq::{DeadLetterService, DlqError, RetrySweeper, SweepSummary};
pub use executor::{Executor, ExecutorError, LocalExecutor};
pub use fetch::{FetchError, FetchOutcome, FetchPayload, FetchReport, FetchService, SourceFetcher};
pub use guard::ConcurrencyGuard;
pub use runner::{WorkflowRegistrationError, WorkflowRunResult, WorkflowRunner};
pub use scheduler::{
    BackendHealth, SchedulerBackend, SchedulerError, SchedulerService, TickFn, TickSummary,
    TokioSchedulerBackend,
};
pub use telemetry::init_tracing;
pub use watermarks::{BackfillService, ProgressError, WatermarkService};
