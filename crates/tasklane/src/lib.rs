//! Single-lane cooperative task scheduling.
//!
//! A lane ([`Scheduler`]) runs submitted work strictly one task at a time, in
//! submission order. Each running body receives a [`TaskContext`] through
//! which it observes cancellation: `check_cancelled()` at cooperative
//! checkpoints, and `with(...)` around sub-operations that must stop waiting
//! the moment the task is cancelled. [`Scheduler::cancel_all`] cancels the
//! running task and discards everything queued behind it.
//!
//! ```no_run
//! use tasklane::{Scheduler, TaskOutcome};
//!
//! let lane = Scheduler::new("compile");
//! let done = lane.submit("build", |cx| {
//!     for _step in 0..3 {
//!         cx.check_cancelled()?;
//!         let output = cx.with_spawned("compile-step", || 42).wait()?;
//!         assert_eq!(output, 42);
//!     }
//!     Ok(())
//! });
//! assert_eq!(done.wait(), TaskOutcome::Completed);
//! ```

pub mod config;
pub mod diagnostics;
pub mod lanes;
pub mod scheduler;
pub mod signal;
pub mod task;

pub use config::{LaneConfig, LanesConfig};
pub use diagnostics::{Channel, DiagnosticRecord, Diagnostics, MemoryDiagnostics, TracingDiagnostics};
pub use lanes::LaneSet;
pub use scheduler::Scheduler;
pub use signal::{Pending, Resolver};
pub use task::{
    CancelRegistration, Task, TaskBody, TaskContext, TaskId, TaskOutcome, TaskState,
};
pub use tasklane_error::{LaneError, Result};
