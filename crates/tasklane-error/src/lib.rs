//! Error taxonomy shared by every tasklane crate.
//!
//! `Cancelled` is not a failure: it is the cooperative-termination signal a
//! task body raises (via `check_cancelled()` or a cancelled `with(...)` wait)
//! and the lane swallows. The precondition variants (`AlreadyStarted`,
//! `InvalidState`, `Busy`) surface to whichever call violated them.

use thiserror::Error;

/// Primary error type for lanes, tasks, and lane configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaneError {
    /// Cooperative cancellation was observed. Expected, not a failure.
    #[error("task cancelled")]
    Cancelled,

    /// A task's execution protocol was invoked more than once.
    #[error("task '{task}' has already been started")]
    AlreadyStarted { task: String },

    /// `with(...)` was called outside the task's running window.
    #[error("task '{task}' is {state}; cancellable waits require a running task")]
    InvalidState { task: String, state: String },

    /// The lane is occupied and the caller asked not to queue.
    #[error("lane is busy running '{task}'")]
    Busy { task: String },

    /// A task body failed with something other than cancellation.
    #[error("task body failed: {0}")]
    Body(String),

    /// The lane could not start a worker thread.
    #[error("failed to spawn lane worker: {0}")]
    Spawn(String),

    /// Lane configuration was rejected.
    #[error("invalid lane configuration: {0}")]
    Config(String),
}

impl LaneError {
    /// Build a body failure from any displayable message.
    pub fn body(msg: impl Into<String>) -> Self {
        Self::Body(msg.into())
    }

    /// Whether this is the cooperative cancellation signal.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error reports a violated precondition rather than an
    /// outcome of running work.
    pub const fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::AlreadyStarted { .. } | Self::InvalidState { .. } | Self::Busy { .. }
        )
    }
}

/// Result type alias using [`LaneError`].
pub type Result<T> = std::result::Result<T, LaneError>;
