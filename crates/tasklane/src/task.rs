//! Task lifecycle and cooperative cancellation.
//!
//! A [`Task`] moves `Waiting → Started → Done` exactly once. Cancellation is a
//! separate, idempotent flag: it fires the registered listeners once, in
//! registration order, and leaves it to the running body to observe the flag
//! through [`TaskContext::check_cancelled`] or a [`TaskContext::with`] wait.
//!
//! Listener firing takes a snapshot of the collection under the lock and
//! invokes it outside the lock. A listener registered while the snapshot is
//! firing sees `cancelled == true` and runs synchronously; disposing a
//! listener from inside the loop is a no-op.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tasklane_error::{LaneError, Result};
use tracing::{debug, trace};

use crate::diagnostics::Diagnostics;
use crate::signal::{self, Pending, Resolver, panic_message};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Identity, state, outcome
// ---------------------------------------------------------------------------

/// Process-unique task identifier, for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Monotonic lifecycle state. Ordered so `state >= Started` reads naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskState {
    Waiting,
    Started,
    Done,
}

impl TaskState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Started => "started",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a task ended. Carried by the completion signal, which settles on every
/// termination path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The body returned `Ok(())`.
    Completed,
    /// The body stopped on the cancellation signal, or never ran because the
    /// task was cancelled or discarded before it started.
    Cancelled,
    /// The body failed or panicked. Already reported on the error channel.
    Failed { message: String },
}

impl TaskOutcome {
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Work submitted to a lane. Receives the task's capability handle.
pub type TaskBody = Box<dyn FnOnce(&TaskContext) -> Result<()> + Send>;

type CancelCallback = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// Shared lifecycle core
// ---------------------------------------------------------------------------

struct Lifecycle {
    state: TaskState,
    cancelled: bool,
    listeners: Vec<(u64, CancelCallback)>,
    next_listener: u64,
}

struct TaskCore {
    id: TaskId,
    name: String,
    lifecycle: Mutex<Lifecycle>,
}

impl TaskCore {
    fn state(&self) -> TaskState {
        self.lifecycle.lock().state
    }

    fn is_cancelled(&self) -> bool {
        self.lifecycle.lock().cancelled
    }

    fn register(self: &Arc<Self>, callback: CancelCallback) -> CancelRegistration {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == TaskState::Done {
            return CancelRegistration::inert();
        }
        if lifecycle.cancelled {
            drop(lifecycle);
            callback();
            return CancelRegistration::inert();
        }
        let id = lifecycle.next_listener;
        lifecycle.next_listener += 1;
        lifecycle.listeners.push((id, callback));
        CancelRegistration {
            core: Arc::downgrade(self),
            id: Some(id),
        }
    }

    fn remove_listener(&self, id: u64) -> bool {
        let removed = {
            let mut lifecycle = self.lifecycle.lock();
            let Some(pos) = lifecycle.listeners.iter().position(|(lid, _)| *lid == id) else {
                return false;
            };
            lifecycle.listeners.remove(pos)
        };
        drop(removed);
        true
    }

    fn has_listener(&self, id: u64) -> bool {
        self.lifecycle
            .lock()
            .listeners
            .iter()
            .any(|(lid, _)| *lid == id)
    }

    fn cancel(&self) -> bool {
        let listeners = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.cancelled || lifecycle.state == TaskState::Done {
                return false;
            }
            lifecycle.cancelled = true;
            std::mem::take(&mut lifecycle.listeners)
        };

        debug!(
            task = %self.name,
            id = %self.id,
            listeners = listeners.len(),
            "cancellation requested"
        );

        for (listener, callback) in listeners {
            if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                trace!(task = %self.name, listener, "cancel listener panicked; continuing");
            }
        }
        true
    }

    fn ensure_running(&self) -> Result<()> {
        let state = self.state();
        if state == TaskState::Started {
            Ok(())
        } else {
            Err(LaneError::InvalidState {
                task: self.name.clone(),
                state: state.to_string(),
            })
        }
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.lifecycle.lock().listeners.len()
    }
}

// ---------------------------------------------------------------------------
// Cancellation registration token
// ---------------------------------------------------------------------------

/// Token returned by [`TaskContext::on_cancel`].
///
/// Identifies its listener by id, not by callback identity. Disposal is
/// idempotent: only the first successful `dispose` removes the listener.
#[derive(Debug)]
pub struct CancelRegistration {
    core: Weak<TaskCore>,
    id: Option<u64>,
}

impl CancelRegistration {
    fn inert() -> Self {
        Self {
            core: Weak::new(),
            id: None,
        }
    }

    /// Remove the listener if it has not fired yet. Returns whether this call
    /// removed it.
    pub fn dispose(&self) -> bool {
        let Some(id) = self.id else {
            return false;
        };
        self.core
            .upgrade()
            .is_some_and(|core| core.remove_listener(id))
    }

    /// Whether the listener is still waiting to fire.
    pub fn is_active(&self) -> bool {
        let Some(id) = self.id else {
            return false;
        };
        self.core.upgrade().is_some_and(|core| core.has_listener(id))
    }
}

// ---------------------------------------------------------------------------
// Capability handle passed to bodies
// ---------------------------------------------------------------------------

/// What a running body can see of its own task.
#[derive(Clone)]
pub struct TaskContext {
    core: Arc<TaskCore>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }

    /// Register `callback` to run once when the task is cancelled.
    ///
    /// If the task is already cancelled the callback runs right here, before
    /// this returns, and the returned token is inert.
    pub fn on_cancel<F>(&self, callback: F) -> CancelRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.register(Box::new(callback))
    }

    /// Cooperative checkpoint: `Err(Cancelled)` once cancellation was
    /// requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.core.is_cancelled() {
            Err(LaneError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Make an in-flight sub-operation cancellation-aware.
    ///
    /// The returned signal settles with exactly one of:
    /// - `Err(InvalidState)` when the task is not running,
    /// - `Err(Cancelled)` when the task is or becomes cancelled first,
    /// - `Ok(value)` when `op` settles first.
    ///
    /// Once one of these wins, the others have no observable effect.
    pub fn with<T>(&self, op: Pending<T>) -> Pending<Result<T>>
    where
        T: Clone + Send + 'static,
    {
        if let Err(err) = self.core.ensure_running() {
            return Pending::resolved(Err(err));
        }
        if self.core.is_cancelled() {
            return Pending::resolved(Err(LaneError::Cancelled));
        }

        let (resolver, wrapped) = signal::pending();
        let on_cancel = resolver.clone();
        let registration = self.on_cancel(move || {
            on_cancel.resolve(Err(LaneError::Cancelled));
        });
        op.on_resolve(move |value| {
            if resolver.resolve(Ok(value.clone())) {
                registration.dispose();
            }
        });
        wrapped
    }

    /// Start `f` on its own thread and wait on it through [`Self::with`].
    ///
    /// `f` is never started when the task is not running or already
    /// cancelled. A panic in `f` settles the wait with `Err(Body)`.
    pub fn with_spawned<T, F>(&self, name: impl Into<String>, f: F) -> Pending<Result<T>>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if let Err(err) = self.core.ensure_running() {
            return Pending::resolved(Err(err));
        }
        if self.core.is_cancelled() {
            return Pending::resolved(Err(LaneError::Cancelled));
        }
        let op = match signal::spawn(name, f) {
            Ok(op) => op,
            Err(err) => return Pending::resolved(Err(err)),
        };
        let (resolver, flattened) = signal::pending();
        self.with(op).on_resolve(move |wrapped| {
            resolver.resolve(wrapped.clone().and_then(|inner| inner));
        });
        flattened
    }

    /// Sleep for `duration`, waking early with `Err(Cancelled)` if the task is
    /// cancelled meanwhile.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.check_cancelled()?;
        let (wake, woken) = signal::pending::<()>();
        let registration = self.on_cancel(move || {
            wake.resolve(());
        });
        let interrupted = woken.wait_timeout(duration).is_some();
        registration.dispose();
        if interrupted {
            Err(LaneError::Cancelled)
        } else {
            self.check_cancelled()
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One submitted unit of work plus its cancellation state and completion
/// signal. Owned by the lane that created it until it finishes.
pub struct Task {
    core: Arc<TaskCore>,
    lane: String,
    body: Mutex<Option<TaskBody>>,
    completion: Resolver<TaskOutcome>,
    finished: Pending<TaskOutcome>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = self.core.lifecycle.lock();
        f.debug_struct("Task")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("lane", &self.lane)
            .field("state", &lifecycle.state)
            .field("cancelled", &lifecycle.cancelled)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn new(
        lane: impl Into<String>,
        name: impl Into<String>,
        body: TaskBody,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self {
        let (completion, finished) = signal::pending();
        Self {
            core: Arc::new(TaskCore {
                id: TaskId::next(),
                name: name.into(),
                lifecycle: Mutex::new(Lifecycle {
                    state: TaskState::Waiting,
                    cancelled: false,
                    listeners: Vec::new(),
                    next_listener: 0,
                }),
            }),
            lane: lane.into(),
            body: Mutex::new(Some(body)),
            completion,
            finished,
            diagnostics,
        }
    }

    pub fn id(&self) -> TaskId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }

    /// Signal that settles when this task finishes, however it finishes.
    pub fn completion(&self) -> Pending<TaskOutcome> {
        self.finished.clone()
    }

    /// The capability handle the body receives.
    pub fn context(&self) -> TaskContext {
        TaskContext {
            core: Arc::clone(&self.core),
        }
    }

    /// Request cancellation. Returns `false` if it was already requested or
    /// the task has finished; a finished task's outcome never changes.
    pub fn cancel(&self) -> bool {
        self.core.cancel()
    }

    /// Run the task to completion on the calling thread.
    ///
    /// Fails with `AlreadyStarted` on a second call; the body never runs
    /// twice.
    pub fn play(&self) -> Result<TaskOutcome> {
        self.start()?;
        Ok(self.run())
    }

    /// `Waiting → Started`. Lanes call this under their own lock so that a
    /// submission to an idle lane is started before `submit` returns.
    pub(crate) fn start(&self) -> Result<()> {
        let mut lifecycle = self.core.lifecycle.lock();
        if lifecycle.state >= TaskState::Started {
            return Err(LaneError::AlreadyStarted {
                task: self.core.name.clone(),
            });
        }
        lifecycle.state = TaskState::Started;
        Ok(())
    }

    /// Execute the body of a started task and settle the completion signal.
    pub(crate) fn run(&self) -> TaskOutcome {
        if self.core.is_cancelled() {
            self.diagnostics.verbose(
                &self.lane,
                &format!("'{}' cancelled before it started; skipping", self.core.name),
            );
            return self.finish(TaskOutcome::Cancelled);
        }
        let Some(body) = self.body.lock().take() else {
            return self.finish(TaskOutcome::Completed);
        };

        self.diagnostics
            .verbose(&self.lane, &format!("started '{}'", self.core.name));
        let context = self.context();
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| body(&context))) {
            Ok(Ok(())) => TaskOutcome::Completed,
            Ok(Err(LaneError::Cancelled)) => TaskOutcome::Cancelled,
            Ok(Err(err)) => self.report_failure(&err),
            Err(payload) => {
                let err = LaneError::body(format!("panicked: {}", panic_message(&*payload)));
                self.report_failure(&err)
            }
        };
        self.finish(outcome)
    }

    /// Finish a task that never started, without running its body or its
    /// cancellation listeners. Returns `false` if it had already started.
    pub(crate) fn discard(&self) -> bool {
        {
            let mut lifecycle = self.core.lifecycle.lock();
            if lifecycle.state != TaskState::Waiting {
                return false;
            }
            lifecycle.state = TaskState::Done;
            drop(self.body.lock().take());
        }
        self.completion.resolve(TaskOutcome::Cancelled);
        true
    }

    /// Finish a started task whose body could not be executed.
    pub(crate) fn abandon(&self, err: &LaneError) -> TaskOutcome {
        drop(self.body.lock().take());
        let outcome = self.report_failure(err);
        self.finish(outcome)
    }

    fn report_failure(&self, err: &LaneError) -> TaskOutcome {
        self.diagnostics.error(&self.lane, &self.core.name, err);
        TaskOutcome::Failed {
            message: err.to_string(),
        }
    }

    fn finish(&self, outcome: TaskOutcome) -> TaskOutcome {
        let stale = {
            let mut lifecycle = self.core.lifecycle.lock();
            lifecycle.state = TaskState::Done;
            std::mem::take(&mut lifecycle.listeners)
        };
        drop(stale);

        trace!(
            lane = %self.lane,
            task = %self.core.name,
            id = %self.core.id,
            outcome = ?outcome,
            "task finished"
        );
        self.completion.resolve(outcome.clone());
        outcome
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.core.listener_count()
    }
}
