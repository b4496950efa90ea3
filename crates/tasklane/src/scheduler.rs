//! Lanes: single-flight, FIFO execution of submitted tasks.
//!
//! A [`Scheduler`] owns one lane. At most one task is `Started` at any time;
//! the rest wait in submission order. A lane holds a worker thread only while
//! it is busy: the worker is spawned on the idle→busy transition and drains
//! the queue until it is empty.
//!
//! `current` and the pending queue are only touched under the lane mutex
//! (submit, advance, cancel_all). Cancellation listeners and task bodies
//! always run with the lane mutex released.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tasklane_error::{LaneError, Result};
use tracing::{debug, trace};

use crate::config::LaneConfig;
use crate::diagnostics::{Diagnostics, TracingDiagnostics};
use crate::signal::Pending;
use crate::task::{Task, TaskContext, TaskOutcome};

#[derive(Default)]
struct LaneState {
    current: Option<Arc<Task>>,
    pending: VecDeque<Arc<Task>>,
}

struct Lane {
    config: LaneConfig,
    diagnostics: Arc<dyn Diagnostics>,
    state: Mutex<LaneState>,
    idle: Condvar,
}

impl Lane {
    fn name(&self) -> &str {
        &self.config.name
    }

    /// Move the queue head into `current`, or mark the lane idle.
    fn advance(&self, state: &mut LaneState) -> Option<Arc<Task>> {
        while let Some(next) = state.pending.pop_front() {
            match next.start() {
                Ok(()) => {
                    state.current = Some(Arc::clone(&next));
                    return Some(next);
                }
                Err(err) => self.diagnostics.error(self.name(), next.name(), &err),
            }
        }
        state.current = None;
        self.idle.notify_all();
        None
    }

    /// Hand a started task to a fresh worker thread.
    fn dispatch(self: &Arc<Self>, first: Arc<Task>) {
        let mut task = first;
        loop {
            let mut builder = thread::Builder::new().name(self.config.worker_thread_name());
            if let Some(size) = self.config.worker_stack_size {
                builder = builder.stack_size(size);
            }
            let lane = Arc::clone(self);
            let worker_task = Arc::clone(&task);
            match builder.spawn(move || lane.drive(worker_task)) {
                Ok(_) => return,
                Err(err) => {
                    // Without a worker the task can never run; fail it and
                    // keep the queue moving.
                    task.abandon(&LaneError::Spawn(err.to_string()));
                    let next = {
                        let mut state = self.state.lock();
                        self.advance(&mut state)
                    };
                    match next {
                        Some(next) => task = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Worker loop: run the current task, then advance until the queue is empty.
    fn drive(&self, first: Arc<Task>) {
        let mut task = first;
        loop {
            let outcome = task.run();
            trace!(lane = %self.name(), task = %task.name(), outcome = ?outcome, "lane task settled");
            let next = {
                let mut state = self.state.lock();
                self.advance(&mut state)
            };
            match next {
                Some(next) => task = next,
                None => {
                    debug!(lane = %self.name(), "lane idle");
                    return;
                }
            }
        }
    }
}

/// Handle to one lane. Cloning is cheap; all clones drive the same lane.
#[derive(Clone)]
pub struct Scheduler {
    lane: Arc<Lane>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lane.state.lock();
        f.debug_struct("Scheduler")
            .field("name", &self.lane.config.name)
            .field(
                "current",
                &state.current.as_ref().map(|task| task.name().to_owned()),
            )
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Scheduler {
    /// A lane with default settings reporting through `tracing`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_parts(LaneConfig::named(name), Arc::new(TracingDiagnostics))
    }

    pub fn with_config(config: LaneConfig, diagnostics: Arc<dyn Diagnostics>) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, diagnostics))
    }

    fn from_parts(config: LaneConfig, diagnostics: Arc<dyn Diagnostics>) -> Self {
        Self {
            lane: Arc::new(Lane {
                config,
                diagnostics,
                state: Mutex::new(LaneState::default()),
                idle: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.lane.name()
    }

    pub fn config(&self) -> &LaneConfig {
        &self.lane.config
    }

    /// Queue `body` behind everything already submitted to this lane.
    ///
    /// On an idle lane the new task is `Started` before this returns. The
    /// returned signal settles when this task finishes, is cancelled, or is
    /// discarded by [`Self::cancel_all`].
    pub fn submit<F>(&self, name: impl Into<String>, body: F) -> Pending<TaskOutcome>
    where
        F: FnOnce(&TaskContext) -> Result<()> + Send + 'static,
    {
        let task = Arc::new(Task::new(
            self.lane.config.name.clone(),
            name,
            Box::new(body),
            Arc::clone(&self.lane.diagnostics),
        ));
        let completion = task.completion();

        let first = {
            let mut state = self.lane.state.lock();
            state.pending.push_back(Arc::clone(&task));
            trace!(
                lane = %self.name(),
                task = %task.name(),
                id = %task.id(),
                queued = state.pending.len(),
                "task admitted"
            );
            if state.current.is_some() {
                None
            } else {
                self.lane.advance(&mut state)
            }
        };

        if let Some(first) = first {
            self.lane.dispatch(first);
        }
        completion
    }

    /// Cancel the running task and discard every queued one.
    ///
    /// No-op on an idle lane. Queued tasks never run: their bodies are
    /// dropped and their completion signals settle as `Cancelled`. The lane
    /// stays busy until the running task's body returns.
    pub fn cancel_all(&self) {
        let (current, discarded) = {
            let mut state = self.lane.state.lock();
            let Some(current) = state.current.clone() else {
                return;
            };
            (current, state.pending.drain(..).collect::<Vec<_>>())
        };

        // `cancel` refuses a task that finished after the lane lock was
        // released, so a completed task is never reported as cancelled.
        let diagnostics = &self.lane.diagnostics;
        if current.cancel() {
            diagnostics.message(self.name(), &format!("cancelled '{}'", current.name()));
        }
        for task in discarded {
            diagnostics.message(self.name(), &format!("cancelled '{}'", task.name()));
            task.discard();
        }
    }

    /// `Err(Busy)` naming the running task, for callers that would rather
    /// reject new work than queue it.
    pub fn ensure_idle(&self) -> Result<()> {
        match &self.lane.state.lock().current {
            Some(task) => Err(LaneError::Busy {
                task: task.name().to_owned(),
            }),
            None => Ok(()),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.lane.state.lock().current.is_some()
    }

    /// Name of the running task, if any.
    pub fn current_task(&self) -> Option<String> {
        self.lane
            .state
            .lock()
            .current
            .as_ref()
            .map(|task| task.name().to_owned())
    }

    /// Number of tasks queued behind the running one.
    pub fn pending_len(&self) -> usize {
        self.lane.state.lock().pending.len()
    }

    /// Block until the lane has no running task.
    ///
    /// Must not be called from a body running on this lane.
    pub fn wait_idle(&self) {
        let mut state = self.lane.state.lock();
        while state.current.is_some() {
            self.lane.idle.wait(&mut state);
        }
    }

    /// Like [`Self::wait_idle`] with a deadline. Returns whether the lane is
    /// idle. A timeout too large to form a deadline waits without one.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait_idle();
            return true;
        };
        let mut state = self.lane.state.lock();
        while state.current.is_some() {
            if self.lane.idle.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.current.is_none()
    }
}
