//! Single-resolution signals.
//!
//! A [`Pending`] is the waiting side of a one-shot cell and a [`Resolver`]
//! is the producing side. The first `resolve` wins; every later attempt is
//! ignored and reports `false`. Lane completion signals and the sub-operations
//! a task body hands to `with(...)` are both expressed with this pair.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tasklane_error::{LaneError, Result};

type Callback<T> = Box<dyn FnOnce(&T) + Send>;

struct CellState<T> {
    value: Option<T>,
    callbacks: Vec<Callback<T>>,
}

struct Cell<T> {
    state: Mutex<CellState<T>>,
    resolved: Condvar,
}

/// Create a fresh unresolved signal.
pub fn pending<T>() -> (Resolver<T>, Pending<T>)
where
    T: Clone + Send + 'static,
{
    let cell = Arc::new(Cell {
        state: Mutex::new(CellState {
            value: None,
            callbacks: Vec::new(),
        }),
        resolved: Condvar::new(),
    });
    (
        Resolver {
            cell: Arc::clone(&cell),
        },
        Pending { cell },
    )
}

/// Run `f` on a named thread and settle the returned signal with its result.
///
/// A panic in `f` settles the signal with `Err(Body)` instead of leaving it
/// pending.
pub fn spawn<T, F>(name: impl Into<String>, f: F) -> Result<Pending<Result<T>>>
where
    T: Clone + Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (resolver, pending) = pending();
    thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
                LaneError::body(format!("panicked: {}", panic_message(&*payload)))
            });
            resolver.resolve(result);
        })
        .map_err(|err| LaneError::Spawn(err.to_string()))?;
    Ok(pending)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Producing side of a signal.
///
/// Dropping every resolver without resolving leaves the signal pending
/// forever.
pub struct Resolver<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> std::fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("resolved", &self.cell.state.lock().value.is_some())
            .finish()
    }
}

impl<T> Resolver<T>
where
    T: Clone + Send + 'static,
{
    /// Settle the signal. Returns `false` if it was already settled, in which
    /// case `value` is dropped and nothing observable happens.
    pub fn resolve(&self, value: T) -> bool {
        let (snapshot, callbacks) = {
            let mut state = self.cell.state.lock();
            if state.value.is_some() {
                return false;
            }
            let snapshot = value.clone();
            state.value = Some(value);
            (snapshot, std::mem::take(&mut state.callbacks))
        };
        self.cell.resolved.notify_all();

        // Callbacks run outside the cell lock so they may touch this signal.
        for callback in callbacks {
            callback(&snapshot);
        }
        true
    }

    /// Whether the signal has been settled by any resolver.
    pub fn is_resolved(&self) -> bool {
        self.cell.state.lock().value.is_some()
    }
}

/// Waiting side of a signal. Cheap to clone; every clone observes the same
/// resolution.
pub struct Pending<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for Pending<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("value", &self.cell.state.lock().value)
            .finish()
    }
}

impl<T> Pending<T>
where
    T: Clone + Send + 'static,
{
    /// A signal that is already settled with `value`.
    pub fn resolved(value: T) -> Self {
        let (resolver, pending) = pending();
        resolver.resolve(value);
        pending
    }

    /// Block until the signal settles and return a clone of its value.
    pub fn wait(&self) -> T {
        let mut state = self.cell.state.lock();
        loop {
            if let Some(value) = state.value.as_ref() {
                return value.clone();
            }
            self.cell.resolved.wait(&mut state);
        }
    }

    /// Block for at most `timeout`. Returns `None` if the signal is still
    /// pending when the deadline passes. A timeout too large to form a
    /// deadline waits without one.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };
        let mut state = self.cell.state.lock();
        loop {
            if let Some(value) = state.value.as_ref() {
                return Some(value.clone());
            }
            if self
                .cell
                .resolved
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.value.clone();
            }
        }
    }

    /// The settled value, if any, without blocking.
    pub fn try_get(&self) -> Option<T> {
        self.cell.state.lock().value.clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.state.lock().value.is_some()
    }

    /// Register `callback` to run exactly once with the settled value.
    ///
    /// Runs synchronously on the calling thread when the signal is already
    /// settled; otherwise on the thread that settles it.
    pub fn on_resolve<F>(&self, callback: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let settled = {
            let mut state = self.cell.state.lock();
            match state.value.as_ref() {
                Some(value) => value.clone(),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&settled);
    }
}
