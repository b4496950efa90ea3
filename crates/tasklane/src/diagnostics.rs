//! Diagnostic sink consumed by lanes and tasks.
//!
//! Three severity channels: `verbose` for lifecycle chatter, `message` for
//! user-relevant notices such as cancellations, and `error` for body
//! failures that the lane swallowed. Where the output goes is up to the
//! implementation; [`TracingDiagnostics`] forwards to `tracing`.

use parking_lot::Mutex;
use tasklane_error::LaneError;
use tracing::{debug, error, info};

pub trait Diagnostics: Send + Sync {
    fn verbose(&self, lane: &str, msg: &str);
    fn message(&self, lane: &str, msg: &str);
    fn error(&self, lane: &str, task: &str, err: &LaneError);
}

/// Forwards every channel to a `tracing` event with a structured `lane` field.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn verbose(&self, lane: &str, msg: &str) {
        debug!(target: "tasklane", lane = %lane, "{msg}");
    }

    fn message(&self, lane: &str, msg: &str) {
        info!(target: "tasklane", lane = %lane, "{msg}");
    }

    fn error(&self, lane: &str, task: &str, err: &LaneError) {
        error!(target: "tasklane", lane = %lane, task = %task, error = %err, "task failed");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Verbose,
    Message,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRecord {
    pub channel: Channel,
    pub lane: String,
    pub text: String,
}

/// Records every report in memory. Used by tests and by hosts that surface
/// lane activity in their own UI.
#[derive(Debug, Default)]
pub struct MemoryDiagnostics {
    records: Mutex<Vec<DiagnosticRecord>>,
}

impl MemoryDiagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DiagnosticRecord> {
        self.records.lock().clone()
    }

    /// Texts reported on one channel, in report order.
    pub fn texts(&self, channel: Channel) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|record| record.channel == channel)
            .map(|record| record.text.clone())
            .collect()
    }

    pub fn count(&self, channel: Channel) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|record| record.channel == channel)
            .count()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    fn push(&self, channel: Channel, lane: &str, text: String) {
        self.records.lock().push(DiagnosticRecord {
            channel,
            lane: lane.to_owned(),
            text,
        });
    }
}

impl Diagnostics for MemoryDiagnostics {
    fn verbose(&self, lane: &str, msg: &str) {
        self.push(Channel::Verbose, lane, msg.to_owned());
    }

    fn message(&self, lane: &str, msg: &str) {
        self.push(Channel::Message, lane, msg.to_owned());
    }

    fn error(&self, lane: &str, task: &str, err: &LaneError) {
        self.push(Channel::Error, lane, format!("{task}: {err}"));
    }
}
