//! Named lanes owned by whichever component wires the application together.
//!
//! A [`LaneSet`] replaces process-wide lane singletons: the owner builds it
//! once (usually from a [`LanesConfig`]) and hands out [`Scheduler`] handles
//! to whatever needs to submit work.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tasklane_error::{LaneError, Result};
use tracing::info;

use crate::config::{LaneConfig, LanesConfig};
use crate::diagnostics::Diagnostics;
use crate::scheduler::Scheduler;

pub struct LaneSet {
    diagnostics: Arc<dyn Diagnostics>,
    lanes: RwLock<BTreeMap<String, Scheduler>>,
}

impl std::fmt::Debug for LaneSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneSet")
            .field("lanes", &self.names())
            .finish_non_exhaustive()
    }
}

impl LaneSet {
    pub fn new(diagnostics: Arc<dyn Diagnostics>) -> Self {
        Self {
            diagnostics,
            lanes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_config(config: &LanesConfig, diagnostics: Arc<dyn Diagnostics>) -> Result<Self> {
        config.validate()?;
        let set = Self::new(diagnostics);
        for lane in &config.lanes {
            set.insert(lane.clone())?;
        }
        info!(lanes = config.lanes.len(), "lane set configured");
        Ok(set)
    }

    /// Add a lane. Names are unique within a set.
    pub fn insert(&self, config: LaneConfig) -> Result<Scheduler> {
        let mut lanes = self.lanes.write();
        if lanes.contains_key(&config.name) {
            return Err(LaneError::Config(format!(
                "duplicate lane name '{}'",
                config.name
            )));
        }
        let name = config.name.clone();
        let scheduler = Scheduler::with_config(config, Arc::clone(&self.diagnostics))?;
        lanes.insert(name, scheduler.clone());
        Ok(scheduler)
    }

    pub fn lane(&self, name: &str) -> Option<Scheduler> {
        self.lanes.read().get(name).cloned()
    }

    /// The lane called `name`, created with default settings if missing.
    pub fn get_or_create(&self, name: &str) -> Result<Scheduler> {
        if let Some(existing) = self.lane(name) {
            return Ok(existing);
        }
        let mut lanes = self.lanes.write();
        if let Some(existing) = lanes.get(name) {
            return Ok(existing.clone());
        }
        let scheduler =
            Scheduler::with_config(LaneConfig::named(name), Arc::clone(&self.diagnostics))?;
        lanes.insert(name.to_owned(), scheduler.clone());
        Ok(scheduler)
    }

    pub fn names(&self) -> Vec<String> {
        self.lanes.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lanes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.read().is_empty()
    }

    /// `cancel_all` on every lane.
    pub fn cancel_all(&self) {
        for scheduler in self.snapshot() {
            scheduler.cancel_all();
        }
    }

    /// Wait until every lane is idle or `timeout` elapses. Returns whether all
    /// lanes went idle.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        self.snapshot().iter().all(|scheduler| {
            let remaining = deadline.map_or(Duration::MAX, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            });
            scheduler.wait_idle_timeout(remaining)
        })
    }

    fn snapshot(&self) -> Vec<Scheduler> {
        self.lanes.read().values().cloned().collect()
    }
}
