//! Lane configuration.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tasklane_error::{LaneError, Result};

const DEFAULT_LANE_NAME: &str = "default";
const DEFAULT_THREAD_NAME_PREFIX: &str = "tasklane";

/// Settings for one lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
    /// Lane identifier, used in diagnostics and worker thread names.
    pub name: String,
    /// Worker threads are named `{thread_name_prefix}-{name}`.
    pub thread_name_prefix: String,
    /// Stack size for the worker thread; platform default when unset.
    pub worker_stack_size: Option<usize>,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_LANE_NAME.to_owned(),
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_owned(),
            worker_stack_size: None,
        }
    }
}

impl LaneConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn worker_thread_name(&self) -> String {
        format!("{}-{}", self.thread_name_prefix, self.name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(LaneError::Config("lane name must be non-empty".to_owned()));
        }
        if self.worker_stack_size == Some(0) {
            return Err(LaneError::Config(format!(
                "lane '{}' worker_stack_size must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// A set of lanes, typically one per purpose ("compile", "upload", ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanesConfig {
    #[serde(default)]
    pub lanes: Vec<LaneConfig>,
}

impl LanesConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| LaneError::Config(format!("failed to parse lanes config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Every lane must be valid and names must be unique.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for lane in &self.lanes {
            lane.validate()?;
            if !seen.insert(lane.name.as_str()) {
                return Err(LaneError::Config(format!(
                    "duplicate lane name '{}'",
                    lane.name
                )));
            }
        }
        Ok(())
    }
}
