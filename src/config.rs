//! Pipeline configuration, loadable from TOML.

use crate::backpressure::BackpressurePolicy;
use crate::error::{ErrorMode, PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Settings shared by every stage of one pipeline.
///
/// Missing keys fall back to [`PipelineConfig::default`]:
///
/// ```toml
/// capacity = 256
/// policy = "keep_latest"
/// error_mode = "strict"
/// take_timeout_ms = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Capacity of the policy-guarded channel in front of the sink
    pub capacity: usize,
    /// What happens when the guarded channel is full
    pub policy: BackpressurePolicy,
    /// Capacity of every internal, demand-paced edge
    pub stage_buffer: usize,
    pub error_mode: ErrorMode,
    /// Demand the sink grants up front; it tops up as items arrive
    pub sink_prefetch: u64,
    /// Longest the sink waits for one item before failing with `Timeout`
    pub take_timeout_ms: Option<u64>,
    /// Size of the worker pool shared by scheduler stages
    pub scheduler_workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            policy: BackpressurePolicy::DropNewest,
            stage_buffer: 32,
            error_mode: ErrorMode::BestEffort,
            sink_prefetch: 32,
            take_timeout_ms: None,
            scheduler_workers: 4,
        }
    }
}

impl PipelineConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_policy(mut self, policy: BackpressurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_stage_buffer(mut self, stage_buffer: usize) -> Self {
        self.stage_buffer = stage_buffer;
        self
    }

    pub fn with_error_mode(mut self, error_mode: ErrorMode) -> Self {
        self.error_mode = error_mode;
        self
    }

    pub fn with_sink_prefetch(mut self, sink_prefetch: u64) -> Self {
        self.sink_prefetch = sink_prefetch;
        self
    }

    /// Sub-millisecond timeouts round up to 1 ms
    pub fn with_take_timeout(mut self, timeout: Duration) -> Self {
        let millis = timeout.as_nanos().div_ceil(1_000_000);
        self.take_timeout_ms = Some(u64::try_from(millis).unwrap_or(u64::MAX));
        self
    }

    pub fn with_scheduler_workers(mut self, workers: usize) -> Self {
        self.scheduler_workers = workers;
        self
    }

    pub fn take_timeout(&self) -> Option<Duration> {
        self.take_timeout_ms.map(Duration::from_millis)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| PipelineError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), policy = %config.policy, capacity = config.capacity, "configuration loaded");
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| PipelineError::Config(format!("failed to serialize config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(PipelineError::Config("capacity must be at least 1".into()));
        }
        if self.stage_buffer == 0 {
            return Err(PipelineError::Config("stage_buffer must be at least 1".into()));
        }
        if self.sink_prefetch == 0 {
            return Err(PipelineError::Config("sink_prefetch must be at least 1".into()));
        }
        if self.scheduler_workers == 0 {
            return Err(PipelineError::Config("scheduler_workers must be at least 1".into()));
        }
        if self.take_timeout_ms == Some(0) {
            return Err(PipelineError::Config("take_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}
