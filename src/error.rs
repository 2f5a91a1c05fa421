use std::time::Duration;
use thiserror::Error;

/// Result type for stream engine operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Boxed error returned by user transforms, sources, sinks and record stores
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can terminate a pipeline or a single item
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The upstream source failed to produce an item
    #[error("Source failed: {0}")]
    Source(String),

    /// A stage transform failed for one item
    #[error("Transform failed in stage '{stage}' at seq {seq}: {reason}")]
    Transform {
        stage: String,
        seq: u64,
        reason: String,
    },

    /// An error-on-overflow channel ran out of room
    #[error("Channel '{channel}' overflowed its capacity of {capacity}")]
    Overflow { channel: String, capacity: usize },

    /// A bounded wait elapsed before an item arrived
    #[error("Timed out after {0:?} waiting for an item")]
    Timeout(Duration),

    /// Cooperative shutdown; not a failure
    #[error("Stream was cancelled")]
    Cancelled,

    /// The sink rejected an item
    #[error("Sink failed: {0}")]
    Sink(String),

    /// Cache accessed outside of its initialized lifetime
    #[error("Cache '{0}' is not initialized")]
    CacheUnavailable(String),

    /// A worker task panicked or was aborted
    #[error("Worker lost in stage '{0}'")]
    WorkerLost(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Wrap a transform failure for the given stage and item
    pub fn transform(stage: &str, seq: u64, err: BoxError) -> Self {
        PipelineError::Transform {
            stage: stage.to_string(),
            seq,
            reason: err.to_string(),
        }
    }

    /// Returns true for the cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }

    /// Per-item errors that best-effort mode may skip
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PipelineError::Transform { .. })
    }
}

/// How a pipeline reacts to per-item transform failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// Log and skip the failed item, keep streaming
    #[default]
    BestEffort,
    /// Abort the whole pipeline on the first failure
    Strict,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_error_display() {
        let err = PipelineError::transform("enrich", 7, "lookup miss".into());
        assert_eq!(
            err.to_string(),
            "Transform failed in stage 'enrich' at seq 7: lookup miss"
        );
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_fatal_errors_not_recoverable() {
        let overflow = PipelineError::Overflow {
            channel: "sink".into(),
            capacity: 4,
        };
        assert!(!overflow.is_recoverable());
        assert!(!PipelineError::Source("db down".into()).is_recoverable());
        assert!(PipelineError::Cancelled.is_cancelled());
    }
}
