//! Overflow policies for the demand channel.
//!
//! A policy only looks at the channel occupancy and capacity; everything else
//! it needs lives in the channel's own buffer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What to do when a producer offers an item to a full channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Discard the incoming item
    #[default]
    DropNewest,
    /// Evict the oldest buffered item and keep the incoming one
    KeepLatest,
    /// Put the channel into a terminal failed state
    ErrorOnOverflow,
    /// Treat capacity as advisory and keep growing the buffer.
    ///
    /// Memory grows without limit while the producer outpaces the consumer.
    UnboundedBuffer,
}

/// The action a channel must perform for one `offer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowAction {
    Enqueue,
    RejectIncoming,
    EvictOldest,
    Fail,
}

/// Result of offering one item to a demand channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackpressureOutcome {
    Enqueued,
    Dropped,
    Replaced,
    Failed,
}

impl BackpressurePolicy {
    /// Decide the action for an offer given the current occupancy
    pub fn decide(self, occupancy: usize, capacity: usize) -> OverflowAction {
        if occupancy < capacity {
            return OverflowAction::Enqueue;
        }
        match self {
            BackpressurePolicy::DropNewest => OverflowAction::RejectIncoming,
            BackpressurePolicy::KeepLatest if capacity == 0 => OverflowAction::RejectIncoming,
            BackpressurePolicy::KeepLatest => OverflowAction::EvictOldest,
            BackpressurePolicy::ErrorOnOverflow => OverflowAction::Fail,
            BackpressurePolicy::UnboundedBuffer => OverflowAction::Enqueue,
        }
    }

    /// Whether `capacity` actually bounds the buffer
    pub fn is_bounded(self) -> bool {
        !matches!(self, BackpressurePolicy::UnboundedBuffer)
    }
}

impl OverflowAction {
    /// The outcome reported to the producer for this action
    pub fn outcome(self) -> BackpressureOutcome {
        match self {
            OverflowAction::Enqueue => BackpressureOutcome::Enqueued,
            OverflowAction::RejectIncoming => BackpressureOutcome::Dropped,
            OverflowAction::EvictOldest => BackpressureOutcome::Replaced,
            OverflowAction::Fail => BackpressureOutcome::Failed,
        }
    }
}

impl fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackpressurePolicy::DropNewest => "drop_newest",
            BackpressurePolicy::KeepLatest => "keep_latest",
            BackpressurePolicy::ErrorOnOverflow => "error_on_overflow",
            BackpressurePolicy::UnboundedBuffer => "unbounded_buffer",
        };
        f.write_str(name)
    }
}

impl fmt::Display for BackpressureOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackpressureOutcome::Enqueued => "enqueued",
            BackpressureOutcome::Dropped => "dropped",
            BackpressureOutcome::Replaced => "replaced",
            BackpressureOutcome::Failed => "failed",
        };
        f.write_str(name)
    }
}
