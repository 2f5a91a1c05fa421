//! A push-based streaming engine with demand-aware backpressure.
//!
//! A source emits items at its own pace, a sink pulls them at a different pace,
//! and the pipeline in between reconciles the two without unbounded memory
//! growth, using an explicit overflow policy on the edge feeding the sink.
//!
//! # Features
//!
//! - Demand channels with an explicit consumer-owned demand counter
//! - Overflow policies: drop-newest, keep-latest, error-on-overflow, unbounded
//! - Inline map/filter stages and worker-pool scheduler stages
//! - Count- and time-bounded windows driven by the runtime timer
//! - Ordered parallel fan-out/fan-in
//! - Cooperative cancellation that leaves no tasks behind
//! - Per-stage metrics: throughput, latency percentiles, backpressure outcomes
//!
//! # Example
//!
//! ```no_run
//! use flowgate::{CollectSink, IterSource, PipelineBuilder, PipelineConfig, WindowConfig};
//! use std::time::Duration;
//!
//! # async fn demo() -> flowgate::Result<()> {
//! let sink = CollectSink::new();
//! let report = PipelineBuilder::new("demo", PipelineConfig::default())
//!     .source(IterSource::new("numbers", 0..100u32))
//!     .map("double", |v| v * 2)
//!     .window(WindowConfig::new(10, Duration::from_millis(50)))
//!     .run(sink.clone())?
//!     .join()
//!     .await?;
//!
//! assert_eq!(report.delivered, 10);
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod item;
pub mod metrics;
pub mod parallel;
pub mod pipeline;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod stage;
pub mod window;

// Re-exports for convenience
pub use backpressure::{BackpressureOutcome, BackpressurePolicy, OverflowAction};
pub use cache::{CacheState, ProcessCache};
pub use channel::{demand_channel, ChannelConsumer, ChannelProducer};
pub use config::PipelineConfig;
pub use error::{BoxError, ErrorMode, PipelineError, Result};
pub use item::{Item, Sequencer};
pub use metrics::{MetricsSnapshot, StageMetrics};
pub use parallel::{ParallelConfig, ParallelStage, PartitionFn, Resequencer};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineOutcome, PipelineReport, RunningPipeline, StageReport};
pub use scheduler::{SchedulerConfig, SchedulerStage, SubmitHandle, WorkerPool};
pub use sink::{ChannelSink, CollectSink, FnSink, LogSink, Sink, SinkSignal};
pub use source::{
    ChannelSource, InMemoryRecordStore, IntervalSource, IterSource, RecordSource, RecordStore, Source, SourceExt, Zip,
};
pub use stage::{AsyncTransform, FilterStage, MapStage, Stage, StageContext, StageRunner};
pub use window::{CloseReason, Window, WindowAggregator, WindowConfig, WindowState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
