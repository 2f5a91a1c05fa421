//! Pipeline assembly and lifecycle.
//!
//! A pipeline is described with a typed builder, starting from a [`Source`] and
//! ending at a [`Sink`]. Every stage runs as its own task; internal edges are
//! demand-paced channels, and only the edge feeding the sink applies the
//! configured [`BackpressurePolicy`](crate::backpressure::BackpressurePolicy).

use crate::backpressure::{BackpressureOutcome, BackpressurePolicy};
use crate::channel::{demand_channel, ChannelConsumer, ChannelProducer};
use crate::config::PipelineConfig;
use crate::error::{BoxError, PipelineError, Result};
use crate::item::{Item, Sequencer};
use crate::metrics::{MetricsSnapshot, StageMetrics};
use crate::parallel::ParallelStage;
use crate::scheduler::{SchedulerConfig, SchedulerStage, WorkerPool};
use crate::sink::{Sink, SinkSignal};
use crate::source::Source;
use crate::stage::{self, AsyncTransform, FilterStage, MapStage, Pulled, Stage, StageContext, StageRunner};
use crate::window::{self, Window, WindowConfig};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Shared state while the stage chain is being wired up
struct Assembly {
    name: Arc<str>,
    config: PipelineConfig,
    cancel: CancellationToken,
    tracker: TaskTracker,
    pool: WorkerPool,
    stages: Vec<(String, StageMetrics)>,
}

impl Assembly {
    fn context(&mut self, stage: &str) -> StageContext {
        let ctx = StageContext::new(
            Arc::clone(&self.name),
            stage,
            self.cancel.clone(),
            self.config.error_mode,
        );
        self.stages.push((stage.to_string(), ctx.metrics().clone()));
        ctx
    }

    /// A demand-paced edge between two stages
    fn edge<T>(&self, stage: &str) -> (ChannelProducer<T>, ChannelConsumer<T>) {
        demand_channel(
            format!("{}.{}", self.name, stage),
            self.config.stage_buffer,
            BackpressurePolicy::DropNewest,
        )
    }
}

type Assemble<T> = Box<dyn FnOnce(&mut Assembly) -> ChannelConsumer<T> + Send>;

/// Entry point for describing a pipeline
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: Arc<str>,
    config: PipelineConfig,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<Arc<str>>, config: PipelineConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// Start the chain with a source; its payloads are numbered from 0
    pub fn source<T, S>(self, source: S) -> Pipeline<T>
    where
        T: Send + 'static,
        S: Source<T> + 'static,
    {
        let stage = source.name().to_string();
        Pipeline {
            name: self.name,
            config: self.config,
            invalid: None,
            assemble: Box::new(move |asm| {
                let (tx, rx) = asm.edge(&stage);
                let ctx = asm.context(&stage);
                asm.tracker.spawn(drive_source(source, tx, ctx));
                rx
            }),
        }
    }
}

/// A described but not yet running pipeline producing items of type `T`
pub struct Pipeline<T> {
    name: Arc<str>,
    config: PipelineConfig,
    /// First invalid stage setting, reported by `run`
    invalid: Option<PipelineError>,
    assemble: Assemble<T>,
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn then<O, F>(self, stage: String, invalid: Option<PipelineError>, wire: F) -> Pipeline<O>
    where
        O: Send + 'static,
        F: FnOnce(ChannelConsumer<T>, ChannelProducer<O>, StageContext, &Assembly) + Send + 'static,
    {
        let Pipeline {
            name,
            config,
            invalid: earlier,
            assemble,
        } = self;
        Pipeline {
            name,
            config,
            invalid: earlier.or(invalid),
            assemble: Box::new(move |asm| {
                let input = assemble(asm);
                let (tx, rx) = asm.edge(&stage);
                let ctx = asm.context(&stage);
                wire(input, tx, ctx, asm);
                rx
            }),
        }
    }

    /// Run a CPU-bound [`Stage`] inline on its own task
    pub fn stage<O, S>(self, stage: S) -> Pipeline<O>
    where
        O: Send + 'static,
        S: Stage<T, O>,
    {
        let name = stage.name().to_string();
        self.then(name, None, move |input, output, ctx, asm| {
            asm.tracker
                .spawn(StageRunner::new(input, output, ctx).run(Box::new(stage)));
        })
    }

    pub fn map<O, F>(self, name: &str, f: F) -> Pipeline<O>
    where
        O: Send + 'static,
        F: Fn(T) -> O + Send + 'static,
    {
        self.try_map(name, move |input| Ok(f(input)))
    }

    /// Map with a fallible function; failures follow the pipeline's error mode
    pub fn try_map<O, F>(self, name: &str, f: F) -> Pipeline<O>
    where
        O: Send + 'static,
        F: Fn(T) -> std::result::Result<O, BoxError> + Send + 'static,
    {
        self.stage(MapStage::new(name, f))
    }

    pub fn filter<F>(self, name: &str, predicate: F) -> Pipeline<T>
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        self.stage(FilterStage::new(name, predicate))
    }

    /// Run a latency-bound transform on a worker pool.
    ///
    /// Without `config.workers` the stage shares the pipeline's pool.
    pub fn schedule<O>(self, name: &str, config: SchedulerConfig, transform: AsyncTransform<T, O>) -> Pipeline<O>
    where
        O: Send + 'static,
    {
        let invalid = (config.workers == Some(0))
            .then(|| PipelineError::Config(format!("scheduler stage {name} needs at least one worker")));
        self.then(name.to_string(), invalid, move |input, output, ctx, asm| {
            let pool = match config.workers {
                Some(workers) => WorkerPool::with_tracker(
                    format!("{}.{}", asm.name, ctx.name()),
                    workers,
                    asm.tracker.clone(),
                ),
                None => asm.pool.clone(),
            };
            asm.tracker
                .spawn(SchedulerStage::new(config, pool, transform).run(input, output, ctx));
        })
    }

    /// Group items into windows closed by count or by elapsed time
    pub fn window(self, config: WindowConfig) -> Pipeline<Window<T>> {
        let invalid = config.validate().err();
        self.then("window".to_string(), invalid, move |input, output, ctx, asm| {
            asm.tracker.spawn(window::run_window(input, output, ctx, config));
        })
    }

    /// Fan out over several workers and fan back in, preserving input order
    pub fn parallel<O>(self, name: &str, stage: ParallelStage<T, O>) -> Pipeline<O>
    where
        O: Send + 'static,
    {
        let invalid = stage.config().validate().err();
        self.then(name.to_string(), invalid, move |input, output, ctx, asm| {
            let tracker = asm.tracker.clone();
            asm.tracker.spawn(stage.run(input, output, ctx, tracker));
        })
    }

    /// Space items out by `delay` using the runtime timer
    pub fn delay_elements(self, delay: Duration) -> Pipeline<T> {
        self.then("delay".to_string(), None, move |input, output, ctx, asm| {
            asm.tracker.spawn(stage::run_delay(input, output, ctx, delay));
        })
    }

    /// Resume after an upstream failure.
    ///
    /// When `fallback` returns a value for the error, that value is emitted as
    /// the last item and the stream completes; otherwise the error propagates.
    pub fn recover<F>(self, name: &str, fallback: F) -> Pipeline<T>
    where
        F: Fn(&PipelineError) -> Option<T> + Send + 'static,
    {
        self.then(name.to_string(), None, move |input, output, ctx, asm| {
            asm.tracker.spawn(stage::run_recover(input, output, ctx, fallback));
        })
    }

    /// Spawn every stage and start delivering to `sink`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run<S>(self, sink: S) -> Result<RunningPipeline>
    where
        S: Sink<T> + 'static,
    {
        let Pipeline {
            name,
            config,
            invalid,
            assemble,
        } = self;
        config.validate()?;
        if let Some(err) = invalid {
            return Err(err);
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let pool = WorkerPool::with_tracker(
            format!("{name}.pool"),
            config.scheduler_workers,
            tracker.clone(),
        );
        let mut asm = Assembly {
            name: Arc::clone(&name),
            config: config.clone(),
            cancel: cancel.clone(),
            tracker: tracker.clone(),
            pool: pool.clone(),
            stages: Vec::new(),
        };

        let upstream = assemble(&mut asm);

        let (guard_tx, guard_rx) = demand_channel(format!("{name}.sink"), config.capacity, config.policy);
        asm.stages.push(("sink-edge".to_string(), guard_tx.metrics().clone()));
        let guard_ctx = StageContext::new(Arc::clone(&name), "sink-edge", cancel.clone(), config.error_mode);
        tracker.spawn(guard_sink_edge(upstream, guard_tx, guard_ctx));

        let sink_ctx = asm.context("sink");
        let sink_task = tracker.spawn(drive_sink(
            sink,
            guard_rx,
            sink_ctx,
            config.sink_prefetch,
            config.take_timeout(),
            pool,
        ));
        tracker.close();

        info!(
            pipeline = %name,
            stages = asm.stages.len(),
            policy = %config.policy,
            capacity = config.capacity,
            "pipeline started"
        );

        Ok(RunningPipeline {
            name,
            cancel,
            tracker,
            sink_task,
            stages: asm.stages,
            started: Instant::now(),
        })
    }
}

async fn drive_source<T, S>(mut source: S, output: ChannelProducer<T>, ctx: StageContext)
where
    T: Send + 'static,
    S: Source<T>,
{
    let sequencer = Sequencer::new();
    loop {
        let next = tokio::select! {
            biased;
            () = ctx.cancel_token().cancelled() => break,
            () = output.closed() => break,
            next = next_on_demand(&mut source, &output) => match next {
                Ok(next) => next,
                Err(_) => break,
            },
        };
        match next {
            Some(Ok(payload)) => {
                if !ctx.emit(&output, sequencer.stamp(payload)).await {
                    break;
                }
            }
            Some(Err(err)) => {
                let err = PipelineError::Source(err.to_string());
                warn!(pipeline = %ctx.pipeline(), source = %ctx.name(), error = %err, "source failed");
                output.fail(err);
                return;
            }
            None => {
                output.complete();
                debug!(pipeline = %ctx.pipeline(), source = %ctx.name(), emitted = sequencer.peek(), "source exhausted");
                return;
            }
        }
    }
    debug!(pipeline = %ctx.pipeline(), source = %ctx.name(), emitted = sequencer.peek(), "source stopped");
}

/// Ask the source for its next item only once downstream wants one
async fn next_on_demand<T, S>(
    source: &mut S,
    output: &ChannelProducer<T>,
) -> Result<Option<std::result::Result<T, BoxError>>>
where
    T: Send + 'static,
    S: Source<T>,
{
    output.wait_for_demand().await?;
    Ok(source.next().await)
}

/// Moves items onto the policy-guarded channel as fast as upstream yields them.
///
/// Offers ignore the sink's demand; the overflow policy decides what happens
/// while the sink lags.
async fn guard_sink_edge<T: Send + 'static>(
    input: ChannelConsumer<T>,
    output: ChannelProducer<T>,
    ctx: StageContext,
) {
    loop {
        let item = match ctx.pull(&input, &output).await {
            Pulled::Item(item) => item,
            Pulled::End => return ctx.finish(&input, &output, None),
            Pulled::Failed(err) => return ctx.finish(&input, &output, Some(err)),
            Pulled::Stop => return ctx.stop(&input),
        };
        match output.offer(item) {
            Ok(BackpressureOutcome::Failed) | Err(_) => return ctx.stop(&input),
            Ok(_) => {}
        }
    }
}

async fn take_next<T>(input: &ChannelConsumer<T>, timeout: Option<Duration>) -> Result<Option<Item<T>>> {
    match timeout {
        Some(timeout) => input.take_timeout(timeout).await,
        None => input.take().await,
    }
}

async fn drive_sink<T, S>(
    mut sink: S,
    input: ChannelConsumer<T>,
    ctx: StageContext,
    prefetch: u64,
    take_timeout: Option<Duration>,
    pool: WorkerPool,
) -> Result<(PipelineOutcome, u64)>
where
    T: Send + 'static,
    S: Sink<T>,
{
    input.request_more(prefetch);
    let replenish_at = (prefetch / 2).max(1);
    let mut consumed = 0;
    let mut delivered = 0;

    let result = loop {
        let next = tokio::select! {
            biased;
            () = ctx.cancel_token().cancelled() => break Ok(PipelineOutcome::Cancelled),
            next = take_next(&input, take_timeout) => next,
        };
        match next {
            Ok(Some(item)) => {
                let seq = item.seq();
                let start = Instant::now();
                let handled = tokio::select! {
                    biased;
                    () = ctx.cancel_token().cancelled() => break Ok(PipelineOutcome::Cancelled),
                    handled = sink.on_item(item) => handled,
                };
                let signal = match handled {
                    Ok(signal) => signal,
                    Err(err) => {
                        let err = PipelineError::Sink(err.to_string());
                        notify_error::<T, S>(&mut sink, &err, &ctx).await;
                        break Err(err);
                    }
                };
                delivered += 1;
                ctx.metrics().record_processed();
                ctx.metrics().record_elapsed(start.elapsed());
                trace!(pipeline = %ctx.pipeline(), sink = sink.name(), seq, "item delivered");
                if signal == SinkSignal::Cancel {
                    info!(pipeline = %ctx.pipeline(), sink = sink.name(), delivered, "sink cancelled the stream");
                    break Ok(PipelineOutcome::Cancelled);
                }

                consumed += 1;
                if consumed >= replenish_at {
                    input.request_more(consumed);
                    consumed = 0;
                }
            }
            Ok(None) => {
                tokio::select! {
                    biased;
                    () = ctx.cancel_token().cancelled() => break Ok(PipelineOutcome::Cancelled),
                    () = sink.on_complete() => {}
                }
                break Ok(PipelineOutcome::Completed);
            }
            Err(PipelineError::Cancelled) => break Ok(PipelineOutcome::Cancelled),
            Err(err) => {
                warn!(pipeline = %ctx.pipeline(), sink = sink.name(), error = %err, "stream failed");
                notify_error::<T, S>(&mut sink, &err, &ctx).await;
                break Err(err);
            }
        }
    };

    ctx.cancel_token().cancel();
    input.cancel();
    pool.close();
    result.map(|outcome| (outcome, delivered))
}

/// Hand the failure to the sink unless the pipeline is cancelled meanwhile
async fn notify_error<T, S: Sink<T>>(sink: &mut S, err: &PipelineError, ctx: &StageContext) {
    tokio::select! {
        biased;
        () = ctx.cancel_token().cancelled() => {
            debug!(pipeline = %ctx.pipeline(), sink = sink.name(), "cancelled while reporting failure");
        }
        () = sink.on_error(err) => {}
    }
}

/// How a pipeline ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The source was exhausted and the sink saw completion
    Completed,
    /// The sink or the caller stopped the stream early
    Cancelled,
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineOutcome::Completed => write!(f, "completed"),
            PipelineOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Metrics of one stage at the end of a run
#[derive(Debug, Clone)]
pub struct StageReport {
    pub name: String,
    pub metrics: MetricsSnapshot,
}

/// Summary of a finished pipeline
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub name: String,
    pub outcome: PipelineOutcome,
    /// Items handed to the sink
    pub delivered: u64,
    /// Per-stage metrics, source first and sink last
    pub stages: Vec<StageReport>,
    /// Tasks still alive when the report was taken
    pub live_tasks: usize,
    pub elapsed: Duration,
}

impl PipelineReport {
    pub fn is_completed(&self) -> bool {
        self.outcome == PipelineOutcome::Completed
    }

    pub fn stage(&self, name: &str) -> Option<&MetricsSnapshot> {
        self.stages
            .iter()
            .find(|stage| stage.name == name)
            .map(|stage| &stage.metrics)
    }

    pub fn metrics_summary(&self) -> String {
        let mut summary = format!(
            "Pipeline {} {} ({} delivered in {:.2}s):\n",
            self.name,
            self.outcome,
            self.delivered,
            self.elapsed.as_secs_f64()
        );
        for stage in &self.stages {
            summary.push_str(&format!("  Stage {}: {}\n", stage.name, stage.metrics.format()));
        }
        summary
    }
}

/// A started pipeline that can be cancelled and joined
pub struct RunningPipeline {
    name: Arc<str>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    sink_task: JoinHandle<Result<(PipelineOutcome, u64)>>,
    stages: Vec<(String, StageMetrics)>,
    started: Instant,
}

impl RunningPipeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask every stage to stop; `join` then reports `Cancelled`
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!(pipeline = %self.name, "pipeline cancelled");
            self.cancel.cancel();
        }
    }

    /// Whether the sink has seen a terminal signal
    pub fn is_finished(&self) -> bool {
        self.sink_task.is_finished()
    }

    pub fn live_tasks(&self) -> usize {
        self.tracker.len()
    }

    pub fn stage_metrics(&self, stage: &str) -> Option<&StageMetrics> {
        self.stages
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, metrics)| metrics)
    }

    pub fn metrics_summary(&self) -> String {
        let mut summary = format!("Pipeline {} Metrics Summary:\n", self.name);
        for (name, metrics) in &self.stages {
            summary.push_str(&format!("  Stage {}: {}\n", name, metrics.snapshot().format()));
        }
        summary
    }

    /// Wait for the sink's terminal signal and for every task to exit
    pub async fn join(self) -> Result<PipelineReport> {
        let RunningPipeline {
            name,
            cancel,
            tracker,
            sink_task,
            stages,
            started,
        } = self;

        let joined = sink_task.await;
        cancel.cancel();
        tracker.wait().await;

        let (outcome, delivered) = match joined {
            Ok(result) => result?,
            Err(err) => return Err(PipelineError::WorkerLost(format!("{name} sink: {err}"))),
        };
        let report = PipelineReport {
            name: name.to_string(),
            outcome,
            delivered,
            stages: stages
                .into_iter()
                .map(|(name, metrics)| StageReport {
                    name,
                    metrics: metrics.snapshot(),
                })
                .collect(),
            live_tasks: tracker.len(),
            elapsed: started.elapsed(),
        };
        info!(pipeline = %name, outcome = %outcome, delivered, "pipeline finished");
        Ok(report)
    }

    /// Cancel and wait
    pub async fn shutdown(self) -> Result<PipelineReport> {
        self.cancel();
        self.join().await
    }
}
