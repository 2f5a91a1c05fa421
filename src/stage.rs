use crate::channel::{ChannelConsumer, ChannelProducer};
use crate::error::{BoxError, ErrorMode, PipelineError, Result};
use crate::item::Item;
use crate::metrics::StageMetrics;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// A CPU-bound step that runs inline on its stage task
pub trait Stage<I, O>: Send + 'static {
    /// Process one input; `Ok(None)` filters the item out
    fn process(&mut self, input: I) -> std::result::Result<Option<O>, BoxError>;

    /// Called before the first item
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when the stage stops, whatever the reason
    fn on_shutdown(&mut self) {}

    /// Human-readable name for logs and metrics
    fn name(&self) -> &str {
        "stage"
    }
}

/// Passes through items matching a predicate
#[derive(Debug)]
pub struct FilterStage<F> {
    name: String,
    predicate: F,
}

impl<F> FilterStage<F> {
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }
}

impl<T, F> Stage<T, T> for FilterStage<F>
where
    T: Send + 'static,
    F: Fn(&T) -> bool + Send + 'static,
{
    fn process(&mut self, input: T) -> std::result::Result<Option<T>, BoxError> {
        if (self.predicate)(&input) {
            Ok(Some(input))
        } else {
            Ok(None)
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Transforms each item with a fallible mapper
#[derive(Debug)]
pub struct MapStage<F> {
    name: String,
    mapper: F,
}

impl<F> MapStage<F> {
    pub fn new(name: impl Into<String>, mapper: F) -> Self {
        Self {
            name: name.into(),
            mapper,
        }
    }
}

impl<I, O, F> Stage<I, O> for MapStage<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> std::result::Result<O, BoxError> + Send + 'static,
{
    fn process(&mut self, input: I) -> std::result::Result<Option<O>, BoxError> {
        (self.mapper)(input).map(Some)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A latency-bound transform, shared by scheduler workers and parallel workers
pub struct AsyncTransform<I, O> {
    func: Arc<dyn Fn(I) -> BoxFuture<'static, std::result::Result<O, BoxError>> + Send + Sync>,
}

impl<I, O> AsyncTransform<I, O> {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, BoxError>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |input| Box::pin(func(input))),
        }
    }

    /// Start the transform for one payload
    pub fn call(&self, input: I) -> BoxFuture<'static, std::result::Result<O, BoxError>> {
        (self.func)(input)
    }
}

impl<I, O> Clone for AsyncTransform<I, O> {
    fn clone(&self) -> Self {
        Self {
            func: Arc::clone(&self.func),
        }
    }
}

impl<I, O> std::fmt::Debug for AsyncTransform<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AsyncTransform")
    }
}

/// What a stage got when it asked upstream for the next item
pub(crate) enum Pulled<T> {
    Item(Item<T>),
    /// Upstream completed
    End,
    /// Upstream failed; the error still has to reach the sink
    Failed(PipelineError),
    /// Cancelled from downstream or by the pipeline
    Stop,
}

/// Per-stage runtime state shared by every stage kind
#[derive(Debug, Clone)]
pub struct StageContext {
    pipeline: Arc<str>,
    name: String,
    cancel: CancellationToken,
    mode: ErrorMode,
    metrics: StageMetrics,
}

impl StageContext {
    pub fn new(
        pipeline: Arc<str>,
        name: impl Into<String>,
        cancel: CancellationToken,
        mode: ErrorMode,
    ) -> Self {
        Self {
            pipeline,
            name: name.into(),
            cancel,
            mode,
            metrics: StageMetrics::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn mode(&self) -> ErrorMode {
        self.mode
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the next upstream item, or for a reason to stop.
    ///
    /// Keeps the input's outstanding demand topped up to its capacity, so an
    /// upstream stage produces at most one buffer ahead.
    pub(crate) async fn pull<I, O>(
        &self,
        input: &ChannelConsumer<I>,
        output: &ChannelProducer<O>,
    ) -> Pulled<I> {
        let prefetch = input.capacity() as u64;
        let outstanding = input.outstanding_demand();
        if outstanding < prefetch {
            input.request_more(prefetch - outstanding);
        }

        let next = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Pulled::Stop,
            () = output.closed() => return Pulled::Stop,
            next = input.take() => next,
        };
        match next {
            Ok(Some(item)) => Pulled::Item(item),
            Ok(None) => Pulled::End,
            Err(PipelineError::Cancelled) => Pulled::Stop,
            Err(err) => Pulled::Failed(err),
        }
    }

    /// Send downstream, waiting for room; false means the stage should stop
    pub(crate) async fn emit<O>(&self, output: &ChannelProducer<O>, item: Item<O>) -> bool {
        let seq = item.seq();
        let sent = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return false,
            sent = output.send(item) => sent,
        };
        match sent {
            Ok(()) => {
                self.metrics.record_processed();
                trace!(pipeline = %self.pipeline, stage = %self.name, seq, "item processed");
                true
            }
            Err(_) => false,
        }
    }

    /// Decide what to do with a per-item failure.
    ///
    /// Returns the error when the stage must fail the stream.
    pub(crate) fn item_failed(&self, err: PipelineError) -> Option<PipelineError> {
        match (self.mode, err.is_recoverable()) {
            (ErrorMode::BestEffort, true) => {
                self.metrics.record_error();
                warn!(
                    pipeline = %self.pipeline,
                    stage = %self.name,
                    error = %err,
                    "skipping failed item"
                );
                None
            }
            _ => Some(err),
        }
    }

    /// Close the stage after upstream is done or a failure occurred
    pub(crate) fn finish<I, O>(
        &self,
        input: &ChannelConsumer<I>,
        output: &ChannelProducer<O>,
        result: Option<PipelineError>,
    ) {
        match result {
            None => {
                output.complete();
                debug!(pipeline = %self.pipeline, stage = %self.name, "stage completed");
            }
            Some(err) => {
                warn!(pipeline = %self.pipeline, stage = %self.name, error = %err, "stage failed");
                output.fail(err);
                input.cancel();
            }
        }
    }

    /// Stop pulling and release upstream
    pub(crate) fn stop<I>(&self, input: &ChannelConsumer<I>) {
        input.cancel();
        debug!(pipeline = %self.pipeline, stage = %self.name, "stage stopped");
    }
}

/// Drives an inline [`Stage`] between two channels
pub struct StageRunner<I, O> {
    input: ChannelConsumer<I>,
    output: ChannelProducer<O>,
    ctx: StageContext,
}

impl<I: Send + 'static, O: Send + 'static> StageRunner<I, O> {
    pub fn new(input: ChannelConsumer<I>, output: ChannelProducer<O>, ctx: StageContext) -> Self {
        Self { input, output, ctx }
    }

    pub fn metrics(&self) -> &StageMetrics {
        self.ctx.metrics()
    }

    /// Run until upstream completes, fails, or the stage is cancelled
    pub async fn run(self, mut stage: Box<dyn Stage<I, O>>) {
        let Self { input, output, ctx } = self;
        if let Err(err) = stage.on_start() {
            ctx.finish(&input, &output, Some(err));
            stage.on_shutdown();
            return;
        }

        loop {
            let item = match ctx.pull(&input, &output).await {
                Pulled::Item(item) => item,
                Pulled::End => {
                    ctx.finish(&input, &output, None);
                    break;
                }
                Pulled::Failed(err) => {
                    ctx.finish(&input, &output, Some(err));
                    break;
                }
                Pulled::Stop => {
                    ctx.stop(&input);
                    break;
                }
            };

            let (seq, payload) = item.into_parts();
            let start = Instant::now();
            match stage.process(payload) {
                Ok(Some(out)) => {
                    ctx.metrics().record_elapsed(start.elapsed());
                    if !ctx.emit(&output, Item::new(seq, out)).await {
                        ctx.stop(&input);
                        break;
                    }
                }
                Ok(None) => {
                    ctx.metrics().record_dropped();
                    trace!(stage = %ctx.name(), seq, "item filtered out");
                }
                Err(err) => {
                    let err = PipelineError::transform(ctx.name(), seq, err);
                    if let Some(fatal) = ctx.item_failed(err) {
                        ctx.finish(&input, &output, Some(fatal));
                        break;
                    }
                }
            }
        }

        stage.on_shutdown();
    }
}

/// Spaces items out by scheduling each one `delay` after the previous emission
pub(crate) async fn run_delay<T: Send + 'static>(
    input: ChannelConsumer<T>,
    output: ChannelProducer<T>,
    ctx: StageContext,
    delay: Duration,
) {
    loop {
        let item = match ctx.pull(&input, &output).await {
            Pulled::Item(item) => item,
            Pulled::End => return ctx.finish(&input, &output, None),
            Pulled::Failed(err) => return ctx.finish(&input, &output, Some(err)),
            Pulled::Stop => return ctx.stop(&input),
        };

        tokio::select! {
            biased;
            () = ctx.cancel_token().cancelled() => return ctx.stop(&input),
            () = output.closed() => return ctx.stop(&input),
            () = tokio::time::sleep(delay) => {}
        }

        if !ctx.emit(&output, item).await {
            return ctx.stop(&input);
        }
    }
}

/// Forwards items; an upstream failure the `fallback` accepts becomes one last
/// item followed by completion
pub(crate) async fn run_recover<T, F>(
    input: ChannelConsumer<T>,
    output: ChannelProducer<T>,
    ctx: StageContext,
    fallback: F,
) where
    T: Send + 'static,
    F: Fn(&PipelineError) -> Option<T> + Send + 'static,
{
    let mut next_seq = 0;
    loop {
        match ctx.pull(&input, &output).await {
            Pulled::Item(item) => {
                next_seq = item.seq() + 1;
                if !ctx.emit(&output, item).await {
                    return ctx.stop(&input);
                }
            }
            Pulled::End => return ctx.finish(&input, &output, None),
            Pulled::Failed(err) => {
                let Some(payload) = fallback(&err) else {
                    return ctx.finish(&input, &output, Some(err));
                };
                ctx.metrics().record_error();
                warn!(
                    pipeline = %ctx.pipeline(),
                    stage = %ctx.name(),
                    error = %err,
                    seq = next_seq,
                    "upstream failed, resuming with fallback"
                );
                if !ctx.emit(&output, Item::new(next_seq, payload)).await {
                    return ctx.stop(&input);
                }
                input.cancel();
                return ctx.finish(&input, &output, None);
            }
            Pulled::Stop => return ctx.stop(&input),
        }
    }
}
