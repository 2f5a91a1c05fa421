//! Scheduler stage: dispatches a latency-bound transform onto a worker pool so the
//! stage task keeps pulling while earlier items are still in flight.

use crate::channel::{ChannelConsumer, ChannelProducer};
use crate::error::{PipelineError, Result};
use crate::item::Item;
use crate::stage::{AsyncTransform, Pulled, StageContext};
use futures::stream::{FuturesOrdered, FuturesUnordered};
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Scheduler stage settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Release results in submission order instead of completion order
    pub ordered: bool,
    /// Pool size; falls back to the pipeline's `scheduler_workers`
    pub workers: Option<usize>,
}

impl SchedulerConfig {
    /// Completion-order delivery on the pipeline's shared pool
    pub fn unordered() -> Self {
        Self {
            ordered: false,
            workers: None,
        }
    }

    /// Submission-order delivery on the pipeline's shared pool
    pub fn ordered() -> Self {
        Self {
            ordered: true,
            workers: None,
        }
    }

    /// Use a dedicated pool of `workers` slots
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::ordered()
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Join handle that aborts its task when dropped, so a stopped stage frees its slots
#[derive(Debug)]
pub struct SubmitHandle<T> {
    inner: JoinHandle<T>,
}

impl<T> Future for SubmitHandle<T> {
    type Output = std::result::Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl<T> Drop for SubmitHandle<T> {
    fn drop(&mut self) {
        self.inner.abort();
    }
}

/// A bounded set of execution slots; each submitted item runs as its own task
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: Arc<str>,
    permits: Arc<Semaphore>,
    size: usize,
    in_flight: Arc<AtomicUsize>,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(name: impl Into<Arc<str>>, size: usize) -> Self {
        Self::with_tracker(name, size, TaskTracker::new())
    }

    /// Spawn work on an existing tracker so its owner can wait for every task
    pub fn with_tracker(name: impl Into<Arc<str>>, size: usize, tracker: TaskTracker) -> Self {
        let size = size.max(1);
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(size)),
            size,
            in_flight: Arc::new(AtomicUsize::new(0)),
            tracker,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Transforms currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run `transform` on the item once a slot frees up.
    ///
    /// Only waiting for the slot happens on the caller; the transform itself
    /// runs on its own task and the returned handle resolves to the new item.
    pub async fn submit<I, O>(
        &self,
        item: Item<I>,
        transform: &AsyncTransform<I, O>,
    ) -> Result<SubmitHandle<Result<Item<O>>>>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::WorkerLost(self.name.to_string()))?;

        let (seq, payload) = item.into_parts();
        let work = transform.call(payload);
        let name = Arc::clone(&self.name);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));

        let inner = self.tracker.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            work.await
                .map(|out| Item::new(seq, out))
                .map_err(|err| PipelineError::transform(&name, seq, err))
        });
        Ok(SubmitHandle { inner })
    }

    /// Refuse further submissions
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

/// In-flight results, released either in submission or completion order
enum InFlight<F: Future> {
    Ordered(FuturesOrdered<F>),
    Unordered(FuturesUnordered<F>),
}

impl<F: Future> InFlight<F> {
    fn new(ordered: bool) -> Self {
        if ordered {
            InFlight::Ordered(FuturesOrdered::new())
        } else {
            InFlight::Unordered(FuturesUnordered::new())
        }
    }

    fn push(&mut self, fut: F) {
        match self {
            InFlight::Ordered(set) => set.push_back(fut),
            InFlight::Unordered(set) => set.push(fut),
        }
    }

    fn len(&self) -> usize {
        match self {
            InFlight::Ordered(set) => set.len(),
            InFlight::Unordered(set) => set.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn next(&mut self) -> Option<F::Output> {
        match self {
            InFlight::Ordered(set) => set.next().await,
            InFlight::Unordered(set) => set.next().await,
        }
    }
}

/// A pipeline stage that runs its transform on a [`WorkerPool`]
pub struct SchedulerStage<I, O> {
    config: SchedulerConfig,
    pool: WorkerPool,
    transform: AsyncTransform<I, O>,
}

impl<I: Send + 'static, O: Send + 'static> SchedulerStage<I, O> {
    pub fn new(config: SchedulerConfig, pool: WorkerPool, transform: AsyncTransform<I, O>) -> Self {
        Self {
            config,
            pool,
            transform,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub async fn run(self, input: ChannelConsumer<I>, output: ChannelProducer<O>, ctx: StageContext) {
        let Self {
            config,
            pool,
            transform,
        } = self;
        let mut in_flight = InFlight::new(config.ordered);
        let mut upstream_done = false;
        let mut failure = None;

        loop {
            if upstream_done && in_flight.is_empty() {
                break;
            }
            let can_submit = !upstream_done && in_flight.len() < pool.size();

            tokio::select! {
                biased;
                () = ctx.cancel_token().cancelled() => {
                    ctx.stop(&input);
                    return;
                }
                Some(joined) = in_flight.next(), if !in_flight.is_empty() => {
                    let result = match joined {
                        Ok(Err(PipelineError::Transform { seq, reason, .. })) => Err(PipelineError::Transform {
                            stage: ctx.name().to_string(),
                            seq,
                            reason,
                        }),
                        Ok(result) => result,
                        Err(_) => Err(PipelineError::WorkerLost(ctx.name().to_string())),
                    };
                    match result {
                        Ok(item) => {
                            if !ctx.emit(&output, item).await {
                                ctx.stop(&input);
                                return;
                            }
                        }
                        Err(err) => {
                            if let Some(fatal) = ctx.item_failed(err) {
                                failure = Some(fatal);
                                break;
                            }
                        }
                    }
                }
                pulled = ctx.pull(&input, &output), if can_submit => match pulled {
                    Pulled::Item(item) => {
                        let seq = item.seq();
                        let submitted = tokio::select! {
                            biased;
                            () = ctx.cancel_token().cancelled() => {
                                ctx.stop(&input);
                                return;
                            }
                            submitted = pool.submit(item, &transform) => submitted,
                        };
                        match submitted {
                            Ok(handle) => {
                                debug!(stage = %ctx.name(), seq, in_flight = pool.in_flight(), "item submitted");
                                in_flight.push(handle);
                            }
                            Err(err) => {
                                failure = Some(err);
                                break;
                            }
                        }
                    }
                    Pulled::End => upstream_done = true,
                    Pulled::Failed(err) => {
                        failure = Some(err);
                        break;
                    }
                    Pulled::Stop => {
                        ctx.stop(&input);
                        return;
                    }
                },
            }
        }

        ctx.finish(&input, &output, failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::BackpressurePolicy;
    use crate::channel::demand_channel;
    use crate::error::{BoxError, ErrorMode};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn delayed_echo() -> AsyncTransform<u64, u64> {
        // Earlier items take longer, so completion order is the reverse of submission order
        AsyncTransform::new(|v: u64| async move {
            tokio::time::sleep(Duration::from_millis(100 - v * 10)).await;
            Ok::<_, BoxError>(v)
        })
    }

    async fn run_stage(config: SchedulerConfig, pool: WorkerPool) -> Vec<u64> {
        let (in_tx, in_rx) = demand_channel("in", 16, BackpressurePolicy::DropNewest);
        let (out_tx, out_rx) = demand_channel("out", 16, BackpressurePolicy::DropNewest);
        for v in 0..5u64 {
            in_tx.send(Item::new(v, v)).await.unwrap();
        }
        in_tx.complete();

        let ctx = StageContext::new(Arc::from("test"), "sched", CancellationToken::new(), ErrorMode::BestEffort);
        SchedulerStage::new(config, pool, delayed_echo())
            .run(in_rx, out_tx, ctx)
            .await;

        out_rx.request_more(5);
        let mut seen = Vec::new();
        while let Some(item) = out_rx.take().await.unwrap() {
            seen.push(item.seq());
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordered_stage_releases_in_submission_order() {
        let seen = run_stage(SchedulerConfig::ordered(), WorkerPool::new("pool", 8)).await;
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unordered_stage_releases_in_completion_order() {
        let seen = run_stage(SchedulerConfig::unordered(), WorkerPool::new("pool", 8)).await;
        assert_eq!(seen, vec![4, 3, 2, 1, 0]);
    }

    #[tokio::test]
    async fn test_submit_returns_item_with_same_seq() {
        let pool = WorkerPool::new("pool", 2);
        let transform = AsyncTransform::new(|s: String| async move { Ok::<_, BoxError>(s.len()) });
        let handle = pool.submit(Item::new(9, "abcd".to_string()), &transform).await.unwrap();
        let out = handle.await.unwrap().unwrap();
        assert_eq!((out.seq(), *out.payload()), (9, 4));
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_submissions() {
        let pool = WorkerPool::new("pool", 1);
        pool.close();
        let transform = AsyncTransform::new(|v: u8| async move { Ok::<_, BoxError>(v) });
        let err = pool.submit(Item::new(0, 1), &transform).await.unwrap_err();
        assert_eq!(err, PipelineError::WorkerLost("pool".into()));
    }

    #[tokio::test]
    async fn test_transform_error_carries_stage_and_seq() {
        let pool = WorkerPool::new("lookup", 1);
        let transform =
            AsyncTransform::new(|_: u8| async move { Err::<u8, BoxError>("not found".into()) });
        let handle = pool.submit(Item::new(3, 0), &transform).await.unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            PipelineError::Transform {
                stage: "lookup".into(),
                seq: 3,
                reason: "not found".into(),
            }
        );
    }
}
