//! Ordered fan-out/fan-in.
//!
//! Items are dealt to `workers` tasks round-robin or by partition key. Every
//! dispatched item gets a dispatch index, and the reassembler releases results
//! strictly by that index, so the output order equals the input order no matter
//! which worker finishes first.

use crate::channel::{ChannelConsumer, ChannelProducer};
use crate::error::{PipelineError, Result};
use crate::item::Item;
use crate::stage::{AsyncTransform, Pulled, StageContext};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

/// Maps a payload to a partition; items with the same key go to the same worker
pub type PartitionFn<T> = Arc<dyn Fn(&T) -> u64 + Send + Sync>;

/// Fan-out settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Items queued per worker before dispatch waits
    pub worker_buffer: usize,
}

impl ParallelConfig {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            worker_buffer: 4,
        }
    }

    pub fn with_worker_buffer(mut self, worker_buffer: usize) -> Self {
        self.worker_buffer = worker_buffer;
        self
    }

    /// Results that may be outstanding before dispatch pauses
    pub fn max_in_flight(&self) -> usize {
        self.workers * (self.worker_buffer + 1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PipelineError::Config("parallel workers must be at least 1".into()));
        }
        if self.worker_buffer == 0 {
            return Err(PipelineError::Config("parallel worker_buffer must be at least 1".into()));
        }
        Ok(())
    }
}

/// Holds out-of-order results until every lower dispatch index is released
#[derive(Debug)]
pub struct Resequencer<T> {
    next: u64,
    parked: BTreeMap<u64, T>,
}

impl<T> Resequencer<T> {
    pub fn new() -> Self {
        Self {
            next: 0,
            parked: BTreeMap::new(),
        }
    }

    /// Accept the result for `index`; returns everything now releasable, in order
    pub fn accept(&mut self, index: u64, value: T) -> Vec<T> {
        self.parked.insert(index, value);
        let mut ready = Vec::new();
        while let Some(value) = self.parked.remove(&self.next) {
            ready.push(value);
            self.next += 1;
        }
        ready
    }

    /// Next index the resequencer is waiting for
    pub fn next_index(&self) -> u64 {
        self.next
    }

    /// Results held back behind a gap
    pub fn parked(&self) -> usize {
        self.parked.len()
    }
}

impl<T> Default for Resequencer<T> {
    fn default() -> Self {
        Self::new()
    }
}

type WorkerResult<O> = (u64, Result<Item<O>>);

/// A stage that spreads a transform over several workers and re-sequences the results
pub struct ParallelStage<I, O> {
    config: ParallelConfig,
    transform: AsyncTransform<I, O>,
    partition: Option<PartitionFn<I>>,
}

impl<I: Send + 'static, O: Send + 'static> ParallelStage<I, O> {
    pub fn new(config: ParallelConfig, transform: AsyncTransform<I, O>) -> Self {
        Self {
            config,
            transform,
            partition: None,
        }
    }

    pub fn config(&self) -> ParallelConfig {
        self.config
    }

    /// Route items by key instead of round-robin
    pub fn with_partition(mut self, partition: PartitionFn<I>) -> Self {
        self.partition = Some(partition);
        self
    }

    fn spawn_workers(
        &self,
        ctx: &StageContext,
        tracker: &TaskTracker,
        stop: &CancellationToken,
        results: &mpsc::UnboundedSender<WorkerResult<O>>,
    ) -> Vec<mpsc::Sender<(u64, Item<I>)>> {
        (0..self.config.workers)
            .map(|worker| {
                let (tx, mut rx) = mpsc::channel::<(u64, Item<I>)>(self.config.worker_buffer);
                let transform = self.transform.clone();
                let results = results.clone();
                let stop = stop.clone();
                let stage = ctx.name().to_string();

                tracker.spawn(async move {
                    loop {
                        let (index, item) = tokio::select! {
                            biased;
                            () = stop.cancelled() => break,
                            next = rx.recv() => match next {
                                Some(next) => next,
                                None => break,
                            },
                        };
                        let (seq, payload) = item.into_parts();
                        let outcome = tokio::select! {
                            biased;
                            () = stop.cancelled() => break,
                            outcome = AssertUnwindSafe(transform.call(payload)).catch_unwind() => outcome,
                        };
                        let result = match outcome {
                            Ok(Ok(out)) => Ok(Item::new(seq, out)),
                            Ok(Err(err)) => Err(PipelineError::transform(&stage, seq, err)),
                            Err(_) => Err(PipelineError::WorkerLost(format!("{stage}#{worker}"))),
                        };
                        trace!(stage = %stage, worker, seq, index, "worker finished item");
                        if results.send((index, result)).is_err() {
                            break;
                        }
                    }
                });
                tx
            })
            .collect()
    }

    pub async fn run(
        self,
        input: ChannelConsumer<I>,
        output: ChannelProducer<O>,
        ctx: StageContext,
        tracker: TaskTracker,
    ) {
        let stop = ctx.cancel_token().child_token();
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();
        let workers = self.spawn_workers(&ctx, &tracker, &stop, &results_tx);
        drop(results_tx);

        let max_in_flight = self.config.max_in_flight() as u64;
        let mut resequencer = Resequencer::new();
        let mut dispatched: u64 = 0;
        let mut upstream_done = false;
        let mut failure = None;

        debug!(stage = %ctx.name(), workers = workers.len(), "fan-out started");

        'run: loop {
            let released = resequencer.next_index();
            if upstream_done && released == dispatched {
                break;
            }
            let can_dispatch = !upstream_done && dispatched - released < max_in_flight;

            tokio::select! {
                biased;
                () = ctx.cancel_token().cancelled() => {
                    ctx.stop(&input);
                    break 'run;
                }
                Some((index, result)) = results_rx.recv() => {
                    for result in resequencer.accept(index, result) {
                        match result {
                            Ok(item) => {
                                if !ctx.emit(&output, item).await {
                                    ctx.stop(&input);
                                    break 'run;
                                }
                            }
                            Err(err) => {
                                if let Some(fatal) = ctx.item_failed(err) {
                                    failure = Some(fatal);
                                    break 'run;
                                }
                            }
                        }
                    }
                    if resequencer.parked() > 0 {
                        trace!(stage = %ctx.name(), parked = resequencer.parked(), waiting_for = resequencer.next_index(), "holding out-of-order results");
                    }
                }
                pulled = ctx.pull(&input, &output), if can_dispatch => match pulled {
                    Pulled::Item(item) => {
                        let worker = match &self.partition {
                            Some(key) => (key(item.payload()) % workers.len() as u64) as usize,
                            None => (dispatched % workers.len() as u64) as usize,
                        };
                        let index = dispatched;
                        dispatched += 1;
                        let sent = tokio::select! {
                            biased;
                            () = ctx.cancel_token().cancelled() => {
                                ctx.stop(&input);
                                break 'run;
                            }
                            sent = workers[worker].send((index, item)) => sent,
                        };
                        if sent.is_err() {
                            failure = Some(PipelineError::WorkerLost(format!("{}#{worker}", ctx.name())));
                            break 'run;
                        }
                    }
                    Pulled::End => upstream_done = true,
                    Pulled::Failed(err) => {
                        failure = Some(err);
                        break 'run;
                    }
                    Pulled::Stop => {
                        ctx.stop(&input);
                        break 'run;
                    }
                },
                else => {
                    failure = Some(PipelineError::WorkerLost(ctx.name().to_string()));
                    break 'run;
                }
            }
        }

        stop.cancel();
        drop(workers);
        if !ctx.is_cancelled() && (failure.is_some() || upstream_done) {
            ctx.finish(&input, &output, failure);
        }
        debug!(stage = %ctx.name(), dispatched, "fan-out stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::BackpressurePolicy;
    use crate::channel::demand_channel;
    use crate::error::{BoxError, ErrorMode};
    use std::time::Duration;

    #[test]
    fn test_resequencer_releases_in_order() {
        let mut reseq = Resequencer::new();
        assert!(reseq.accept(2, 'c').is_empty());
        assert!(reseq.accept(1, 'b').is_empty());
        assert_eq!(reseq.parked(), 2);
        assert_eq!(reseq.accept(0, 'a'), vec!['a', 'b', 'c']);
        assert_eq!(reseq.next_index(), 3);
        assert_eq!(reseq.accept(3, 'd'), vec!['d']);
    }

    async fn run_parallel(
        workers: usize,
        mode: ErrorMode,
        transform: AsyncTransform<u64, u64>,
        count: u64,
    ) -> (Vec<u64>, Option<PipelineError>) {
        let (in_tx, in_rx) = demand_channel("in", 64, BackpressurePolicy::DropNewest);
        let (out_tx, out_rx) = demand_channel("out", 64, BackpressurePolicy::DropNewest);
        for v in 0..count {
            in_tx.send(Item::new(v, v)).await.unwrap();
        }
        in_tx.complete();

        let ctx = StageContext::new(Arc::from("test"), "fan", CancellationToken::new(), mode);
        let tracker = TaskTracker::new();
        ParallelStage::new(ParallelConfig::new(workers), transform)
            .run(in_rx, out_tx, ctx, tracker.clone())
            .await;
        tracker.close();
        tracker.wait().await;

        out_rx.request_more(count.max(1));
        let mut seen = Vec::new();
        loop {
            match out_rx.take().await {
                Ok(Some(item)) => seen.push(*item.payload()),
                Ok(None) => return (seen, None),
                Err(err) => return (seen, Some(err)),
            }
        }
    }

    fn variable_delay() -> AsyncTransform<u64, u64> {
        AsyncTransform::new(|v: u64| async move {
            let delay = (v * 37) % 11;
            tokio::time::sleep(Duration::from_millis(delay * 10)).await;
            Ok::<_, BoxError>(v * 10)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_order_matches_input_for_any_worker_count() {
        for workers in 1..=4 {
            let (seen, err) = run_parallel(workers, ErrorMode::BestEffort, variable_delay(), 20).await;
            assert!(err.is_none());
            assert_eq!(seen, (0..20).map(|v| v * 10).collect::<Vec<_>>(), "workers = {workers}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_skips_failed_item() {
        let transform = AsyncTransform::new(|v: u64| async move {
            if v == 3 {
                return Err::<u64, BoxError>("bad record".into());
            }
            tokio::time::sleep(Duration::from_millis(10 * (5 - v.min(5)))).await;
            Ok(v)
        });
        let (seen, err) = run_parallel(3, ErrorMode::BestEffort, transform, 6).await;
        assert!(err.is_none());
        assert_eq!(seen, vec![0, 1, 2, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_mode_fails_after_earlier_items() {
        let transform = AsyncTransform::new(|v: u64| async move {
            if v == 2 {
                return Err::<u64, BoxError>("bad record".into());
            }
            Ok(v)
        });
        let (seen, err) = run_parallel(2, ErrorMode::Strict, transform, 6).await;
        assert_eq!(seen, vec![0, 1]);
        assert!(matches!(err, Some(PipelineError::Transform { seq: 2, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partitioned_dispatch_keeps_order() {
        let (in_tx, in_rx) = demand_channel("in", 64, BackpressurePolicy::DropNewest);
        let (out_tx, out_rx) = demand_channel("out", 64, BackpressurePolicy::DropNewest);
        for v in 0..12u64 {
            in_tx.send(Item::new(v, v)).await.unwrap();
        }
        in_tx.complete();

        let ctx = StageContext::new(Arc::from("test"), "keyed", CancellationToken::new(), ErrorMode::BestEffort);
        let stage = ParallelStage::new(ParallelConfig::new(3), variable_delay())
            .with_partition(Arc::new(|v: &u64| v % 2));
        stage.run(in_rx, out_tx, ctx, TaskTracker::new()).await;

        out_rx.request_more(12);
        let mut seqs = Vec::new();
        while let Some(item) = out_rx.take().await.unwrap() {
            seqs.push(item.seq());
        }
        assert_eq!(seqs, (0..12).collect::<Vec<_>>());
    }
}
