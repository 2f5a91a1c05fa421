//! Demand channel: a bounded, mutex-guarded queue with an explicit demand counter.
//!
//! Producers either `offer` (the configured [`BackpressurePolicy`] decides what
//! happens when the queue is full) or `send` (wait for room). The single
//! consumer declares demand with `request_more` and pulls with `take`; an
//! item is only handed over against outstanding demand. Producers that want
//! to generate lazily wait with `wait_for_demand`.
//!
//! Terminal signals are one-shot: the first `complete` or `fail` wins. Items
//! buffered before a completion or an upstream failure are still delivered;
//! an overflow under [`BackpressurePolicy::ErrorOnOverflow`] fails every
//! subsequent call immediately.

use crate::backpressure::{BackpressureOutcome, BackpressurePolicy, OverflowAction};
use crate::error::{PipelineError, Result};
use crate::item::Item;
use crate::metrics::StageMetrics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
enum Terminal {
    Completed,
    Failed(PipelineError),
}

#[derive(Debug)]
struct State<T> {
    buffer: VecDeque<Item<T>>,
    /// Outstanding demand granted by the consumer
    demand: u64,
    granted: u64,
    delivered: u64,
    terminal: Option<Terminal>,
    overflowed: bool,
    cancelled: bool,
}

#[derive(Debug)]
struct Shared<T> {
    name: String,
    capacity: usize,
    policy: BackpressurePolicy,
    state: Mutex<State<T>>,
    /// Wakes the consumer when an item or a terminal signal arrives
    item_ready: Notify,
    /// Wakes producers when room, demand or cancellation appears
    space_ready: Notify,
    producers: AtomicUsize,
    metrics: StageMetrics,
}

impl<T> Shared<T> {
    fn overflow_error(&self) -> PipelineError {
        PipelineError::Overflow {
            channel: self.name.clone(),
            capacity: self.capacity,
        }
    }

    /// Rejects producer calls on a channel that can no longer accept items
    fn check_writable(&self, state: &State<T>) -> Result<()> {
        if state.overflowed {
            return Err(self.overflow_error());
        }
        if state.cancelled || state.terminal.is_some() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    fn finish(&self, terminal: Terminal) -> bool {
        let mut state = self.state.lock();
        if state.terminal.is_some() || state.overflowed {
            return false;
        }
        state.terminal = Some(terminal);
        drop(state);
        self.item_ready.notify_one();
        self.space_ready.notify_waiters();
        true
    }
}

/// Create a demand channel and return its producer and consumer halves
pub fn demand_channel<T>(
    name: impl Into<String>,
    capacity: usize,
    policy: BackpressurePolicy,
) -> (ChannelProducer<T>, ChannelConsumer<T>) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        name: name.into(),
        capacity,
        policy,
        state: Mutex::new(State {
            buffer: VecDeque::with_capacity(capacity.min(1024)),
            demand: 0,
            granted: 0,
            delivered: 0,
            terminal: None,
            overflowed: false,
            cancelled: false,
        }),
        item_ready: Notify::new(),
        space_ready: Notify::new(),
        producers: AtomicUsize::new(1),
        metrics: StageMetrics::new(),
    });
    (
        ChannelProducer {
            shared: Arc::clone(&shared),
        },
        ChannelConsumer { shared },
    )
}

/// Producer half; clones share the same buffer and capacity
#[derive(Debug)]
pub struct ChannelProducer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ChannelProducer<T> {
    fn clone(&self) -> Self {
        self.shared.producers.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for ChannelProducer<T> {
    fn drop(&mut self) {
        if self.shared.producers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.finish(Terminal::Completed);
        }
    }
}

impl<T> ChannelProducer<T> {
    /// Offer an item without waiting; the policy decides when the channel is full.
    ///
    /// Returns `Cancelled` once the consumer cancelled or the channel was closed,
    /// and `Overflow` after an error-on-overflow failure.
    pub fn offer(&self, item: Item<T>) -> Result<BackpressureOutcome> {
        let shared = &self.shared;
        let seq = item.seq();
        let mut evicted = None;

        let (outcome, occupancy) = {
            let mut state = shared.state.lock();
            shared.check_writable(&state)?;

            let action = shared.policy.decide(state.buffer.len(), shared.capacity);
            match action {
                OverflowAction::Enqueue => state.buffer.push_back(item),
                OverflowAction::RejectIncoming => drop(item),
                OverflowAction::EvictOldest => {
                    evicted = state.buffer.pop_front().map(|old| old.seq());
                    state.buffer.push_back(item);
                }
                OverflowAction::Fail => {
                    state.overflowed = true;
                    state.buffer.clear();
                }
            }
            (action.outcome(), state.buffer.len())
        };

        shared.metrics.record_outcome(outcome);
        match outcome {
            BackpressureOutcome::Enqueued => {
                trace!(channel = %shared.name, seq, occupancy, "item enqueued");
                shared.item_ready.notify_one();
            }
            BackpressureOutcome::Dropped => {
                debug!(channel = %shared.name, seq, outcome = %outcome, "backpressure dropped incoming item");
            }
            BackpressureOutcome::Replaced => {
                debug!(
                    channel = %shared.name,
                    seq,
                    evicted_seq = ?evicted,
                    outcome = %outcome,
                    "backpressure evicted oldest item"
                );
                shared.item_ready.notify_one();
            }
            BackpressureOutcome::Failed => {
                warn!(
                    channel = %shared.name,
                    seq,
                    capacity = shared.capacity,
                    outcome = %outcome,
                    "channel overflowed, failing stream"
                );
                shared.item_ready.notify_one();
                shared.space_ready.notify_waiters();
            }
        }
        Ok(outcome)
    }

    /// Push an item, waiting for room instead of applying the overflow policy
    pub async fn send(&self, item: Item<T>) -> Result<()> {
        let shared = &self.shared;
        let mut pending = Some(item);
        let mut blocked = false;

        loop {
            let notified = shared.space_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = shared.state.lock();
                shared.check_writable(&state)?;
                if !shared.policy.is_bounded() || state.buffer.len() < shared.capacity {
                    if let Some(item) = pending.take() {
                        state.buffer.push_back(item);
                    }
                    drop(state);
                    shared.metrics.record_processed();
                    shared.item_ready.notify_one();
                    return Ok(());
                }
            }

            if !blocked {
                blocked = true;
                shared.metrics.record_block();
            }
            notified.await;
        }
    }

    /// Wait until the consumer wants more items than are already buffered
    pub async fn wait_for_demand(&self) -> Result<()> {
        let shared = &self.shared;
        loop {
            let notified = shared.space_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = shared.state.lock();
                shared.check_writable(&state)?;
                if state.demand > state.buffer.len() as u64 {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Resolves once the consumer has cancelled
    pub async fn closed(&self) {
        let shared = &self.shared;
        loop {
            let notified = shared.space_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if shared.state.lock().cancelled {
                return;
            }
            notified.await;
        }
    }

    /// Signal completion; returns false if a terminal signal was already sent
    pub fn complete(&self) -> bool {
        self.shared.finish(Terminal::Completed)
    }

    /// Signal a fatal error; returns false if a terminal signal was already sent
    pub fn fail(&self, err: PipelineError) -> bool {
        self.shared.finish(Terminal::Failed(err))
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }

    pub fn outstanding_demand(&self) -> u64 {
        self.shared.state.lock().demand
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.shared.metrics
    }
}

/// Consumer half; there is exactly one per channel
#[derive(Debug)]
pub struct ChannelConsumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Drop for ChannelConsumer<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<T> ChannelConsumer<T> {
    /// Declare willingness to receive `n` more items
    pub fn request_more(&self, n: u64) {
        if n == 0 {
            return;
        }
        let demand = {
            let mut state = self.shared.state.lock();
            state.demand = state.demand.saturating_add(n);
            state.granted = state.granted.saturating_add(n);
            state.demand
        };
        trace!(channel = %self.shared.name, requested = n, demand, "demand granted");
        self.shared.space_ready.notify_waiters();
        self.shared.item_ready.notify_one();
    }

    /// Take the next item, suspending until one arrives and demand allows it.
    ///
    /// Each item consumes one unit of demand; with none outstanding the call
    /// waits for `request_more` even if items are buffered. `Ok(None)` marks
    /// the end of the stream once the buffer is drained.
    pub async fn take(&self) -> Result<Option<Item<T>>> {
        let shared = &self.shared;
        loop {
            let notified = shared.item_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = shared.state.lock();
                if state.overflowed {
                    return Err(shared.overflow_error());
                }
                if state.cancelled {
                    return Err(PipelineError::Cancelled);
                }
                if !state.buffer.is_empty() {
                    if state.demand > 0 {
                        if let Some(item) = state.buffer.pop_front() {
                            state.demand -= 1;
                            state.delivered += 1;
                            drop(state);
                            shared.space_ready.notify_waiters();
                            return Ok(Some(item));
                        }
                    }
                } else {
                    match &state.terminal {
                        Some(Terminal::Completed) => return Ok(None),
                        Some(Terminal::Failed(err)) => return Err(err.clone()),
                        None => {}
                    }
                }
            }
            notified.await;
        }
    }

    /// Take with a bounded wait; an elapsed wait surfaces as `Timeout`
    pub async fn take_timeout(&self, timeout: Duration) -> Result<Option<Item<T>>> {
        match tokio::time::timeout(timeout, self.take()).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(timeout)),
        }
    }

    /// Stop accepting items and release everything buffered
    pub fn cancel(&self) {
        let released = {
            let mut state = self.shared.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            let released = state.buffer.len();
            state.buffer.clear();
            released
        };
        if released > 0 {
            debug!(channel = %self.shared.name, released, "channel cancelled with buffered items");
        }
        self.shared.space_ready.notify_waiters();
        self.shared.item_ready.notify_one();
    }

    pub fn outstanding_demand(&self) -> u64 {
        self.shared.state.lock().demand
    }

    /// Total demand granted over the channel's lifetime
    pub fn granted_demand(&self) -> u64 {
        self.shared.state.lock().granted
    }

    /// Total items handed to the consumer
    pub fn delivered(&self) -> u64 {
        self.shared.state.lock().delivered
    }

    /// Sequence numbers currently buffered, oldest first
    pub fn buffered_sequences(&self) -> Vec<u64> {
        self.shared
            .state
            .lock()
            .buffer
            .iter()
            .map(Item::seq)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Occupancy as a percentage of capacity; may exceed 100 when unbounded
    pub fn utilization(&self) -> u32 {
        ((self.len() * 100) / self.shared.capacity) as u32
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.shared.policy
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.shared.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer_range<T: Copy>(tx: &ChannelProducer<T>, values: &[T]) -> Vec<BackpressureOutcome> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| tx.offer(Item::new(i as u64, *v)).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_offer_take_in_order() {
        let (tx, rx) = demand_channel("test", 4, BackpressurePolicy::DropNewest);
        offer_range(&tx, &[10, 20, 30]);
        tx.complete();
        rx.request_more(3);

        let mut seen = Vec::new();
        while let Some(item) = rx.take().await.unwrap() {
            seen.push(item.into_payload());
        }
        assert_eq!(seen, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_drop_newest_rejects_incoming() {
        let (tx, rx) = demand_channel("drop", 2, BackpressurePolicy::DropNewest);
        let outcomes = offer_range(&tx, &[1, 2, 3, 4]);
        assert_eq!(
            outcomes,
            vec![
                BackpressureOutcome::Enqueued,
                BackpressureOutcome::Enqueued,
                BackpressureOutcome::Dropped,
                BackpressureOutcome::Dropped,
            ]
        );
        assert_eq!(rx.buffered_sequences(), vec![0, 1]);
        assert_eq!(rx.metrics().total_dropped(), 2);
    }

    #[tokio::test]
    async fn test_keep_latest_holds_most_recent() {
        let (tx, rx) = demand_channel("latest", 3, BackpressurePolicy::KeepLatest);
        for seq in 0..10u64 {
            tx.offer(Item::new(seq, seq)).unwrap();
            let start = seq.saturating_sub(2);
            let expected: Vec<u64> = (start..=seq).collect();
            assert_eq!(rx.buffered_sequences(), expected);
        }

        rx.request_more(1);
        let first = rx.take().await.unwrap().unwrap();
        assert_eq!(first.seq(), 7);
        tx.offer(Item::new(10, 10)).unwrap();
        assert_eq!(rx.buffered_sequences(), vec![8, 9, 10]);
        assert_eq!(rx.metrics().total_replaced(), 7);
    }

    #[tokio::test]
    async fn test_error_on_overflow_is_terminal() {
        let (tx, rx) = demand_channel("strict", 2, BackpressurePolicy::ErrorOnOverflow);
        let outcomes = offer_range(&tx, &[1, 2, 3]);
        assert_eq!(outcomes[2], BackpressureOutcome::Failed);

        let err = tx.offer(Item::new(3, 4)).unwrap_err();
        assert!(matches!(err, PipelineError::Overflow { capacity: 2, .. }));
        let err = rx.take().await.unwrap_err();
        assert!(matches!(err, PipelineError::Overflow { .. }));
        assert!(!tx.complete());
    }

    #[tokio::test]
    async fn test_unbounded_buffer_grows() {
        let (tx, rx) = demand_channel("unbounded", 2, BackpressurePolicy::UnboundedBuffer);
        let outcomes = offer_range(&tx, &[0u8; 50]);
        assert!(outcomes.iter().all(|o| *o == BackpressureOutcome::Enqueued));
        assert_eq!(rx.len(), 50);
        assert_eq!(rx.utilization(), 2500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_waits_for_demand() {
        let (tx, rx) = demand_channel("demand", 8, BackpressurePolicy::DropNewest);
        rx.request_more(2);
        assert_eq!(tx.outstanding_demand(), 2);
        offer_range(&tx, &[1, 2, 3]);

        rx.take().await.unwrap();
        rx.take().await.unwrap();
        assert_eq!(rx.outstanding_demand(), 0);

        let err = rx.take_timeout(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, PipelineError::Timeout(Duration::from_millis(20)));
        assert_eq!(rx.buffered_sequences(), vec![2]);
        assert_eq!(rx.delivered(), 2);

        rx.request_more(1);
        assert_eq!(rx.take().await.unwrap().unwrap().seq(), 2);
        assert_eq!(rx.delivered(), rx.granted_demand());
    }

    #[tokio::test]
    async fn test_request_more_wakes_waiting_consumer() {
        let (tx, rx) = demand_channel("wake", 4, BackpressurePolicy::DropNewest);
        tx.offer(Item::new(0, 'a')).unwrap();
        tx.complete();

        let rx = Arc::new(rx);
        let consumer = {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move { rx.take().await })
        };
        tokio::task::yield_now().await;
        assert!(!consumer.is_finished(), "buffered item must wait for demand");

        rx.request_more(1);
        assert_eq!(consumer.await.unwrap().unwrap().unwrap().into_payload(), 'a');
        assert!(rx.take().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_buffered_items_drain_before_failure() {
        let (tx, rx) = demand_channel("fail", 4, BackpressurePolicy::DropNewest);
        offer_range(&tx, &[1, 2]);
        tx.fail(PipelineError::Source("db gone".into()));
        assert!(!tx.complete());
        rx.request_more(2);

        assert_eq!(rx.take().await.unwrap().unwrap().into_payload(), 1);
        assert_eq!(rx.take().await.unwrap().unwrap().into_payload(), 2);
        assert_eq!(
            rx.take().await.unwrap_err(),
            PipelineError::Source("db gone".into())
        );
    }

    #[tokio::test]
    async fn test_send_waits_for_room() {
        let (tx, rx) = demand_channel("paced", 1, BackpressurePolicy::DropNewest);
        rx.request_more(2);
        tx.send(Item::new(0, 'a')).await.unwrap();

        let sender = tx.clone();
        let pending = tokio::spawn(async move { sender.send(Item::new(1, 'b')).await });
        tokio::task::yield_now().await;
        assert_eq!(rx.len(), 1);

        assert_eq!(rx.take().await.unwrap().unwrap().into_payload(), 'a');
        pending.await.unwrap().unwrap();
        assert_eq!(rx.take().await.unwrap().unwrap().into_payload(), 'b');
        assert_eq!(rx.metrics().total_blocks(), 1);
    }

    #[tokio::test]
    async fn test_cancel_wakes_blocked_sender() {
        let (tx, rx) = demand_channel("cancel", 1, BackpressurePolicy::DropNewest);
        tx.send(Item::new(0, 0)).await.unwrap();

        let sender = tx.clone();
        let pending = tokio::spawn(async move { sender.send(Item::new(1, 1)).await });
        tokio::task::yield_now().await;
        rx.cancel();

        assert_eq!(pending.await.unwrap(), Err(PipelineError::Cancelled));
        assert!(tx.is_cancelled());
        assert_eq!(tx.offer(Item::new(2, 2)), Err(PipelineError::Cancelled));
        tx.closed().await;
    }

    #[tokio::test]
    async fn test_wait_for_demand() {
        let (tx, rx) = demand_channel::<u32>("pull", 4, BackpressurePolicy::DropNewest);
        let producer = tx.clone();
        let waiter = tokio::spawn(async move { producer.wait_for_demand().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        rx.request_more(1);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_timeout() {
        let (_tx, rx) = demand_channel::<u32>("slow", 4, BackpressurePolicy::DropNewest);
        let err = rx.take_timeout(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err, PipelineError::Timeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_dropping_last_producer_completes() {
        let (tx, rx) = demand_channel("drop-tx", 4, BackpressurePolicy::DropNewest);
        let second = tx.clone();
        tx.offer(Item::new(0, 1)).unwrap();
        drop(tx);
        second.offer(Item::new(1, 2)).unwrap();
        drop(second);
        rx.request_more(2);

        assert!(rx.take().await.unwrap().is_some());
        assert!(rx.take().await.unwrap().is_some());
        assert!(rx.take().await.unwrap().is_none());
    }
}
