use crate::backpressure::BackpressureOutcome;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding window of latency samples used for percentile estimates
#[derive(Debug, Clone)]
pub struct PercentileTracker {
    samples: Arc<Mutex<VecDeque<u64>>>,
    window_size: usize,
}

impl PercentileTracker {
    /// Create a tracker that keeps the last `window_size` samples
    pub fn new(window_size: usize) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size: window_size.max(1),
        }
    }

    /// Record a sample in nanoseconds
    pub fn record(&self, nanos: u64) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.window_size {
            samples.pop_front();
        }
        samples.push_back(nanos);
    }

    pub fn p50_us(&self) -> f64 {
        self.percentile(0.50)
    }

    pub fn p99_us(&self) -> f64 {
        self.percentile(0.99)
    }

    fn percentile(&self, p: f64) -> f64 {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return 0.0;
        }

        let mut sorted: Vec<_> = samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        sorted[idx] as f64 / 1000.0
    }

    /// Number of samples currently held
    pub fn count(&self) -> usize {
        self.samples.lock().len()
    }
}

type Counter = Arc<CachePadded<AtomicU64>>;

fn counter() -> Counter {
    Arc::new(CachePadded::new(AtomicU64::new(0)))
}

/// Counters shared by a stage or a channel and everything observing it
#[derive(Debug, Clone)]
pub struct StageMetrics {
    /// Items that made it through (processed by a stage, enqueued by a channel)
    processed: Counter,
    /// Items discarded by a drop-newest policy or filtered out
    dropped: Counter,
    /// Items evicted by a keep-latest policy
    replaced: Counter,
    /// Overflow failures
    failed: Counter,
    /// Per-item transform errors that were skipped
    errors: Counter,
    /// Times a producer had to wait for room
    blocks: Counter,
    latency: PercentileTracker,
    start_time: Instant,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self {
            processed: counter(),
            dropped: counter(),
            replaced: counter(),
            failed: counter(),
            errors: counter(),
            blocks: counter(),
            latency: PercentileTracker::new(1000),
            start_time: Instant::now(),
        }
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Count the outcome of one `offer`
    pub fn record_outcome(&self, outcome: BackpressureOutcome) {
        let counter = match outcome {
            BackpressureOutcome::Enqueued => &self.processed,
            BackpressureOutcome::Dropped => &self.dropped,
            BackpressureOutcome::Replaced => &self.replaced,
            BackpressureOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a latency measurement in nanoseconds
    pub fn record_latency(&self, nanos: u64) {
        self.latency.record(nanos);
    }

    pub fn record_elapsed(&self, elapsed: Duration) {
        self.record_latency(elapsed.as_nanos().min(u64::MAX as u128) as u64);
    }

    pub fn total_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn total_replaced(&self) -> u64 {
        self.replaced.load(Ordering::Relaxed)
    }

    pub fn total_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn total_blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Items handed to this stage or channel, whatever became of them
    pub fn total_offered(&self) -> u64 {
        self.total_processed() + self.total_dropped() + self.total_replaced() + self.total_failed()
    }

    /// Processed items per second since creation
    pub fn throughput_ips(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_processed() as f64 / elapsed
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_processed: self.total_processed(),
            total_dropped: self.total_dropped(),
            total_replaced: self.total_replaced(),
            total_failed: self.total_failed(),
            total_errors: self.total_errors(),
            total_blocks: self.total_blocks(),
            throughput_ips: self.throughput_ips(),
            latency_p50_us: self.latency.p50_us(),
            latency_p99_us: self.latency.p99_us(),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_processed: u64,
    pub total_dropped: u64,
    pub total_replaced: u64,
    pub total_failed: u64,
    pub total_errors: u64,
    pub total_blocks: u64,
    pub throughput_ips: f64,
    pub latency_p50_us: f64,
    pub latency_p99_us: f64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Processed: {}, Dropped: {}, Replaced: {}, Failed: {}, Errors: {}, Blocks: {}, \
             Throughput: {:.2} items/s, Latency P50: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.total_processed,
            self.total_dropped,
            self.total_replaced,
            self.total_failed,
            self.total_errors,
            self.total_blocks,
            self.throughput_ips,
            self.latency_p50_us,
            self.latency_p99_us,
            self.elapsed.as_secs_f64()
        )
    }
}
