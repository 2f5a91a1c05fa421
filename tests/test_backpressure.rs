use async_trait::async_trait;
use flowgate::{
    BackpressurePolicy, BoxError, ChannelSource, CollectSink, Item, IterSource, PipelineBuilder, PipelineConfig,
    PipelineError, PipelineReport, Sink, SinkSignal,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Collects items, pausing before each one to model a slow client
struct SlowSink<T> {
    delay: Duration,
    inner: CollectSink<T>,
}

impl<T> SlowSink<T> {
    fn new(delay_ms: u64, inner: CollectSink<T>) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            inner,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Sink<T> for SlowSink<T> {
    async fn on_item(&mut self, item: Item<T>) -> Result<SinkSignal, BoxError> {
        tokio::time::sleep(self.delay).await;
        self.inner.on_item(item).await
    }

    async fn on_complete(&mut self) {
        self.inner.on_complete().await
    }

    async fn on_error(&mut self, err: &PipelineError) {
        self.inner.on_error(err).await
    }
}

/// Holds every item until the test hands out a permit for it
struct GatedSink {
    gate: Arc<Semaphore>,
    inner: CollectSink<u64>,
}

#[async_trait]
impl Sink<u64> for GatedSink {
    async fn on_item(&mut self, item: Item<u64>) -> Result<SinkSignal, BoxError> {
        self.gate.acquire().await?.forget();
        self.inner.on_item(item).await
    }

    async fn on_complete(&mut self) {
        self.inner.on_complete().await
    }
}

fn config(policy: BackpressurePolicy, capacity: usize) -> PipelineConfig {
    PipelineConfig::default()
        .with_policy(policy)
        .with_capacity(capacity)
        .with_sink_prefetch(1)
}

async fn run_slow(policy: BackpressurePolicy, capacity: usize, count: u32) -> (CollectSink<u32>, PipelineReport) {
    let sink = CollectSink::new();
    let report = PipelineBuilder::new("slow", config(policy, capacity))
        .source(IterSource::new("fast", 0..count))
        .run(SlowSink::new(5, sink.clone()))
        .expect("pipeline start failed")
        .join()
        .await
        .expect("pipeline failed");
    (sink, report)
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_buffer_delivers_everything_in_order() {
    let (sink, report) = run_slow(BackpressurePolicy::UnboundedBuffer, 4, 300).await;

    assert!(report.is_completed());
    assert_eq!(sink.payloads(), (0..300).collect::<Vec<_>>());
    assert_eq!(report.stage("sink-edge").unwrap().total_dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn test_drop_newest_accounts_for_every_item() {
    let (sink, report) = run_slow(BackpressurePolicy::DropNewest, 4, 200).await;
    let edge = report.stage("sink-edge").unwrap();

    assert!(report.is_completed());
    assert!(edge.total_dropped > 0);
    assert_eq!(edge.total_dropped + report.delivered, 200);
    assert_eq!(report.delivered, sink.len() as u64);

    let seqs = sink.sequences();
    assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(seqs.first(), Some(&0));
}

#[tokio::test(start_paused = true)]
async fn test_keep_latest_ends_with_most_recent_items() {
    let (sink, report) = run_slow(BackpressurePolicy::KeepLatest, 4, 100).await;
    let edge = report.stage("sink-edge").unwrap();

    assert!(report.is_completed());
    assert!(edge.total_replaced > 0);
    assert_eq!(edge.total_replaced + report.delivered, 100);

    let seqs = sink.sequences();
    assert!(seqs.ends_with(&[96, 97, 98, 99]));
    assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test(start_paused = true)]
async fn test_keep_latest_buffers_most_recent_undelivered_items() {
    let (tx, source) = ChannelSource::channel(64);
    let gate = Arc::new(Semaphore::new(0));
    let collected = CollectSink::new();
    let running = PipelineBuilder::new("latest", config(BackpressurePolicy::KeepLatest, 4))
        .source(source)
        .run(GatedSink {
            gate: Arc::clone(&gate),
            inner: collected.clone(),
        })
        .unwrap();
    let settle = || tokio::time::sleep(Duration::from_millis(10));

    // The sink holds item 0 while 1..=9 pile up behind it
    tx.send(0u64).await.unwrap();
    settle().await;
    for v in 1..10 {
        tx.send(v).await.unwrap();
    }
    settle().await;
    let edge = running.stage_metrics("sink-edge").unwrap().clone();
    assert_eq!(edge.total_replaced(), 5);
    assert!(collected.is_empty());

    // Item 0 lands, the oldest survivor (6) is handed over and held, 7..=9 stay buffered
    gate.add_permits(1);
    settle().await;
    assert_eq!(collected.sequences(), vec![0]);

    for v in 10..20 {
        tx.send(v).await.unwrap();
    }
    settle().await;
    assert_eq!(edge.total_replaced(), 14);

    drop(tx);
    gate.add_permits(100);
    let report = running.join().await.unwrap();

    assert!(report.is_completed());
    assert_eq!(collected.sequences(), vec![0, 6, 16, 17, 18, 19]);
    assert_eq!(edge.total_replaced() + report.delivered, 20);
}

#[tokio::test(start_paused = true)]
async fn test_error_on_overflow_fails_the_stream() {
    let sink = CollectSink::new();
    let err = PipelineBuilder::new("strict-edge", config(BackpressurePolicy::ErrorOnOverflow, 2))
        .source(IterSource::new("fast", 0..50u32))
        .run(SlowSink::new(5, sink.clone()))
        .unwrap()
        .join()
        .await
        .unwrap_err();

    assert_eq!(
        err,
        PipelineError::Overflow {
            channel: "strict-edge.sink".into(),
            capacity: 2,
        }
    );
    assert_eq!(sink.error(), Some(err));
    assert!(!sink.is_complete());
    assert!(sink.len() < 50);
}

#[tokio::test]
async fn test_fast_sink_sees_no_backpressure() {
    let sink = CollectSink::new();
    let report = PipelineBuilder::new("fast", config(BackpressurePolicy::ErrorOnOverflow, 64))
        .source(IterSource::new("fast", 0..32u32))
        .run(sink.clone())
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(report.delivered, 32);
    assert_eq!(report.stage("sink-edge").unwrap().total_failed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_internal_edges_pace_instead_of_dropping() {
    let sink = CollectSink::new();
    let report = PipelineBuilder::new(
        "paced",
        config(BackpressurePolicy::UnboundedBuffer, 1).with_stage_buffer(2),
    )
    .source(IterSource::new("fast", 0..50u32))
    .map("inc", |v| v + 1)
    .delay_elements(Duration::from_millis(1))
    .run(SlowSink::new(1, sink.clone()))
    .unwrap()
    .join()
    .await
    .unwrap();

    assert_eq!(sink.payloads(), (1..51).collect::<Vec<_>>());
    assert!(report.stage("fast").unwrap().total_processed == 50);
    assert!(report.stage("inc").unwrap().total_processed == 50);
}
