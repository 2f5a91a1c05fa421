use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flowgate::{
    demand_channel, BackpressurePolicy, BoxError, Item, IterSource, PipelineBuilder, PipelineConfig, Sink,
    SinkSignal,
};
use std::time::Duration;
use tokio::runtime::Runtime;

/// Consumer that yields to the runtime after each item, slower than the source
struct SlowSink;

#[async_trait]
impl Sink<Vec<u8>> for SlowSink {
    async fn on_item(&mut self, item: Item<Vec<u8>>) -> Result<SinkSignal, BoxError> {
        black_box(item);
        tokio::time::sleep(Duration::from_micros(50)).await;
        Ok(SinkSignal::Continue)
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("Runtime build failed")
}

fn benchmark_slow_consumer_policies(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("slow_consumer_1000_items");
    for policy in [
        BackpressurePolicy::DropNewest,
        BackpressurePolicy::KeepLatest,
        BackpressurePolicy::UnboundedBuffer,
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(policy), &policy, |b, &policy| {
            b.iter(|| {
                rt.block_on(async {
                    let config = PipelineConfig::default().with_policy(policy).with_capacity(100);
                    PipelineBuilder::new("bench", config)
                        .source(IterSource::new("bytes", (0..1000u32).map(|i| vec![i as u8; 64])))
                        .run(SlowSink)
                        .expect("Start failed")
                        .join()
                        .await
                        .expect("Run failed");
                })
            });
        });
    }
    group.finish();
}

fn benchmark_offer_under_pressure(c: &mut Criterion) {
    let mut group = c.benchmark_group("offer_full_channel_2000_items");
    for policy in [BackpressurePolicy::DropNewest, BackpressurePolicy::KeepLatest] {
        group.bench_with_input(BenchmarkId::from_parameter(policy), &policy, |b, &policy| {
            b.iter(|| {
                let (tx, rx) = demand_channel::<u64>("bench", 200, policy);
                for seq in 0..2000 {
                    let _ = black_box(tx.offer(Item::new(seq, seq)));
                }
                black_box(rx.len())
            });
        });
    }
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(15))
        .sample_size(20);
    targets = benchmark_slow_consumer_policies, benchmark_offer_under_pressure
);
criterion_main!(benches);
