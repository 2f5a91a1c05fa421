use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flowgate::{
    AsyncTransform, BackpressurePolicy, BoxError, CollectSink, IterSource, ParallelConfig, ParallelStage,
    PipelineBuilder, PipelineConfig, WindowConfig,
};
use std::time::Duration;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("Runtime build failed")
}

fn lossless() -> PipelineConfig {
    PipelineConfig::default().with_policy(BackpressurePolicy::UnboundedBuffer)
}

fn benchmark_single_stage_throughput(c: &mut Criterion) {
    let rt = runtime();
    c.bench_function("single_stage_1000_items", |b| {
        b.iter(|| {
            rt.block_on(async {
                let report = PipelineBuilder::new("bench", lossless())
                    .source(IterSource::new("bytes", (0..1000u32).map(|i| vec![i as u8; 64])))
                    .map("len", |data: Vec<u8>| black_box(data.len()))
                    .run(CollectSink::new())
                    .expect("Start failed")
                    .join()
                    .await
                    .expect("Run failed");
                assert_eq!(report.delivered, 1000);
            })
        });
    });
}

fn benchmark_three_stage_throughput(c: &mut Criterion) {
    let rt = runtime();
    c.bench_function("three_stage_1000_items", |b| {
        b.iter(|| {
            rt.block_on(async {
                PipelineBuilder::new("bench", lossless())
                    .source(IterSource::new("numbers", 0..1000u64))
                    .map("square", |v| v * v)
                    .filter("even", |v| v % 2 == 0)
                    .map("format", |v| black_box(v.to_string()))
                    .run(CollectSink::new())
                    .expect("Start failed")
                    .join()
                    .await
                    .expect("Run failed");
            })
        });
    });
}

fn benchmark_windowed_fan_out(c: &mut Criterion) {
    let rt = runtime();
    c.bench_function("window_then_parallel_5000_items", |b| {
        b.iter(|| {
            rt.block_on(async {
                let sum = AsyncTransform::new(|window: flowgate::Window<u64>| async move {
                    Ok::<_, BoxError>(window.payloads().sum::<u64>())
                });
                PipelineBuilder::new("bench", lossless())
                    .source(IterSource::new("numbers", 0..5000u64))
                    .window(WindowConfig::new(100, Duration::from_secs(1)))
                    .parallel("sum", ParallelStage::new(ParallelConfig::new(4), sum))
                    .run(CollectSink::new())
                    .expect("Start failed")
                    .join()
                    .await
                    .expect("Run failed");
            })
        });
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = benchmark_single_stage_throughput, benchmark_three_stage_throughput, benchmark_windowed_fan_out
);
criterion_main!(benches);
