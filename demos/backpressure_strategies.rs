//! Backpressure strategies side by side
//!
//! A fast ticker feeds a deliberately slow consumer once per policy, then prints
//! what each policy delivered, dropped or replaced.
//!
//! Usage: cargo run --example backpressure_strategies --release
//!        RUST_LOG=flowgate=debug shows every backpressure decision

use async_trait::async_trait;
use flowgate::{
    BackpressurePolicy, BoxError, CollectSink, IntervalSource, Item, PipelineBuilder, PipelineConfig,
    PipelineError, Sink, SinkSignal, SourceExt,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Takes 20ms per item while the source ticks every 2ms
struct SlowClient {
    inner: CollectSink<u64>,
}

#[async_trait]
impl Sink<u64> for SlowClient {
    async fn on_item(&mut self, item: Item<u64>) -> Result<SinkSignal, BoxError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.on_item(item).await
    }

    async fn on_complete(&mut self) {
        self.inner.on_complete().await
    }

    async fn on_error(&mut self, err: &PipelineError) {
        self.inner.on_error(err).await
    }

    fn name(&self) -> &str {
        "slow_client"
    }
}

async fn run_policy(policy: BackpressurePolicy) -> flowgate::Result<()> {
    let config = PipelineConfig::default()
        .with_policy(policy)
        .with_capacity(8)
        .with_sink_prefetch(4);
    let collected = CollectSink::new();

    let running = PipelineBuilder::new(format!("demo-{policy}"), config)
        .source(IntervalSource::new(Duration::from_millis(2)).take(100))
        .map("scale", |tick| tick * 10)
        .run(SlowClient {
            inner: collected.clone(),
        })?;

    match running.join().await {
        Ok(report) => {
            let edge = report.stage("sink-edge").cloned();
            println!(
                "{policy:>18}: delivered {:>3}, dropped {:>3}, replaced {:>3}, last seqs {:?}",
                report.delivered,
                edge.as_ref().map_or(0, |m| m.total_dropped),
                edge.as_ref().map_or(0, |m| m.total_replaced),
                collected.sequences().iter().rev().take(4).rev().collect::<Vec<_>>()
            );
        }
        Err(err) => {
            println!(
                "{policy:>18}: failed after {} items: {err}",
                collected.len()
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> flowgate::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowgate=info")))
        .init();

    println!("=== Backpressure strategies: 100 ticks at 2ms into a 20ms consumer ===\n");
    for policy in [
        BackpressurePolicy::DropNewest,
        BackpressurePolicy::KeepLatest,
        BackpressurePolicy::ErrorOnOverflow,
        BackpressurePolicy::UnboundedBuffer,
    ] {
        run_policy(policy).await?;
    }
    Ok(())
}
