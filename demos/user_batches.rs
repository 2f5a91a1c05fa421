//! Batched processing of a user table
//!
//! Seeds an in-memory user store in batches, streams it back page by page with
//! simulated query latency, groups users into windows of 100 (or whatever
//! arrived within one second), and summarizes each window on a parallel stage
//! while keeping the original window order.
//!
//! Usage: cargo run --example user_batches --release
//!        Pass a path to a TOML file to override the pipeline configuration

use flowgate::{
    AsyncTransform, BoxError, FnSink, InMemoryRecordStore, Item, ParallelConfig, ParallelStage, PipelineBuilder,
    PipelineConfig, ProcessCache, RecordSource, RecordStore, SinkSignal, Window, WindowConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct User {
    id: u64,
    name: String,
    email: String,
}

#[derive(Debug)]
struct BatchSummary {
    window: u64,
    users: usize,
    first_id: u64,
    last_id: u64,
    reason: String,
}

fn seed(store: &InMemoryRecordStore<User>, total: u64, batch_size: u64) {
    for batch in 0..total / batch_size {
        let start = batch * batch_size;
        let users = (start..start + batch_size).map(|id| User {
            id,
            name: format!("user_{id}"),
            email: format!("user{id}@example.com"),
        });
        let stored = store.insert_all(users);
        info!(batch, first = start, stored, "seeded batch");
    }
}

#[tokio::main]
async fn main() -> flowgate::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };

    let store = Arc::new(InMemoryRecordStore::<User>::new().with_latency(Duration::from_millis(5)));
    seed(&store, 1000, 100);
    info!(users = store.count().await.map_err(|e| flowgate::PipelineError::Source(e.to_string()))?, "store ready");

    let domains = Arc::new(ProcessCache::<u64, String>::new("email_domains"));
    domains.initialize();

    let lookup = Arc::clone(&domains);
    let summarize = AsyncTransform::new(move |window: Window<User>| {
        let domains = Arc::clone(&lookup);
        async move {
            for user in window.payloads() {
                let domain = user.email.split('@').nth(1).unwrap_or_default().to_string();
                domains.get_or(user.id, |_| domain)?;
            }
            let ids: Vec<u64> = window.payloads().map(|u| u.id).collect();
            Ok::<_, BoxError>(BatchSummary {
                window: window.index(),
                users: window.len(),
                first_id: ids.first().copied().unwrap_or_default(),
                last_id: ids.last().copied().unwrap_or_default(),
                reason: window.reason().to_string(),
            })
        }
    });

    let store: Arc<dyn RecordStore<User>> = store;
    let report = PipelineBuilder::new("user-batches", config)
        .source(RecordSource::new(store).with_page_size(50))
        .filter("named", |user: &User| !user.name.is_empty())
        .window(WindowConfig::new(100, Duration::from_secs(1)))
        .parallel("summarize", ParallelStage::new(ParallelConfig::new(4), summarize))
        .run(FnSink::new(|item: Item<BatchSummary>| {
            let batch = item.into_payload();
            println!(
                "window {:>2}: {} users, ids {}..={}, closed by {}",
                batch.window, batch.users, batch.first_id, batch.last_id, batch.reason
            );
            Ok(SinkSignal::Continue)
        }))?
        .join()
        .await?;

    println!("\n{}", report.metrics_summary());
    println!("cached domains: {} (hit ratio {:.2})", domains.len(), domains.hit_ratio());
    domains.teardown();
    Ok(())
}
