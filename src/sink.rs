//! Item sinks: the terminal consumer of a pipeline.

use crate::error::{BoxError, PipelineError};
use crate::item::Item;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// What the sink wants after handling an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkSignal {
    Continue,
    /// Stop the pipeline; no further callbacks follow
    Cancel,
}

/// Consumes the pipeline's output one item at a time.
///
/// Exactly one of `on_complete` or `on_error` is called, unless the pipeline is
/// cancelled, in which case neither is.
#[async_trait]
pub trait Sink<T>: Send {
    async fn on_item(&mut self, item: Item<T>) -> Result<SinkSignal, BoxError>;

    async fn on_complete(&mut self) {}

    async fn on_error(&mut self, _err: &PipelineError) {}

    fn name(&self) -> &str {
        "sink"
    }
}

#[async_trait]
impl<T: Send + 'static, S: Sink<T> + ?Sized> Sink<T> for Box<S> {
    async fn on_item(&mut self, item: Item<T>) -> Result<SinkSignal, BoxError> {
        (**self).on_item(item).await
    }

    async fn on_complete(&mut self) {
        (**self).on_complete().await
    }

    async fn on_error(&mut self, err: &PipelineError) {
        (**self).on_error(err).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[derive(Debug)]
struct Collected<T> {
    items: Vec<Item<T>>,
    completed: bool,
    error: Option<PipelineError>,
}

/// Collects every item; clones share the same storage, so keep one as a handle
#[derive(Debug)]
pub struct CollectSink<T> {
    inner: Arc<Mutex<Collected<T>>>,
    limit: Option<usize>,
}

impl<T> Clone for CollectSink<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            limit: self.limit,
        }
    }
}

impl<T> CollectSink<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Collected {
                items: Vec::new(),
                completed: false,
                error: None,
            })),
            limit: None,
        }
    }

    /// Cancel the pipeline after `limit` items
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.inner.lock().items.iter().map(Item::seq).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().completed
    }

    pub fn error(&self) -> Option<PipelineError> {
        self.inner.lock().error.clone()
    }

    /// Take everything collected so far
    pub fn take_items(&self) -> Vec<Item<T>> {
        std::mem::take(&mut self.inner.lock().items)
    }
}

impl<T: Clone> CollectSink<T> {
    pub fn payloads(&self) -> Vec<T> {
        self.inner
            .lock()
            .items
            .iter()
            .map(|item| item.payload().clone())
            .collect()
    }
}

impl<T> Default for CollectSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> Sink<T> for CollectSink<T> {
    async fn on_item(&mut self, item: Item<T>) -> Result<SinkSignal, BoxError> {
        let mut inner = self.inner.lock();
        inner.items.push(item);
        match self.limit {
            Some(limit) if inner.items.len() >= limit => Ok(SinkSignal::Cancel),
            _ => Ok(SinkSignal::Continue),
        }
    }

    async fn on_complete(&mut self) {
        self.inner.lock().completed = true;
    }

    async fn on_error(&mut self, err: &PipelineError) {
        self.inner.lock().error = Some(err.clone());
    }

    fn name(&self) -> &str {
        "collect"
    }
}

/// Logs each item as a structured event
#[derive(Debug, Clone)]
pub struct LogSink {
    label: String,
}

impl LogSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

#[async_trait]
impl<T: Debug + Send + 'static> Sink<T> for LogSink {
    async fn on_item(&mut self, item: Item<T>) -> Result<SinkSignal, BoxError> {
        info!(sink = %self.label, seq = item.seq(), payload = ?item.payload(), "item delivered");
        Ok(SinkSignal::Continue)
    }

    async fn on_complete(&mut self) {
        info!(sink = %self.label, "stream completed");
    }

    async fn on_error(&mut self, err: &PipelineError) {
        warn!(sink = %self.label, error = %err, "stream failed");
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Forwards payloads to an mpsc receiver, such as a response stream.
///
/// A failure is forwarded as the final `Err`. A dropped receiver cancels the
/// pipeline.
#[derive(Debug)]
pub struct ChannelSink<T> {
    tx: mpsc::Sender<Result<T, PipelineError>>,
}

impl<T: Send> ChannelSink<T> {
    pub fn new(tx: mpsc::Sender<Result<T, PipelineError>>) -> Self {
        Self { tx }
    }

    /// Create the sink together with the receiving end
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Result<T, PipelineError>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl<T: Send + 'static> Sink<T> for ChannelSink<T> {
    async fn on_item(&mut self, item: Item<T>) -> Result<SinkSignal, BoxError> {
        match self.tx.send(Ok(item.into_payload())).await {
            Ok(()) => Ok(SinkSignal::Continue),
            Err(_) => Ok(SinkSignal::Cancel),
        }
    }

    async fn on_error(&mut self, err: &PipelineError) {
        let _ = self.tx.send(Err(err.clone())).await;
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Sink backed by a closure
pub struct FnSink<F> {
    func: F,
}

impl<F> FnSink<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<T, F> Sink<T> for FnSink<F>
where
    T: Send + 'static,
    F: FnMut(Item<T>) -> Result<SinkSignal, BoxError> + Send,
{
    async fn on_item(&mut self, item: Item<T>) -> Result<SinkSignal, BoxError> {
        (self.func)(item)
    }

    fn name(&self) -> &str {
        "fn"
    }
}
