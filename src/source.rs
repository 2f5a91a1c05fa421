//! Item sources.
//!
//! A [`Source`] is pulled lazily by the pipeline's source driver, which stamps
//! every payload with its sequence number. Sources may be infinite; the driver
//! simply stops pulling once the pipeline is cancelled.

use crate::error::BoxError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::debug;

/// A lazy, possibly infinite producer of payloads
#[async_trait]
pub trait Source<T>: Send {
    /// Next payload; `None` ends the stream, `Some(Err)` fails it
    async fn next(&mut self) -> Option<Result<T, BoxError>>;

    fn name(&self) -> &str {
        "source"
    }
}

#[async_trait]
impl<T: Send, S: Source<T> + ?Sized> Source<T> for Box<S> {
    async fn next(&mut self) -> Option<Result<T, BoxError>> {
        (**self).next().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Finite source over an iterator
pub struct IterSource<T> {
    name: String,
    iter: Box<dyn Iterator<Item = Result<T, BoxError>> + Send>,
}

impl<T: Send + 'static> IterSource<T> {
    pub fn new<I>(name: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self {
            name: name.into(),
            iter: Box::new(items.into_iter().map(Ok)),
        }
    }

    /// Iterator whose elements may already be failures
    pub fn fallible<I>(name: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = Result<T, BoxError>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            name: name.into(),
            iter: Box::new(items.into_iter()),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Source<T> for IterSource<T> {
    async fn next(&mut self) -> Option<Result<T, BoxError>> {
        self.iter.next()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Emits 0, 1, 2, ... once per period, starting one period after the first pull
pub struct IntervalSource {
    period: Duration,
    ticker: Option<Interval>,
    emitted: u64,
    limit: Option<u64>,
}

impl IntervalSource {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            ticker: None,
            emitted: 0,
            limit: None,
        }
    }

    /// Stop after `limit` ticks
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[async_trait]
impl Source<u64> for IntervalSource {
    async fn next(&mut self) -> Option<Result<u64, BoxError>> {
        if self.limit.is_some_and(|limit| self.emitted >= limit) {
            return None;
        }
        let period = self.period;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        ticker.tick().await;
        let tick = self.emitted;
        self.emitted += 1;
        Some(Ok(tick))
    }

    fn name(&self) -> &str {
        "interval"
    }
}

/// Ordered record storage the pipeline can page through
#[async_trait]
pub trait RecordStore<R>: Send + Sync {
    /// Number of stored records
    async fn count(&self) -> Result<u64, BoxError>;

    /// Up to `limit` records starting at `offset`, in storage order
    async fn fetch(&self, offset: u64, limit: usize) -> Result<Vec<R>, BoxError>;

    fn name(&self) -> &str {
        "store"
    }
}

/// In-memory store, mainly for tests and demos
pub struct InMemoryRecordStore<R> {
    records: RwLock<Vec<R>>,
    latency: Option<Duration>,
    fail_from: Option<u64>,
}

impl<R: Clone + Send + Sync + 'static> InMemoryRecordStore<R> {
    pub fn new() -> Self {
        Self::with_records(Vec::new())
    }

    pub fn with_records(records: Vec<R>) -> Self {
        Self {
            records: RwLock::new(records),
            latency: None,
            fail_from: None,
        }
    }

    /// Simulated query latency applied to every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make any fetch touching `offset` or beyond fail
    pub fn failing_from(mut self, offset: u64) -> Self {
        self.fail_from = Some(offset);
        self
    }

    /// Append records in batches, returning how many were stored
    pub fn insert_all(&self, records: impl IntoIterator<Item = R>) -> usize {
        let mut stored = self.records.write();
        let before = stored.len();
        stored.extend(records);
        stored.len() - before
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl<R: Clone + Send + Sync + 'static> Default for InMemoryRecordStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: Clone + Send + Sync + 'static> RecordStore<R> for InMemoryRecordStore<R> {
    async fn count(&self) -> Result<u64, BoxError> {
        self.simulate_latency().await;
        Ok(self.len() as u64)
    }

    async fn fetch(&self, offset: u64, limit: usize) -> Result<Vec<R>, BoxError> {
        self.simulate_latency().await;
        let records = self.records.read();
        let start = (offset as usize).min(records.len());
        let end = start.saturating_add(limit).min(records.len());
        if let Some(fail_from) = self.fail_from {
            if (end as u64) > fail_from {
                return Err(format!("store read failed at offset {fail_from}").into());
            }
        }
        Ok(records[start..end].to_vec())
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}

/// Pages through a [`RecordStore`] with optional skip and limit
pub struct RecordSource<R> {
    store: Arc<dyn RecordStore<R>>,
    page_size: usize,
    offset: u64,
    remaining: Option<u64>,
    page: std::vec::IntoIter<R>,
    exhausted: bool,
}

impl<R: Send + 'static> RecordSource<R> {
    pub fn new(store: Arc<dyn RecordStore<R>>) -> Self {
        Self {
            store,
            page_size: 100,
            offset: 0,
            remaining: None,
            page: Vec::new().into_iter(),
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Skip the first `skip` records
    pub fn skip(mut self, skip: u64) -> Self {
        self.offset = skip;
        self
    }

    /// Read at most `limit` records
    pub fn limit(mut self, limit: u64) -> Self {
        self.remaining = Some(limit);
        self
    }

    /// One page of a paged listing: skip `page * size`, take `size`
    pub fn paged(store: Arc<dyn RecordStore<R>>, page: u64, size: usize) -> Self {
        Self::new(store)
            .with_page_size(size)
            .skip(page * size as u64)
            .limit(size as u64)
    }
}

#[async_trait]
impl<R: Send + 'static> Source<R> for RecordSource<R> {
    async fn next(&mut self) -> Option<Result<R, BoxError>> {
        if self.remaining == Some(0) {
            return None;
        }
        if let Some(record) = self.page.next() {
            self.remaining = self.remaining.map(|left| left - 1);
            return Some(Ok(record));
        }
        if self.exhausted {
            return None;
        }

        let want = match self.remaining {
            Some(left) => (left as usize).min(self.page_size),
            None => self.page_size,
        };
        let page = match self.store.fetch(self.offset, want).await {
            Ok(page) => page,
            Err(err) => {
                self.exhausted = true;
                return Some(Err(err));
            }
        };
        debug!(store = self.store.name(), offset = self.offset, fetched = page.len(), "page fetched");
        if page.len() < want {
            self.exhausted = true;
        }
        self.offset += page.len() as u64;
        self.page = page.into_iter();

        let record = self.page.next()?;
        self.remaining = self.remaining.map(|left| left - 1);
        Some(Ok(record))
    }

    fn name(&self) -> &str {
        "records"
    }
}

/// Forwards payloads from an external mpsc receiver until every sender is dropped
pub struct ChannelSource<T> {
    rx: mpsc::Receiver<T>,
}

impl<T: Send> ChannelSource<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx }
    }

    /// Create the source together with the sender that feeds it
    pub fn channel(buffer: usize) -> (mpsc::Sender<T>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl<T: Send> Source<T> for ChannelSource<T> {
    async fn next(&mut self) -> Option<Result<T, BoxError>> {
        self.rx.recv().await.map(Ok)
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Waits `delay` before yielding each payload
pub struct DelayElements<S> {
    inner: S,
    delay: Duration,
}

#[async_trait]
impl<T: Send, S: Source<T>> Source<T> for DelayElements<S> {
    async fn next(&mut self) -> Option<Result<T, BoxError>> {
        let next = self.inner.next().await?;
        tokio::time::sleep(self.delay).await;
        Some(next)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Ends the stream after `limit` payloads
pub struct Take<S> {
    inner: S,
    remaining: u64,
}

#[async_trait]
impl<T: Send, S: Source<T>> Source<T> for Take<S> {
    async fn next(&mut self) -> Option<Result<T, BoxError>> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.inner.next().await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Pairs two sources element by element; ends as soon as either side ends
pub struct Zip<A, B> {
    left: A,
    right: B,
    name: String,
}

impl<A, B> Zip<A, B> {
    pub fn new<T, U>(left: A, right: B) -> Self
    where
        A: Source<T>,
        B: Source<U>,
    {
        let name = format!("{}+{}", left.name(), right.name());
        Self { left, right, name }
    }
}

#[async_trait]
impl<T, U, A, B> Source<(T, U)> for Zip<A, B>
where
    T: Send,
    U: Send,
    A: Source<T>,
    B: Source<U>,
{
    async fn next(&mut self) -> Option<Result<(T, U), BoxError>> {
        // Both sides wait concurrently, so two delayed sources pair up at the slower pace
        let (left, right) = tokio::join!(self.left.next(), self.right.next());
        match (left?, right?) {
            (Ok(left), Ok(right)) => Some(Ok((left, right))),
            (Err(err), _) | (_, Err(err)) => Some(Err(err)),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Combinators available on every source
pub trait SourceExt<T>: Source<T> + Sized {
    fn delay_elements(self, delay: Duration) -> DelayElements<Self> {
        DelayElements { inner: self, delay }
    }

    fn take(self, limit: u64) -> Take<Self> {
        Take {
            inner: self,
            remaining: limit,
        }
    }

    fn zip<U, R: Source<U>>(self, other: R) -> Zip<Self, R> {
        Zip::new::<T, U>(self, other)
    }
}

impl<T, S: Source<T>> SourceExt<T> for S {}
