use std::sync::atomic::{AtomicU64, Ordering};

/// An immutable payload tagged with the sequence number it was ingested with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item<T> {
    seq: u64,
    payload: T,
}

impl<T> Item<T> {
    /// Create an item with an explicit sequence number
    pub fn new(seq: u64, payload: T) -> Self {
        Self { seq, payload }
    }

    /// Sequence number assigned at ingestion
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Borrow the payload
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Consume the item, returning the payload
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Split into sequence number and payload
    pub fn into_parts(self) -> (u64, T) {
        (self.seq, self.payload)
    }

    /// Produce a new item carrying the same sequence number
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Item<U> {
        Item {
            seq: self.seq,
            payload: f(self.payload),
        }
    }
}

/// Hands out monotonically increasing sequence numbers
#[derive(Debug, Default)]
pub struct Sequencer {
    next: AtomicU64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag a payload with the next sequence number
    pub fn stamp<T>(&self, payload: T) -> Item<T> {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        Item::new(seq, payload)
    }

    /// Number of items stamped so far
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}
