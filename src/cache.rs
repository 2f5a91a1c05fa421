//! Process-wide lookup cache with an explicit lifecycle.
//!
//! The cache starts `Uninitialized`, serves reads and writes only while
//! `Ready`, and drops its contents on `teardown`. Share it through an `Arc`.

use crate::error::{PipelineError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Lifecycle of a [`ProcessCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Uninitialized,
    Ready,
    TornDown,
}

#[derive(Debug)]
struct Inner<K, V> {
    state: CacheState,
    entries: HashMap<K, V>,
}

#[derive(Debug)]
pub struct ProcessCache<K, V> {
    name: String,
    inner: RwLock<Inner<K, V>>,
    gets: AtomicU64,
    hits: AtomicU64,
}

impl<K: Eq + Hash, V: Clone> ProcessCache<K, V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(Inner {
                state: CacheState::Uninitialized,
                entries: HashMap::new(),
            }),
            gets: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// Make the cache usable; returns false if it already was.
    ///
    /// A torn-down cache can be initialized again and starts empty.
    pub fn initialize(&self) -> bool {
        let mut inner = self.inner.write();
        if inner.state == CacheState::Ready {
            return false;
        }
        inner.state = CacheState::Ready;
        debug!(cache = %self.name, "cache initialized");
        true
    }

    /// Drop every entry and refuse access until the next `initialize`
    pub fn teardown(&self) {
        let mut inner = self.inner.write();
        let released = inner.entries.len();
        inner.entries.clear();
        inner.state = CacheState::TornDown;
        debug!(cache = %self.name, released, "cache torn down");
    }

    pub fn state(&self) -> CacheState {
        self.inner.read().state
    }

    fn unavailable(&self, state: CacheState) -> PipelineError {
        PipelineError::CacheUnavailable(format!("{} is {:?}", self.name, state))
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let inner = self.inner.read();
        if inner.state != CacheState::Ready {
            return Err(self.unavailable(inner.state));
        }
        self.gets.fetch_add(1, Ordering::Relaxed);
        let value = inner.entries.get(key).cloned();
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(value)
    }

    /// Cached value for `key`, computing and storing it on a miss
    pub fn get_or<F>(&self, key: K, compute: F) -> Result<V>
    where
        F: FnOnce(&K) -> V,
    {
        if let Some(value) = self.get(&key)? {
            return Ok(value);
        }
        let mut inner = self.inner.write();
        if inner.state != CacheState::Ready {
            return Err(self.unavailable(inner.state));
        }
        let value = inner
            .entries
            .entry(key)
            .or_insert_with_key(compute)
            .clone();
        Ok(value)
    }

    /// Store a value, returning the one it replaced
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        let mut inner = self.inner.write();
        if inner.state != CacheState::Ready {
            return Err(self.unavailable(inner.state));
        }
        Ok(inner.entries.insert(key, value))
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fraction of `get` calls answered from the cache
    pub fn hit_ratio(&self) -> f64 {
        let gets = self.gets.load(Ordering::Relaxed);
        if gets == 0 {
            return 0.0;
        }
        self.hits.load(Ordering::Relaxed) as f64 / gets as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_access_before_initialize_fails() {
        let cache: ProcessCache<u32, String> = ProcessCache::new("users");
        assert_eq!(cache.state(), CacheState::Uninitialized);
        assert!(matches!(cache.get(&1), Err(PipelineError::CacheUnavailable(_))));
        assert!(cache.insert(1, "a".into()).is_err());
    }

    #[test]
    fn test_get_insert_and_get_or() {
        let cache = ProcessCache::new("users");
        assert!(cache.initialize());
        assert!(!cache.initialize());

        assert_eq!(cache.insert(1, "alice".to_string()).unwrap(), None);
        assert_eq!(cache.get(&1).unwrap().as_deref(), Some("alice"));
        assert_eq!(cache.get(&2).unwrap(), None);

        let computed = cache.get_or(2, |k| format!("user_{k}")).unwrap();
        assert_eq!(computed, "user_2");
        let cached = cache.get_or(2, |_| unreachable!()).unwrap();
        assert_eq!(cached, "user_2");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_teardown_clears_and_blocks_access() {
        let cache = ProcessCache::new("users");
        cache.initialize();
        cache.insert("k", 1).unwrap();
        cache.teardown();

        assert_eq!(cache.state(), CacheState::TornDown);
        assert!(cache.is_empty());
        assert!(matches!(cache.get_or("k", |_| 2), Err(PipelineError::CacheUnavailable(_))));

        assert!(cache.initialize());
        assert_eq!(cache.get(&"k").unwrap(), None);
    }

    #[test]
    fn test_hit_ratio_across_threads() {
        let cache = Arc::new(ProcessCache::new("shared"));
        cache.initialize();
        cache.insert(0u8, 0u8).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    cache.get(&0).unwrap();
                    cache.get(&9).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!((cache.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
