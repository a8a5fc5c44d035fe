use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use log::debug;
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::error::StatusOr;
use crate::evaluate::Evaluate;
use crate::geo::GeoPoint;

/// Counters describing how well the cache is doing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Sampled values of one session, keyed by quantized coordinate.
///
/// Entries are never evicted. A session covers a small area around one
/// destination, and the values are only meaningful for that destination, so
/// the cache is dropped together with its session.
#[derive(Debug, Default)]
pub struct ValueCache {
    entries: Mutex<HashMap<String, Arc<OnceCell<f64>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache key for a point, rounded to six decimals (about 10 cm)
    pub fn key(point: &GeoPoint) -> String {
        format!("{:.6},{:.6}", point.lat, point.lng)
    }

    /// Get a cached value; `None` if the key was never stored
    pub fn get(&self, key: &str) -> Option<f64> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).and_then(|cell| cell.get().copied())
    }

    /// Store a value. The first value stored for a key wins.
    pub fn put(&self, key: &str, value: f64) {
        let _ = self.cell(key).set(value);
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn cell(&self, key: &str) -> Arc<OnceCell<f64>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.entry(key.to_string()).or_default().clone()
    }

    /// Drop the entry for `key` if it is still the empty `cell` a failed evaluation left behind
    fn forget_empty(&self, key: &str, cell: &Arc<OnceCell<f64>>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let stale = entries
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, cell) && !current.initialized());
        if stale {
            entries.remove(key);
        }
    }
}

/// Answers repeated points from a [`ValueCache`] and forwards the rest.
///
/// Concurrent requests for the same key share one underlying call. Failures
/// are not stored, so a later request retries the point.
pub struct CachedEvaluator<E> {
    inner: E,
    cache: Arc<ValueCache>,
}

impl<E: Evaluate> CachedEvaluator<E> {
    pub fn new(inner: E, cache: Arc<ValueCache>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &Arc<ValueCache> {
        &self.cache
    }
}

#[async_trait]
impl<E: Evaluate> Evaluate for CachedEvaluator<E> {
    async fn evaluate(&self, point: GeoPoint) -> StatusOr<f64> {
        let key = ValueCache::key(&point);
        let cell = self.cache.cell(&key);

        if let Some(value) = cell.get() {
            self.cache.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(*value);
        }

        let inner = &self.inner;
        let misses = &self.cache.misses;
        let key = key.as_str();
        let result = cell
            .get_or_try_init(|| async move {
                misses.fetch_add(1, Ordering::Relaxed);
                debug!("Cache miss for {}", key);
                inner.evaluate(point).await
            })
            .await;

        match result {
            Ok(value) => Ok(*value),
            Err(e) => {
                self.cache.forget_empty(key, &cell);
                Err(e)
            }
        }
    }
}
