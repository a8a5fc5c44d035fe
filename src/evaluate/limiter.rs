use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::Evaluate;
use crate::error::{IsomapError, StatusOr};
use crate::geo::GeoPoint;

/// Admission gate shared by every evaluator wrapped with it.
///
/// Clones share the same permits, so one gate can bound the requests of a
/// single session or of all sessions together.
#[derive(Debug, Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl Gate {
    pub fn new(limit: usize) -> StatusOr<Self> {
        if limit < 1 {
            return Err(IsomapError::InvalidConfig(
                "concurrency limit must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of admitted calls that have not settled yet
    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }
}

/// Lets at most `limit` calls of the wrapped evaluator run at once.
///
/// Further calls wait for a permit; any settled call, successful or not,
/// admits one waiter. Results pass through untouched.
pub struct ConcurrencyLimiter<E> {
    inner: E,
    gate: Gate,
}

impl<E: Evaluate> ConcurrencyLimiter<E> {
    pub fn new(inner: E, limit: usize) -> StatusOr<Self> {
        Ok(Self::with_gate(inner, Gate::new(limit)?))
    }

    pub fn with_gate(inner: E, gate: Gate) -> Self {
        Self { inner, gate }
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

#[async_trait]
impl<E: Evaluate> Evaluate for ConcurrencyLimiter<E> {
    async fn evaluate(&self, point: GeoPoint) -> StatusOr<f64> {
        // The permit is returned on drop, including when the caller abandons the future
        let _permit = self
            .gate
            .permits
            .acquire()
            .await
            .map_err(|_| IsomapError::Cancelled)?;
        self.inner.evaluate(point).await
    }
}
