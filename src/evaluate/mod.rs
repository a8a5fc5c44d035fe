use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::sync::watch;

use crate::error::{IsomapError, StatusOr};
use crate::geo::GeoPoint;

pub mod limiter;

pub use limiter::{ConcurrencyLimiter, Gate};

/// Produces the metric shown on the heatmap for one position
#[async_trait]
pub trait Evaluate: Send + Sync {
    async fn evaluate(&self, point: GeoPoint) -> StatusOr<f64>;
}

#[async_trait]
impl<F, Fut> Evaluate for F
where
    F: Fn(GeoPoint) -> Fut + Send + Sync,
    Fut: Future<Output = StatusOr<f64>> + Send + 'static,
{
    async fn evaluate(&self, point: GeoPoint) -> StatusOr<f64> {
        (self)(point).await
    }
}

/// Travel times towards a destination, e.g. from a journey planner
#[async_trait]
pub trait TravelTimeSource: Send + Sync {
    /// Seconds needed from `origin` to `destination`, `None` when no journey exists
    async fn travel_time(&self, origin: GeoPoint, destination: GeoPoint) -> StatusOr<Option<f64>>;
}

/// Shared flag that makes pending evaluations of a session fail fast.
///
/// Calls already waiting on a source are woken through [`CancelFlag::cancelled`].
#[derive(Debug, Clone)]
pub struct CancelFlag(Arc<watch::Sender<bool>>);

impl Default for CancelFlag {
    fn default() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }
}

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once [`CancelFlag::cancel`] has been called
    pub async fn cancelled(&self) {
        let mut receiver = self.0.subscribe();
        // The sender lives in `self`, so this only returns once the flag is set
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

/// Binds a [`TravelTimeSource`] to one destination
pub struct DestinationEvaluator<S> {
    source: Arc<S>,
    destination: GeoPoint,
    cancel: CancelFlag,
}

impl<S: TravelTimeSource> DestinationEvaluator<S> {
    pub fn new(source: Arc<S>, destination: GeoPoint, cancel: CancelFlag) -> Self {
        Self { source, destination, cancel }
    }

    pub fn destination(&self) -> GeoPoint {
        self.destination
    }
}

#[async_trait]
impl<S: TravelTimeSource> Evaluate for DestinationEvaluator<S> {
    async fn evaluate(&self, point: GeoPoint) -> StatusOr<f64> {
        if self.cancel.is_cancelled() {
            return Err(IsomapError::Cancelled);
        }

        // A superseded session must not hold its limiter permit until the source answers
        let seconds = tokio::select! {
            seconds = self.source.travel_time(point, self.destination) => seconds?,
            _ = self.cancel.cancelled() => return Err(IsomapError::Cancelled),
        };
        debug!("Travel time from {} to {}: {:?}", point, self.destination, seconds);

        match seconds {
            Some(value) if value.is_finite() && value >= 0.0 => Ok(value),
            Some(value) => Err(IsomapError::Evaluation(format!(
                "invalid travel time {} from {}",
                value, point
            ))),
            None => Err(IsomapError::Evaluation(format!("no journey found from {}", point))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(Option<f64>);

    #[async_trait]
    impl TravelTimeSource for FixedSource {
        async fn travel_time(&self, _origin: GeoPoint, _destination: GeoPoint) -> StatusOr<Option<f64>> {
            Ok(self.0)
        }
    }

    fn evaluator(value: Option<f64>) -> DestinationEvaluator<FixedSource> {
        DestinationEvaluator::new(
            Arc::new(FixedSource(value)),
            GeoPoint::new(51.0, 7.0),
            CancelFlag::default(),
        )
    }

    #[tokio::test]
    async fn test_closure_evaluates() {
        let double_lat = |p: GeoPoint| async move { Ok::<f64, IsomapError>(p.lat * 2.0) };
        let value = double_lat.evaluate(GeoPoint::new(1.5, 0.0)).await.unwrap();
        assert_eq!(value, 3.0);
    }

    #[tokio::test]
    async fn test_missing_and_invalid_values_fail() {
        let point = GeoPoint::new(51.1, 7.1);
        assert_eq!(evaluator(Some(600.0)).evaluate(point).await.unwrap(), 600.0);
        assert!(matches!(
            evaluator(None).evaluate(point).await,
            Err(IsomapError::Evaluation(_))
        ));
        assert!(evaluator(Some(-5.0)).evaluate(point).await.is_err());
        assert!(evaluator(Some(f64::NAN)).evaluate(point).await.is_err());
    }

    struct SlowSource;

    #[async_trait]
    impl TravelTimeSource for SlowSource {
        async fn travel_time(&self, _origin: GeoPoint, _destination: GeoPoint) -> StatusOr<Option<f64>> {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            Ok(Some(1.0))
        }
    }

    #[tokio::test]
    async fn test_cancel_aborts_call_in_flight() {
        let cancel = CancelFlag::default();
        let evaluator = DestinationEvaluator::new(Arc::new(SlowSource), GeoPoint::new(51.0, 7.0), cancel.clone());

        let started = std::time::Instant::now();
        let (result, _) = tokio::join!(evaluator.evaluate(GeoPoint::new(51.1, 7.1)), async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel.cancel();
        });

        assert!(matches!(result, Err(IsomapError::Cancelled)));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_session_fails() {
        let cancel = CancelFlag::default();
        let evaluator = DestinationEvaluator::new(
            Arc::new(FixedSource(Some(1.0))),
            GeoPoint::new(51.0, 7.0),
            cancel.clone(),
        );
        cancel.cancel();
        assert!(matches!(
            evaluator.evaluate(GeoPoint::new(51.1, 7.1)).await,
            Err(IsomapError::Cancelled)
        ));
    }
}
