//! Session management: one refinement tree, value cache and min/max tracker per destination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};

use crate::bounds::{BoundsChange, MinMaxTracker, ValueBounds};
use crate::cache::{CacheStats, CachedEvaluator, ValueCache};
use crate::config::{OverlapPolicy, RefinementConfig};
use crate::error::StatusOr;
use crate::evaluate::{CancelFlag, ConcurrencyLimiter, DestinationEvaluator, Gate, TravelTimeSource};
use crate::geo::{BoundingBox, GeoPoint};
use crate::tree::{HeatPoint, HeatTile, RefineOptions, RefinementNode};

type SessionEvaluator<S> = CachedEvaluator<ConcurrencyLimiter<DestinationEvaluator<S>>>;

/// Result of a viewport refinement request
#[derive(Debug, Clone, PartialEq)]
pub enum RefineOutcome {
    /// The refined tree replaced the session's tree
    Applied {
        generation: u64,
        /// New bounds when they widened; every tile drawn before must be repainted
        bounds_changed: Option<ValueBounds>,
        tiles: Vec<HeatTile>,
    },
    /// The destination changed while refining; the result was discarded
    Superseded { generation: u64 },
    /// Another refinement was running and the overlap policy is `Drop`
    Skipped,
    NoDestination,
}

struct Session<S> {
    generation: u64,
    destination: GeoPoint,
    tree: tokio::sync::Mutex<RefinementNode>,
    evaluator: SessionEvaluator<S>,
    cache: Arc<ValueCache>,
    tracker: Mutex<MinMaxTracker>,
    cancel: CancelFlag,
}

impl<S: TravelTimeSource> Session<S> {
    fn observe(&self, tree: &RefinementNode) -> BoundsChange {
        let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        let mut change = BoundsChange::default();
        tree.for_each_leaf(&mut |leaf| {
            if let Some(value) = leaf.value {
                change = change.merge(tracker.observe(value));
            }
        });
        change
    }

    fn bounds(&self) -> Option<ValueBounds> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner).bounds()
    }
}

/// Owns the current session and runs refinements against it.
///
/// At most one refinement runs per session; overlapping requests wait or are
/// dropped depending on [`OverlapPolicy`]. Changing the destination starts a
/// new session, and a refinement still running for the old one is discarded
/// when it completes.
pub struct RefinementDriver<S> {
    config: RefinementConfig,
    source: Arc<S>,
    gate: Gate,
    generation: AtomicU64,
    current: Mutex<Option<Arc<Session<S>>>>,
}

impl<S: TravelTimeSource> RefinementDriver<S> {
    pub fn new(source: S, config: RefinementConfig) -> StatusOr<Self> {
        config.validate()?;
        let gate = Gate::new(config.concurrency_limit)?;

        Ok(Self {
            config,
            source: Arc::new(source),
            gate,
            generation: AtomicU64::new(0),
            current: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    /// Start a new session around `destination`, discarding the current one.
    ///
    /// Returns the generation identifying the new session.
    pub fn set_destination(&self, destination: GeoPoint) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cache = Arc::new(ValueCache::new());
        let cancel = CancelFlag::default();

        let evaluator = CachedEvaluator::new(
            ConcurrencyLimiter::with_gate(
                DestinationEvaluator::new(self.source.clone(), destination, cancel.clone()),
                self.gate.clone(),
            ),
            cache.clone(),
        );

        // The destination reaches itself instantly
        let root = RefinementNode::leaf(destination, self.config.start_resolution_meters, Some(0.0));
        let mut tracker = MinMaxTracker::new();
        tracker.observe(0.0);

        let session = Arc::new(Session {
            generation,
            destination,
            tree: tokio::sync::Mutex::new(root),
            evaluator,
            cache,
            tracker: Mutex::new(tracker),
            cancel,
        });

        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(session);
        if let Some(previous) = previous {
            previous.cancel.cancel();
            info!(
                "Destination changed from {} to {}, dropping session {}",
                previous.destination, destination, previous.generation
            );
        }

        info!("Started session {} for destination {}", generation, destination);
        generation
    }

    /// Add detail to every cell intersecting `viewport`, or everywhere when it is `None`
    pub async fn refine_viewport(&self, viewport: Option<BoundingBox>) -> RefineOutcome {
        let Some(session) = self.session() else {
            return RefineOutcome::NoDestination;
        };

        let mut tree = match self.config.overlap {
            OverlapPolicy::Queue => session.tree.lock().await,
            OverlapPolicy::Drop => match session.tree.try_lock() {
                Ok(tree) => tree,
                Err(_) => {
                    debug!("Refinement already running for session {}, skipping", session.generation);
                    return RefineOutcome::Skipped;
                }
            },
        };

        // A request that waited for the lock may belong to a session that is gone
        if !self.is_current(&session) {
            debug!("Session {} was replaced while queued, not refining", session.generation);
            return RefineOutcome::Superseded { generation: session.generation };
        }

        let options = RefineOptions::from(&self.config);
        // Refine a copy so the stored tree stays whole if this future is dropped
        let refined = tree
            .clone()
            .refine(&session.evaluator, viewport.as_ref(), &options)
            .await;

        if !self.is_current(&session) {
            warn!(
                "Discarding refinement for session {} after destination change",
                session.generation
            );
            return RefineOutcome::Superseded { generation: session.generation };
        }

        let change = session.observe(&refined);
        *tree = refined;

        let tiles = tree.to_rectangle_list();
        let stats = session.cache.stats();
        info!(
            "Session {}: {} tiles, cache {} entries ({} hits, {} misses)",
            session.generation,
            tiles.len(),
            stats.entries,
            stats.hits,
            stats.misses
        );

        let bounds_changed = if change.any() { session.bounds() } else { None };
        if let Some(bounds) = bounds_changed {
            info!("Value range widened to {:.0}..{:.0}", bounds.min, bounds.max);
        }

        RefineOutcome::Applied {
            generation: session.generation,
            bounds_changed,
            tiles,
        }
    }

    pub fn destination(&self) -> Option<GeoPoint> {
        self.session().map(|session| session.destination)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn bounds(&self) -> Option<ValueBounds> {
        self.session().and_then(|session| session.bounds())
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.session().map(|session| session.cache.stats())
    }

    /// Rectangles of the current tree; waits for a running refinement
    pub async fn tiles(&self) -> Vec<HeatTile> {
        match self.session() {
            Some(session) => session.tree.lock().await.to_rectangle_list(),
            None => Vec::new(),
        }
    }

    /// Points of the current tree; waits for a running refinement
    pub async fn points(&self) -> Vec<HeatPoint> {
        match self.session() {
            Some(session) => session.tree.lock().await.to_point_list(),
            None => Vec::new(),
        }
    }

    fn is_current(&self, session: &Session<S>) -> bool {
        self.generation.load(Ordering::SeqCst) == session.generation
    }

    fn session(&self) -> Option<Arc<Session<S>>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IsomapError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Travel time proportional to the coordinate difference, with an optional delay
    #[derive(Default)]
    struct GridSource {
        calls: AtomicUsize,
        delay_ms: u64,
    }

    #[async_trait]
    impl TravelTimeSource for GridSource {
        async fn travel_time(&self, origin: GeoPoint, destination: GeoPoint) -> StatusOr<Option<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            let seconds = ((origin.lat - destination.lat).abs() + (origin.lng - destination.lng).abs()) * 1e5;
            Ok(Some(seconds))
        }
    }

    /// Slow only for one destination, so two sessions can be told apart by timing
    struct SlowForSource {
        slow_destination: GeoPoint,
        delay_ms: u64,
    }

    #[async_trait]
    impl TravelTimeSource for SlowForSource {
        async fn travel_time(&self, _origin: GeoPoint, destination: GeoPoint) -> StatusOr<Option<f64>> {
            if destination == self.slow_destination {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            Ok(Some(600.0))
        }
    }

    const ESSEN: GeoPoint = GeoPoint::new(51.457, 7.013);
    const BOCHUM: GeoPoint = GeoPoint::new(51.445, 7.262);

    fn config(start_resolution_meters: f64) -> RefinementConfig {
        RefinementConfig {
            start_resolution_meters,
            concurrency_limit: 4,
            ..Default::default()
        }
    }

    fn driver(delay_ms: u64, config: RefinementConfig) -> Arc<RefinementDriver<GridSource>> {
        let source = GridSource { delay_ms, ..Default::default() };
        Arc::new(RefinementDriver::new(source, config).unwrap())
    }

    fn calls(driver: &RefinementDriver<GridSource>) -> usize {
        driver.source.calls.load(Ordering::SeqCst)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = RefinementDriver::new(
            GridSource::default(),
            RefinementConfig { concurrency_limit: 0, ..Default::default() },
        );
        assert!(matches!(result, Err(IsomapError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_requires_destination() {
        let driver = driver(0, config(2400.0));
        assert_eq!(driver.refine_viewport(None).await, RefineOutcome::NoDestination);
        assert!(driver.tiles().await.is_empty());
        assert_eq!(driver.bounds(), None);
    }

    #[tokio::test]
    async fn test_refines_until_floor() {
        let driver = driver(0, config(2400.0));
        let generation = driver.set_destination(ESSEN);
        assert_eq!(driver.tiles().await.len(), 1);
        assert_eq!(driver.bounds(), Some(ValueBounds { min: 0.0, max: 0.0 }));

        let RefineOutcome::Applied { generation: applied, bounds_changed, tiles } =
            driver.refine_viewport(None).await
        else {
            panic!("first refinement should apply");
        };
        assert_eq!(applied, generation);
        assert_eq!(tiles.len(), 9);
        assert_eq!(calls(&driver), 8);
        let widened = bounds_changed.unwrap();
        assert_eq!(widened.min, 0.0);
        assert!(widened.max > 0.0);

        driver.refine_viewport(None).await;
        assert_eq!(driver.tiles().await.len(), 81);

        let before = calls(&driver);
        let RefineOutcome::Applied { bounds_changed, tiles, .. } = driver.refine_viewport(None).await else {
            panic!("refinement at the floor should still apply");
        };
        assert_eq!(tiles.len(), 81);
        assert_eq!(bounds_changed, None);
        assert_eq!(calls(&driver), before);
    }

    #[tokio::test]
    async fn test_viewport_limits_detail() {
        let driver = driver(0, config(2400.0));
        driver.set_destination(ESSEN);
        driver.refine_viewport(None).await;

        let viewport = BoundingBox::square(ESSEN, 100.0);
        driver.refine_viewport(Some(viewport)).await;

        // Only the center cell contains the viewport
        assert_eq!(driver.points().await.len(), 8 + 9);
        assert_eq!(calls(&driver), 8 + 8);
    }

    #[tokio::test]
    async fn test_new_destination_starts_fresh_session() {
        let driver = driver(0, config(2400.0));
        let first = driver.set_destination(ESSEN);
        driver.refine_viewport(None).await;
        assert_eq!(driver.cache_stats().unwrap().entries, 8);

        let second = driver.set_destination(ESSEN);
        assert!(second > first);
        assert_eq!(driver.tiles().await.len(), 1);
        assert_eq!(driver.cache_stats().unwrap(), CacheStats::default());

        // Values are destination-relative, so nothing carries over
        driver.refine_viewport(None).await;
        assert_eq!(calls(&driver), 16);

        driver.set_destination(BOCHUM);
        assert_eq!(driver.destination(), Some(BOCHUM));
        assert_eq!(driver.bounds(), Some(ValueBounds { min: 0.0, max: 0.0 }));
    }

    #[tokio::test]
    async fn test_result_discarded_after_destination_change() {
        let driver = driver(30, config(2400.0));
        let old = driver.set_destination(ESSEN);

        let running = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.refine_viewport(None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let new = driver.set_destination(BOCHUM);

        let outcome = running.await.unwrap();
        assert_eq!(outcome, RefineOutcome::Superseded { generation: old });
        assert_ne!(old, new);

        let tiles = driver.tiles().await;
        assert_eq!(tiles.len(), 1);
        assert!(tiles[0].bounds.contains(&BOCHUM));
    }

    #[tokio::test]
    async fn test_drop_policy_skips_overlapping_requests() {
        let driver = driver(30, RefinementConfig { overlap: OverlapPolicy::Drop, ..config(2400.0) });
        driver.set_destination(ESSEN);

        let running = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.refine_viewport(None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(driver.refine_viewport(None).await, RefineOutcome::Skipped);
        assert!(matches!(running.await.unwrap(), RefineOutcome::Applied { .. }));
        assert_eq!(driver.tiles().await.len(), 9);
    }

    #[tokio::test]
    async fn test_queue_policy_runs_requests_in_turn() {
        let driver = driver(10, config(2400.0));
        driver.set_destination(ESSEN);

        let first = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.refine_viewport(None).await })
        };
        let second = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.refine_viewport(None).await })
        };

        assert!(matches!(first.await.unwrap(), RefineOutcome::Applied { .. }));
        assert!(matches!(second.await.unwrap(), RefineOutcome::Applied { .. }));
        assert_eq!(driver.tiles().await.len(), 81);
        assert_eq!(driver.gate().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_new_session_does_not_wait_for_superseded_calls() {
        let source = SlowForSource { slow_destination: ESSEN, delay_ms: 10_000 };
        let config = RefinementConfig { concurrency_limit: 1, ..config(2400.0) };
        let driver = Arc::new(RefinementDriver::new(source, config).unwrap());
        let old = driver.set_destination(ESSEN);

        let running = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.refine_viewport(None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        driver.set_destination(BOCHUM);

        let started = std::time::Instant::now();
        let outcome = driver.refine_viewport(None).await;
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
        assert!(matches!(outcome, RefineOutcome::Applied { ref tiles, .. } if tiles.len() == 9));

        assert_eq!(running.await.unwrap(), RefineOutcome::Superseded { generation: old });
        assert_eq!(driver.gate().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_queued_request_for_replaced_session_does_not_sample() {
        let driver = driver(30, config(2400.0));
        let old = driver.set_destination(ESSEN);
        let old_cache = driver.session().unwrap().cache.clone();

        let first = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.refine_viewport(None).await })
        };
        let queued = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.refine_viewport(None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        driver.set_destination(BOCHUM);

        assert_eq!(first.await.unwrap(), RefineOutcome::Superseded { generation: old });
        assert_eq!(queued.await.unwrap(), RefineOutcome::Superseded { generation: old });
        // Only the request holding the lock sampled the old session
        assert_eq!(old_cache.stats().misses, 8);
    }
}
