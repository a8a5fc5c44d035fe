//! Adaptive refinement of travel-time heatmaps.
//!
//! A [`RefinementDriver`] samples a destination-relative travel time on a
//! 3×3 refinement tree, adding detail where the viewport needs it, while a
//! per-session cache and min/max tracker keep evaluations and colors stable.

pub mod bounds;
pub mod cache;
pub mod config;
pub mod driver;
pub mod error;
pub mod evaluate;
pub mod geo;
pub mod render;
pub mod source;
pub mod tree;

pub use bounds::{BoundsChange, MinMaxTracker, ValueBounds};
pub use cache::{CacheStats, CachedEvaluator, ValueCache};
pub use config::{OverlapPolicy, RefinementConfig};
pub use driver::{RefineOutcome, RefinementDriver};
pub use error::{IsomapError, StatusOr};
pub use evaluate::{ConcurrencyLimiter, Evaluate, TravelTimeSource};
pub use geo::{BoundingBox, GeoPoint};
pub use tree::{HeatPoint, HeatTile, RefinementNode};
