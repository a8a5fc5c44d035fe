//! The refinement tree.
//!
//! A node is either a [`Leaf`] holding one sampled value for a square cell, or
//! an [`Internal`] node whose nine children split that cell into a 3×3 grid of
//! cells one third its size. Refining promotes leaves to internal nodes; an
//! internal node never turns back into a leaf.

use futures::future::{self, BoxFuture, FutureExt, join_all};
use log::{debug, warn};
use serde::Serialize;

use crate::config::RefinementConfig;
use crate::error::{IsomapError, StatusOr};
use crate::evaluate::Evaluate;
use crate::geo::{BoundingBox, GeoPoint};

/// (north, east) sign of each child, row-major, scaled by the child resolution
#[rustfmt::skip]
pub const CHILD_OFFSETS: [(i8, i8); 9] = [
    (-1, -1), (-1, 0), (-1, 1),
    (0, -1),  (0, 0),  (0, 1),
    (1, -1),  (1, 0),  (1, 1),
];

/// The middle child reuses its parent's position and value
pub const CENTER_CHILD: usize = 4;

/// Parameters of a single refinement pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefineOptions {
    pub min_resolution_meters: f64,
    /// Stored for samples whose evaluation failed
    pub failure_value: Option<f64>,
}

impl Default for RefineOptions {
    fn default() -> Self {
        RefineOptions::from(&RefinementConfig::default())
    }
}

impl From<&RefinementConfig> for RefineOptions {
    fn from(config: &RefinementConfig) -> Self {
        Self {
            min_resolution_meters: config.min_resolution_meters,
            failure_value: config.failure_value,
        }
    }
}

/// One sampled cell. `value` is `None` when the sample is unknown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Leaf {
    pub position: GeoPoint,
    pub resolution_meters: f64,
    pub value: Option<f64>,
}

/// A cell split into nine children
#[derive(Debug, Clone, PartialEq)]
pub struct Internal {
    position: GeoPoint,
    resolution_meters: f64,
    children: Box<[RefinementNode; 9]>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefinementNode {
    Leaf(Leaf),
    Internal(Internal),
}

/// A leaf flattened to a point
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeatPoint {
    pub lat: f64,
    pub lng: f64,
    pub value: Option<f64>,
}

/// A leaf flattened to its cell
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeatTile {
    pub bounds: BoundingBox,
    pub value: Option<f64>,
}

fn into_nine<T>(items: Vec<T>) -> [T; 9] {
    items
        .try_into()
        .unwrap_or_else(|items: Vec<T>| unreachable!("refinement produced {} children", items.len()))
}

impl Leaf {
    pub fn new(position: GeoPoint, resolution_meters: f64, value: Option<f64>) -> Self {
        Self { position, resolution_meters, value }
    }

    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::square(self.position, self.resolution_meters)
    }

    /// Split into nine children, or stay a leaf once children would fall below the floor.
    async fn subdivide<E>(self, evaluator: &E, options: &RefineOptions) -> RefinementNode
    where
        E: Evaluate + ?Sized,
    {
        let next_resolution = self.resolution_meters / 3.0;
        if next_resolution < options.min_resolution_meters {
            return RefinementNode::Leaf(self);
        }

        let samples = CHILD_OFFSETS.iter().enumerate().map(|(index, &(north, east))| async move {
            if index == CENTER_CHILD {
                return Leaf::new(self.position, next_resolution, self.value);
            }

            let position = self
                .position
                .offset(-(north as f64) * next_resolution, east as f64 * next_resolution);

            let value = match evaluator.evaluate(position).await {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Sample at {} failed: {}", position, e);
                    options.failure_value
                }
            };

            Leaf::new(position, next_resolution, value)
        });

        let children = join_all(samples).await.into_iter().map(RefinementNode::Leaf).collect();
        debug!("Split {} m cell at {} into {} m cells", self.resolution_meters, self.position, next_resolution);

        RefinementNode::Internal(Internal {
            position: self.position,
            resolution_meters: self.resolution_meters,
            children: Box::new(into_nine(children)),
        })
    }
}

impl Internal {
    pub fn children(&self) -> &[RefinementNode; 9] {
        &self.children
    }

    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::square(self.position, self.resolution_meters)
    }

    /// Refine every child whose cell intersects `viewport` and rebuild the node from the results
    async fn refine_children<'a, E>(
        self,
        evaluator: &'a E,
        viewport: Option<&'a BoundingBox>,
        options: &'a RefineOptions,
    ) -> Internal
    where
        E: Evaluate + ?Sized,
    {
        let Internal { position, resolution_meters, children } = self;
        let children: [RefinementNode; 9] = *children;

        let mut skipped = 0;
        let pending = children.map(|child| {
            let visible = viewport.is_none_or(|viewport| viewport.intersects(&child.bounding_box()));
            if visible {
                child.refine(evaluator, viewport, options)
            } else {
                skipped += 1;
                future::ready(child).boxed()
            }
        });

        if skipped > 0 {
            debug!("Skipped {} children outside the viewport at {}", skipped, position);
        }

        let refined = join_all(pending).await;
        Internal {
            position,
            resolution_meters,
            children: Box::new(into_nine(refined)),
        }
    }
}

impl RefinementNode {
    /// A fresh single-leaf tree
    pub fn leaf(position: GeoPoint, resolution_meters: f64, value: Option<f64>) -> Self {
        RefinementNode::Leaf(Leaf::new(position, resolution_meters, value))
    }

    /// Build an internal node from exactly nine children in row-major order
    pub fn internal(
        position: GeoPoint,
        resolution_meters: f64,
        children: Vec<RefinementNode>,
    ) -> StatusOr<Self> {
        let count = children.len();
        let children: [RefinementNode; 9] =
            children.try_into().map_err(|_| IsomapError::ChildCount(count))?;

        Ok(RefinementNode::Internal(Internal {
            position,
            resolution_meters,
            children: Box::new(children),
        }))
    }

    pub fn position(&self) -> GeoPoint {
        match self {
            RefinementNode::Leaf(leaf) => leaf.position,
            RefinementNode::Internal(internal) => internal.position,
        }
    }

    pub fn resolution_meters(&self) -> f64 {
        match self {
            RefinementNode::Leaf(leaf) => leaf.resolution_meters,
            RefinementNode::Internal(internal) => internal.resolution_meters,
        }
    }

    pub fn bounding_box(&self) -> BoundingBox {
        match self {
            RefinementNode::Leaf(leaf) => leaf.bounding_box(),
            RefinementNode::Internal(internal) => internal.bounding_box(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, RefinementNode::Leaf(_))
    }

    /// Add one level of detail.
    ///
    /// A leaf is split into nine children regardless of `viewport`. An
    /// internal node recurses into the children whose cells intersect
    /// `viewport` (all of them when there is none) and leaves the others as
    /// they are. Failed samples are logged and stored as
    /// `options.failure_value`.
    pub fn refine<'a, E>(
        self,
        evaluator: &'a E,
        viewport: Option<&'a BoundingBox>,
        options: &'a RefineOptions,
    ) -> BoxFuture<'a, RefinementNode>
    where
        E: Evaluate + ?Sized,
    {
        async move {
            match self {
                RefinementNode::Leaf(leaf) => leaf.subdivide(evaluator, options).await,
                RefinementNode::Internal(internal) => RefinementNode::Internal(
                    internal.refine_children(evaluator, viewport, options).await,
                ),
            }
        }
        .boxed()
    }

    /// Visit every leaf in row-major, depth-first order
    pub fn for_each_leaf<F: FnMut(&Leaf)>(&self, f: &mut F) {
        match self {
            RefinementNode::Leaf(leaf) => f(leaf),
            RefinementNode::Internal(internal) => {
                for child in internal.children.iter() {
                    child.for_each_leaf(f);
                }
            }
        }
    }

    pub fn leaf_count(&self) -> usize {
        let mut count = 0;
        self.for_each_leaf(&mut |_| count += 1);
        count
    }

    pub fn to_point_list(&self) -> Vec<HeatPoint> {
        let mut points = Vec::new();
        self.for_each_leaf(&mut |leaf| {
            points.push(HeatPoint {
                lat: leaf.position.lat,
                lng: leaf.position.lng,
                value: leaf.value,
            })
        });
        points
    }

    pub fn to_rectangle_list(&self) -> Vec<HeatTile> {
        let mut tiles = Vec::new();
        self.for_each_leaf(&mut |leaf| {
            tiles.push(HeatTile {
                bounds: leaf.bounding_box(),
                value: leaf.value,
            })
        });
        tiles
    }
}
