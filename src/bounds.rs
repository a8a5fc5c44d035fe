use serde::Serialize;

/// Observed value range
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValueBounds {
    pub min: f64,
    pub max: f64,
}

impl ValueBounds {
    /// Position of `value` within the range, clamped to `0.0..=1.0`
    pub fn normalize(&self, value: f64) -> f64 {
        let span = self.max - self.min;
        if span <= 0.0 {
            return 0.0;
        }
        ((value - self.min) / span).clamp(0.0, 1.0)
    }
}

/// Which bounds moved during an observation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundsChange {
    pub min_changed: bool,
    pub max_changed: bool,
}

impl BoundsChange {
    pub fn any(&self) -> bool {
        self.min_changed || self.max_changed
    }

    pub fn merge(self, other: BoundsChange) -> BoundsChange {
        BoundsChange {
            min_changed: self.min_changed || other.min_changed,
            max_changed: self.max_changed || other.max_changed,
        }
    }
}

/// Running minimum and maximum of every value seen in a session.
///
/// Colors are relative to these bounds, so a change means every tile drawn
/// so far has to be repainted.
#[derive(Debug, Clone, Default)]
pub struct MinMaxTracker {
    bounds: Option<ValueBounds>,
}

impl MinMaxTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, value: f64) -> BoundsChange {
        if value.is_nan() {
            return BoundsChange::default();
        }

        match &mut self.bounds {
            None => {
                self.bounds = Some(ValueBounds { min: value, max: value });
                BoundsChange { min_changed: true, max_changed: true }
            }
            Some(bounds) => {
                let change = BoundsChange {
                    min_changed: value < bounds.min,
                    max_changed: value > bounds.max,
                };
                bounds.min = bounds.min.min(value);
                bounds.max = bounds.max.max(value);
                change
            }
        }
    }

    pub fn bounds(&self) -> Option<ValueBounds> {
        self.bounds
    }

    pub fn reset(&mut self) {
        self.bounds = None;
    }
}
