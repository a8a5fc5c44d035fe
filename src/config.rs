use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IsomapError, StatusOr};
use crate::geo::tiles::tile_width_meters;

/// Subdivision floor: a leaf whose children would be smaller than this stays a leaf
pub const DEFAULT_MIN_RESOLUTION_METERS: f64 = 100.0;

/// Pixel size of the tile grid the start resolution is derived from
pub const DEFAULT_TILE_SIZE: u32 = 64;

/// What to do with a refinement request while another one is still running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Wait for the running refinement, then run
    #[default]
    Queue,
    /// Return immediately without refining
    Drop,
}

/// Configuration for a refinement session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    /// Side length of the root cell
    pub start_resolution_meters: f64,
    /// A leaf is not split when its children would be smaller than this
    pub min_resolution_meters: f64,
    /// Maximum number of evaluations in flight
    pub concurrency_limit: usize,
    /// Value stored for failed samples; `None` keeps them unknown
    pub failure_value: Option<f64>,
    pub overlap: OverlapPolicy,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            start_resolution_meters: 7200.0,
            min_resolution_meters: DEFAULT_MIN_RESOLUTION_METERS,
            concurrency_limit: 8,
            failure_value: None,
            overlap: OverlapPolicy::Queue,
        }
    }
}

impl RefinementConfig {
    /// Load a config from a JSON file; absent fields keep their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> StatusOr<Self> {
        let data = fs::read_to_string(path)?;
        let config: RefinementConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StatusOr<()> {
        if !self.start_resolution_meters.is_finite() || self.start_resolution_meters <= 0.0 {
            return Err(IsomapError::InvalidConfig(format!(
                "start resolution must be positive, got {}",
                self.start_resolution_meters
            )));
        }

        if !self.min_resolution_meters.is_finite() || self.min_resolution_meters <= 0.0 {
            return Err(IsomapError::InvalidConfig(format!(
                "minimum resolution must be positive, got {}",
                self.min_resolution_meters
            )));
        }

        if self.min_resolution_meters > self.start_resolution_meters {
            return Err(IsomapError::InvalidConfig(format!(
                "minimum resolution {} exceeds start resolution {}",
                self.min_resolution_meters, self.start_resolution_meters
            )));
        }

        if self.concurrency_limit < 1 {
            return Err(IsomapError::InvalidConfig(
                "concurrency limit must be at least 1".to_string(),
            ));
        }

        if let Some(value) = self.failure_value {
            if !value.is_finite() {
                return Err(IsomapError::InvalidConfig(format!(
                    "failure value must be finite, got {}",
                    value
                )));
            }
        }

        Ok(())
    }
}

/// Start resolution matching the ground width of one map tile at `lat`
pub fn start_resolution_for_tile(lat: f64, zoom: u8, tile_size: u32) -> f64 {
    tile_width_meters(lat, zoom, tile_size)
}
