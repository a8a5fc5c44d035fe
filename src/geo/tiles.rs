//! Slippy-map tile numbering (Web Mercator), with support for tile sizes other
//! than 256 pixels. A 64-pixel tile grid has four times as many tiles per axis
//! as the standard one at the same zoom level.

use std::f64::consts::PI;
use std::fmt;

use super::{BoundingBox, EARTH_RADIUS_METERS, GeoPoint};

pub const STANDARD_TILE_SIZE: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub z: u8,
    pub tile_size: u32,
}

/// Number of tiles along one axis at zoom `z`
pub fn num_tiles(z: u8, tile_size: u32) -> f64 {
    2f64.powi(z as i32) * (STANDARD_TILE_SIZE as f64 / tile_size as f64)
}

/// Ground width in meters of one tile at the given latitude
pub fn tile_width_meters(lat: f64, z: u8, tile_size: u32) -> f64 {
    2.0 * PI * EARTH_RADIUS_METERS * lat.to_radians().cos() / num_tiles(z, tile_size)
}

fn mercator_to_lat(mercator_y: f64) -> f64 {
    mercator_y.sinh().atan().to_degrees()
}

/// Fractional tile coordinates of a point
fn relative_xy(point: &GeoPoint) -> (f64, f64) {
    let lat = point.lat.to_radians();
    let x = (point.lng + 180.0) / 360.0;
    let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0;
    (x, y)
}

fn xy_to_lat_lng(x: f64, y: f64, n: f64) -> GeoPoint {
    let lat = mercator_to_lat(PI * (1.0 - 2.0 * y / n));
    let lng = -180.0 + 360.0 * x / n;
    GeoPoint::new(lat, lng)
}

impl TileCoord {
    pub fn new(x: u32, y: u32, z: u8, tile_size: u32) -> Self {
        Self { x, y, z, tile_size }
    }

    /// Tile containing `point`
    pub fn from_lat_lng(point: &GeoPoint, z: u8, tile_size: u32) -> Self {
        let n = num_tiles(z, tile_size);
        let (x, y) = relative_xy(point);
        let max = (n - 1.0).max(0.0);
        Self {
            x: (x * n).floor().clamp(0.0, max) as u32,
            y: (y * n).floor().clamp(0.0, max) as u32,
            z,
            tile_size,
        }
    }

    pub fn center(&self) -> GeoPoint {
        let n = num_tiles(self.z, self.tile_size);
        xy_to_lat_lng(self.x as f64 + 0.5, self.y as f64 + 0.5, n)
    }

    pub fn bounds(&self) -> BoundingBox {
        let n = num_tiles(self.z, self.tile_size);
        let north_west = xy_to_lat_lng(self.x as f64, self.y as f64, n);
        let south_east = xy_to_lat_lng(self.x as f64 + 1.0, self.y as f64 + 1.0, n);
        BoundingBox::new(
            GeoPoint::new(south_east.lat, north_west.lng),
            GeoPoint::new(north_west.lat, south_east.lng),
        )
    }

    pub fn width_meters(&self) -> f64 {
        tile_width_meters(self.center().lat, self.z, self.tile_size)
    }

    pub fn meters_per_pixel(&self) -> f64 {
        self.width_meters() / self.tile_size as f64
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}@{}px", self.z, self.x, self.y, self.tile_size)
    }
}
