use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{IsomapError, StatusOr};

pub mod tiles;

/// Equatorial radius used by the planar offset approximation
pub const EARTH_RADIUS_METERS: f64 = 6_378_137.0;

/// A latitude/longitude pair in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Move the point by the given distances on a spherical earth.
    ///
    /// A negative `meters_to_south` moves the point north, a negative
    /// `meters_to_east` moves it west. Longitude steps are widened by
    /// `1 / cos(lat)` so cells stay roughly square away from the equator.
    pub fn offset(&self, meters_to_south: f64, meters_to_east: f64) -> GeoPoint {
        let lat = self.lat - (meters_to_south / EARTH_RADIUS_METERS).to_degrees();
        let lng = self.lng
            + (meters_to_east / EARTH_RADIUS_METERS).to_degrees() / self.lat.to_radians().cos();
        GeoPoint { lat, lng }
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lat, self.lng)
    }
}

/// Parses `lat,lng`
impl FromStr for GeoPoint {
    type Err = IsomapError;

    fn from_str(s: &str) -> StatusOr<Self> {
        let values = parse_floats(s)?;
        match values.as_slice() {
            [lat, lng] => Ok(GeoPoint::new(*lat, *lng)),
            _ => Err(IsomapError::Parse(format!(
                "expected `lat,lng`, got {} values in {:?}",
                values.len(),
                s
            ))),
        }
    }
}

/// A rectangle on the map given by its south-west and north-east corners
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub south_west: GeoPoint,
    pub north_east: GeoPoint,
}

impl BoundingBox {
    pub fn new(south_west: GeoPoint, north_east: GeoPoint) -> Self {
        Self { south_west, north_east }
    }

    /// Square cell of side `side_meters` centered on `center`
    pub fn square(center: GeoPoint, side_meters: f64) -> Self {
        let half = side_meters / 2.0;
        Self {
            south_west: center.offset(half, -half),
            north_east: center.offset(-half, half),
        }
    }

    /// Box extending `pad_degrees` from `center` in every direction
    pub fn padded(center: GeoPoint, pad_degrees: f64) -> Self {
        Self {
            south_west: GeoPoint::new(center.lat - pad_degrees, center.lng - pad_degrees),
            north_east: GeoPoint::new(center.lat + pad_degrees, center.lng + pad_degrees),
        }
    }

    pub fn south(&self) -> f64 {
        self.south_west.lat
    }

    pub fn west(&self) -> f64 {
        self.south_west.lng
    }

    pub fn north(&self) -> f64 {
        self.north_east.lat
    }

    pub fn east(&self) -> f64 {
        self.north_east.lng
    }

    pub fn width(&self) -> f64 {
        self.east() - self.west()
    }

    pub fn height(&self) -> f64 {
        self.north() - self.south()
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(
            (self.south() + self.north()) / 2.0,
            (self.west() + self.east()) / 2.0,
        )
    }

    /// True when the boxes overlap; touching edges count as overlapping.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        other.north() >= self.south()
            && other.south() <= self.north()
            && other.east() >= self.west()
            && other.west() <= self.east()
    }

    pub fn contains(&self, point: &GeoPoint) -> bool {
        point.lat >= self.south()
            && point.lat <= self.north()
            && point.lng >= self.west()
            && point.lng <= self.east()
    }
}

/// Formats as `west,south,east,north`
impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.west(), self.south(), self.east(), self.north())
    }
}

/// Parses `west,south,east,north`
impl FromStr for BoundingBox {
    type Err = IsomapError;

    fn from_str(s: &str) -> StatusOr<Self> {
        let values = parse_floats(s)?;
        let [west, south, east, north] = values.as_slice() else {
            return Err(IsomapError::Parse(format!(
                "expected `west,south,east,north`, got {} values in {:?}",
                values.len(),
                s
            )));
        };

        if south > north {
            return Err(IsomapError::Parse(format!(
                "south edge {} lies north of north edge {}",
                south, north
            )));
        }

        Ok(BoundingBox::new(
            GeoPoint::new(*south, *west),
            GeoPoint::new(*north, *east),
        ))
    }
}

fn parse_floats(s: &str) -> StatusOr<Vec<f64>> {
    s.split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .map_err(|e| IsomapError::Parse(format!("{:?}: {}", part, e)))
        })
        .collect()
}
