use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Days, Local, NaiveDate, NaiveDateTime};
use log::debug;
use reqwest::Client;
use s2::latlng::LatLng;
use serde::Deserialize;

use crate::error::{IsomapError, StatusOr};
use crate::evaluate::TravelTimeSource;
use crate::geo::{EARTH_RADIUS_METERS, GeoPoint};

/// Straight-line travel time model.
///
/// Distance along the great circle divided by a constant speed, plus a fixed
/// time to get going. Deterministic and offline, which makes it handy for
/// previews and tests.
#[derive(Debug, Clone)]
pub struct CrowFliesSource {
    pub speed_kmh: f64,
    pub access_seconds: f64,
    /// Points further away than this have no journey
    pub max_distance_meters: Option<f64>,
}

impl Default for CrowFliesSource {
    fn default() -> Self {
        Self {
            speed_kmh: 20.0,
            access_seconds: 300.0,
            max_distance_meters: None,
        }
    }
}

impl CrowFliesSource {
    pub fn new(speed_kmh: f64) -> StatusOr<Self> {
        if !speed_kmh.is_finite() || speed_kmh <= 0.0 {
            return Err(IsomapError::InvalidConfig(format!(
                "speed must be positive, got {} km/h",
                speed_kmh
            )));
        }

        Ok(Self {
            speed_kmh,
            ..Default::default()
        })
    }

    pub fn distance_meters(a: GeoPoint, b: GeoPoint) -> f64 {
        let a = LatLng::from_degrees(a.lat, a.lng);
        let b = LatLng::from_degrees(b.lat, b.lng);
        a.distance(&b).rad() * EARTH_RADIUS_METERS
    }
}

#[async_trait]
impl TravelTimeSource for CrowFliesSource {
    async fn travel_time(&self, origin: GeoPoint, destination: GeoPoint) -> StatusOr<Option<f64>> {
        let meters = Self::distance_meters(origin, destination);
        if self.max_distance_meters.is_some_and(|max| meters > max) {
            return Ok(None);
        }

        let meters_per_second = self.speed_kmh / 3.6;
        Ok(Some(self.access_seconds + meters / meters_per_second))
    }
}

/// Body returned by a travel-time endpoint
#[derive(Debug, Deserialize)]
struct TravelTimeResponse {
    duration_seconds: Option<f64>,
}

/// Travel times from an HTTP endpoint.
///
/// The URL template may contain `{origin_lat}`, `{origin_lng}`,
/// `{destination_lat}`, `{destination_lng}` and `{departure}`; the endpoint
/// answers with `{"duration_seconds": <number or null>}`.
pub struct HttpSource {
    client: Client,
    url_template: String,
    departure: Option<NaiveDateTime>,
}

impl HttpSource {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> StatusOr<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url_template: url_template.into(),
            departure: next_monday_morning(Local::now().date_naive()),
        })
    }

    pub fn with_departure(mut self, departure: NaiveDateTime) -> Self {
        self.departure = Some(departure);
        self
    }

    pub fn url_for(&self, origin: GeoPoint, destination: GeoPoint) -> String {
        let departure = self
            .departure
            .map(|d| d.format("%Y-%m-%dT%H:%M").to_string())
            .unwrap_or_default();

        self.url_template
            .replace("{origin_lat}", &format!("{:.6}", origin.lat))
            .replace("{origin_lng}", &format!("{:.6}", origin.lng))
            .replace("{destination_lat}", &format!("{:.6}", destination.lat))
            .replace("{destination_lng}", &format!("{:.6}", destination.lng))
            .replace("{departure}", &departure)
    }
}

#[async_trait]
impl TravelTimeSource for HttpSource {
    async fn travel_time(&self, origin: GeoPoint, destination: GeoPoint) -> StatusOr<Option<f64>> {
        let url = self.url_for(origin, destination);
        debug!("Querying {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(IsomapError::Evaluation(format!(
                "{} answered HTTP {}",
                url,
                response.status()
            )));
        }

        let body: TravelTimeResponse = response.json().await?;
        Ok(body.duration_seconds)
    }
}

/// 09:00 on the Monday of the week after `today`, a typical commute departure
pub fn next_monday_morning(today: NaiveDate) -> Option<NaiveDateTime> {
    let days_since_monday = today.weekday().num_days_from_monday() as u64;
    let monday = today
        .checked_sub_days(Days::new(days_since_monday))?
        .checked_add_days(Days::new(7))?;
    monday.and_hms_opt(9, 0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_monday_morning() {
        // 2024-05-15 is a Wednesday
        let wednesday = NaiveDate::from_ymd_opt(2024, 5, 15).unwrap();
        let departure = next_monday_morning(wednesday).unwrap();
        assert_eq!(departure.to_string(), "2024-05-20 09:00:00");

        // A Monday maps to the following Monday
        let monday = NaiveDate::from_ymd_opt(2024, 5, 20).unwrap();
        assert_eq!(
            next_monday_morning(monday).unwrap().to_string(),
            "2024-05-27 09:00:00"
        );
    }

    #[test]
    fn test_distance() {
        let a = GeoPoint::new(51.0, 7.0);
        let b = GeoPoint::new(51.0, 7.0).offset(-1000.0, 0.0);
        let meters = CrowFliesSource::distance_meters(a, b);
        assert!((meters - 1000.0).abs() < 0.01, "{}", meters);
    }

    #[tokio::test]
    async fn test_crow_flies_travel_time() {
        let source = CrowFliesSource {
            speed_kmh: 36.0,
            access_seconds: 60.0,
            max_distance_meters: Some(5000.0),
        };
        let destination = GeoPoint::new(51.0, 7.0);

        let near = destination.offset(-1000.0, 0.0);
        let seconds = source.travel_time(near, destination).await.unwrap().unwrap();
        assert!((seconds - 160.0).abs() < 0.01);

        let far = destination.offset(-10_000.0, 0.0);
        assert_eq!(source.travel_time(far, destination).await.unwrap(), None);

        assert!(CrowFliesSource::new(0.0).is_err());
    }

    #[test]
    fn test_url_template() {
        let source = HttpSource::new(
            "http://localhost/tt/{origin_lat},{origin_lng}/{destination_lat},{destination_lng}?at={departure}",
            Duration::from_secs(5),
        )
        .unwrap()
        .with_departure(
            NaiveDate::from_ymd_opt(2024, 5, 20)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
        );

        let url = source.url_for(GeoPoint::new(51.5, 7.25), GeoPoint::new(51.0, 7.0));
        assert_eq!(
            url,
            "http://localhost/tt/51.500000,7.250000/51.000000,7.000000?at=2024-05-20T09:00"
        );
    }
}
