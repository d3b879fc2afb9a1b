//! Coordinates and distance metrics.
//!
//! Haversine is the default metric. The planar metric (Euclidean delta on
//! lat/lon degrees, scaled to km) is kept for compatibility with deployments
//! that ranked drivers that way; it is only approximately right over short
//! in-city distances.

use h3o::{CellIndex, LatLng, Resolution};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Kilometres per degree of latitude (mean), used to express the planar metric in km.
const KM_PER_DEGREE: f64 = 111.32;

/// Straight-line trip duration assumption when no route is supplied.
pub const MINUTES_PER_KM: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    pub fn validate(&self, field: &str) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(DispatchError::invalid_input(format!(
                "{field} ({}, {}) is outside lat [-90, 90] / lon [-180, 180]",
                self.lat, self.lon
            )))
        }
    }

    /// The point `north_km` north and `east_km` east of this one (negative
    /// values go south/west). Exact northward under haversine; eastward
    /// offsets are a local approximation.
    pub fn offset_km(&self, north_km: f64, east_km: f64) -> GeoPoint {
        let km_per_degree = EARTH_RADIUS_KM * std::f64::consts::PI / 180.0;
        GeoPoint::new(
            self.lat + north_km / km_per_degree,
            self.lon + east_km / (km_per_degree * self.lat.to_radians().cos()),
        )
    }

    pub fn to_cell(&self, resolution: Resolution) -> Option<CellIndex> {
        LatLng::new(self.lat, self.lon)
            .ok()
            .map(|ll| ll.to_cell(resolution))
    }
}

impl From<LatLng> for GeoPoint {
    fn from(ll: LatLng) -> Self {
        Self::new(ll.lat(), ll.lng())
    }
}

impl From<CellIndex> for GeoPoint {
    fn from(cell: CellIndex) -> Self {
        LatLng::from(cell).into()
    }
}

/// Great-circle distance in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lon.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lon.to_radians());
    let sin_dlat = ((lat2 - lat1) * 0.5).sin();
    let sin_dlon = ((lon2 - lon1) * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Euclidean distance on raw degrees, scaled to kilometres.
pub fn planar_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let dlat = a.lat - b.lat;
    let dlon = a.lon - b.lon;
    (dlat * dlat + dlon * dlon).sqrt() * KM_PER_DEGREE
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistanceMetric {
    #[default]
    Haversine,
    Planar,
}

impl DistanceMetric {
    pub fn distance_km(self, a: GeoPoint, b: GeoPoint) -> f64 {
        match self {
            DistanceMetric::Haversine => haversine_km(a, b),
            DistanceMetric::Planar => planar_km(a, b),
        }
    }
}

/// Distance and duration for a trip when the caller has no routed estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TripEstimate {
    pub distance_km: f64,
    pub duration_min: f64,
}

pub fn estimate_trip(pickup: GeoPoint, drop: GeoPoint) -> TripEstimate {
    let distance_km = haversine_km(pickup, drop);
    TripEstimate {
        distance_km,
        duration_min: (distance_km * MINUTES_PER_KM).round(),
    }
}
