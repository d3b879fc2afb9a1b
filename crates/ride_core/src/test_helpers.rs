//! Shared fixtures for unit tests, integration tests and benches.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::clock::ManualClock;
use crate::config::ServiceConfig;
use crate::dispatch::BackoffPolicy;
use crate::events::LocalNotifier;
use crate::geo::GeoPoint;
use crate::pricing::{FareQuote, RateSource, VehicleType};
use crate::registry::{DriverId, DriverProfile};
use crate::service::{Collaborators, RideService};
use crate::zones::{InMemoryZoneStore, RateCard, Zone, ZoneId};

/// Bengaluru city centre; every fixture is laid out around it.
pub const CITY_CENTER: GeoPoint = GeoPoint::new(12.9716, 77.5946);

/// Zone id used by [`central_zone`].
pub const CENTRAL_ZONE: ZoneId = ZoneId(1);

/// A point `north_km` north and `east_km` east of `center` (negative values go
/// south/west).
pub fn point_near(center: GeoPoint, north_km: f64, east_km: f64) -> GeoPoint {
    center.offset_km(north_km, east_km)
}

/// Axis-aligned square zone with `half_side_km` from `center` to each edge.
pub fn square_zone(id: ZoneId, center: GeoPoint, half_side_km: f64, rates: RateCard, surge_enabled: bool) -> Zone {
    let h = half_side_km;
    Zone {
        id: Some(id),
        name: format!("zone-{id}"),
        polygon: vec![
            point_near(center, -h, -h),
            point_near(center, -h, h),
            point_near(center, h, h),
            point_near(center, h, -h),
        ],
        rates,
        surge_enabled,
    }
}

/// 10 km square around [`CITY_CENTER`] with default rates and surge enabled.
pub fn central_zone() -> Zone {
    square_zone(CENTRAL_ZONE, CITY_CENTER, 5.0, RateCard::default(), true)
}

/// A standard-vehicle quote with 20% commission and 5% tax on `subtotal`.
/// Both come out of the driver's payout; the rider pays subtotal plus tax.
pub fn sample_quote(subtotal: f64) -> FareQuote {
    let commission = subtotal * 0.2;
    let tax = subtotal * 0.05;
    FareQuote {
        vehicle_type: VehicleType::Standard,
        distance_km: 10.0,
        duration_min: 20.0,
        billable_waiting_min: 0.0,
        rate_source: RateSource::PickupZone,
        pickup_zone_id: Some(CENTRAL_ZONE),
        drop_zone_id: Some(CENTRAL_ZONE),
        vehicle_multiplier: 1.0,
        base_fare: 30.0,
        distance_fare: 150.0,
        time_fare: 40.0,
        waiting_fare: 0.0,
        minimum_fare: 50.0,
        night_multiplier: 1.0,
        surge_multiplier: 1.0,
        subtotal,
        commission,
        tax,
        driver_payout: subtotal - commission - tax,
        total: subtotal + tax,
    }
}

/// Defaults with the night surcharge off and a two second search budget
/// retried every 100–400ms, so searches settle quickly in tests.
pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.pricing.night.enabled = false;
    config.surge.rush_hours.clear();
    config.dispatch.search_timeout_secs = 2;
    config.dispatch.lookup_timeout_ms = 200;
    config.dispatch.backoff = BackoffPolicy {
        initial_delay_ms: 100,
        multiplier: 2.0,
        max_delay_ms: 400,
        jitter: false,
    };
    config.zones.lookup_timeout_ms = 200;
    config
}

/// Noon UTC on a weekday, outside any rush or night window.
///
/// # Panics
///
/// Panics if the hard-coded date is invalid (should never happen).
pub fn test_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0)
        .single()
        .expect("test start should be a valid timestamp")
}

/// A service backed by in-memory zones, a local notifier and a manual clock.
pub struct TestHarness {
    pub service: RideService,
    pub notifier: Arc<LocalNotifier>,
    pub zones: Arc<InMemoryZoneStore>,
    pub clock: Arc<ManualClock>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// # Panics
    ///
    /// Panics if `config` is rejected by the service.
    pub fn with_config(config: ServiceConfig) -> Self {
        let zones = Arc::new(InMemoryZoneStore::new());
        zones
            .insert_zone(central_zone())
            .expect("central zone should be valid");
        let notifier = Arc::new(LocalNotifier::new(config.events.channel_capacity));
        let clock = Arc::new(ManualClock::new(test_start()));
        let service = RideService::new(
            config,
            Collaborators::in_memory(zones.clone(), notifier.clone()),
            clock.clone(),
        )
        .expect("test config should be valid");
        Self {
            service,
            notifier,
            zones,
            clock,
        }
    }

    /// Register `name` and bring it online at the given offset from the centre.
    ///
    /// # Panics
    ///
    /// Panics if the driver cannot be registered or brought online.
    pub async fn online_driver(&self, name: &str, north_km: f64, east_km: f64) -> DriverId {
        let driver_id = DriverId::from(name);
        self.service
            .register_driver(driver_id.clone(), DriverProfile::default())
            .expect("driver registration should succeed");
        self.service
            .driver_online(&driver_id, point_near(CITY_CENTER, north_km, east_km))
            .await
            .expect("driver should come online");
        driver_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::haversine_km;

    #[test]
    fn northward_offsets_are_exact() {
        let north = point_near(CITY_CENTER, 10.0, 0.0);
        assert!((haversine_km(CITY_CENTER, north) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn eastward_offsets_are_close() {
        let east = point_near(CITY_CENTER, 0.0, 3.0);
        assert!((haversine_km(CITY_CENTER, east) - 3.0).abs() < 0.01);
    }

    #[test]
    fn central_zone_contains_center_only_nearby() {
        let zone = central_zone();
        assert!(zone.contains(CITY_CENTER));
        assert!(zone.contains(point_near(CITY_CENTER, 4.0, -4.0)));
        assert!(!zone.contains(point_near(CITY_CENTER, 6.0, 0.0)));
    }

    #[test]
    fn sample_quote_totals_include_tax() {
        let quote = sample_quote(220.0);
        assert_eq!(quote.total, 231.0);
        assert_eq!(quote.driver_payout, 165.0);
    }
}
