//! Zone surge multiplier from live demand and supply.
//!
//! Demand is the number of rides in `Matched` or `Accepted` created within the
//! trailing window; supply is online, unreserved drivers currently in the zone.
//! The estimator fails open: anything it cannot look up yields 1.0.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{local_hour, HourWindow};
use crate::error::bounded;
use crate::lifecycle::RideStatus;
use crate::ports::{OnlineDriverCount, RideCountInWindow, ZoneRateLookup};
use crate::zones::ZoneId;

pub const DEMAND_STATUSES: [RideStatus; 2] = [RideStatus::Matched, RideStatus::Accepted];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurgeConfig {
    pub enabled: bool,
    pub window_minutes: u32,
    pub cap: f64,
    pub rush_hours: Vec<HourWindow>,
    pub rush_factor: f64,
    pub lookup_timeout_ms: u64,
}

impl Default for SurgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_minutes: 15,
            cap: 3.0,
            rush_hours: vec![HourWindow::new(8, 10), HourWindow::new(17, 20)],
            rush_factor: 1.2,
            lookup_timeout_ms: 250,
        }
    }
}

/// Piecewise-linear multiplier over demand/supply ratio, continuous and non-decreasing.
pub fn demand_multiplier(ratio: f64) -> f64 {
    if ratio.is_nan() || ratio <= 0.5 {
        1.0
    } else if ratio <= 1.0 {
        1.0 + (ratio - 0.5)
    } else if ratio <= 2.0 {
        1.5 + (ratio - 1.0) * 1.5
    } else {
        3.0
    }
}

/// Nearest tenth.
pub fn quantize(multiplier: f64) -> f64 {
    (multiplier * 10.0).round() / 10.0
}

struct SurgeSources {
    zones: Arc<dyn ZoneRateLookup>,
    rides: Arc<dyn RideCountInWindow>,
    drivers: Arc<dyn OnlineDriverCount>,
}

pub struct SurgeEstimator {
    config: SurgeConfig,
    sources: Option<SurgeSources>,
    utc_offset_minutes: i32,
}

impl SurgeEstimator {
    pub fn new(
        config: SurgeConfig,
        zones: Arc<dyn ZoneRateLookup>,
        rides: Arc<dyn RideCountInWindow>,
        drivers: Arc<dyn OnlineDriverCount>,
        utc_offset_minutes: i32,
    ) -> Self {
        Self {
            config,
            sources: Some(SurgeSources {
                zones,
                rides,
                drivers,
            }),
            utc_offset_minutes,
        }
    }

    /// An estimator that always answers 1.0.
    pub fn disabled(config: SurgeConfig) -> Self {
        Self {
            config,
            sources: None,
            utc_offset_minutes: 0,
        }
    }

    pub fn config(&self) -> &SurgeConfig {
        &self.config
    }

    fn cap(&self) -> f64 {
        self.config.cap.max(1.0)
    }

    /// Multiplier for a given demand, supply and local hour, in `[1.0, cap]`.
    pub fn multiplier_for(&self, rides: u64, available_drivers: u64, hour: u32) -> f64 {
        let ratio = rides as f64 / available_drivers.max(1) as f64;
        let mut multiplier = demand_multiplier(ratio);
        if self.config.rush_hours.iter().any(|w| w.contains(hour)) {
            multiplier *= self.config.rush_factor;
        }
        let cap = self.cap();
        quantize(multiplier.clamp(1.0, cap)).clamp(1.0, cap)
    }

    pub async fn estimate(&self, zone_id: Option<ZoneId>, now: DateTime<Utc>) -> f64 {
        let (Some(zone_id), Some(sources)) = (zone_id, self.sources.as_ref()) else {
            return 1.0;
        };
        if !self.config.enabled {
            return 1.0;
        }
        let timeout = Duration::from_millis(self.config.lookup_timeout_ms);

        match bounded("surge zone lookup", timeout, sources.zones.zone(zone_id)).await {
            Ok(Some(zone)) if zone.surge_enabled => {}
            Ok(_) => return 1.0,
            Err(err) => {
                warn!(zone_id = %zone_id, error = %err, "surge zone lookup failed, using 1.0");
                return 1.0;
            }
        }

        let window = chrono::Duration::minutes(i64::from(self.config.window_minutes));
        let (rides, drivers) = tokio::join!(
            bounded(
                "ride counter",
                timeout,
                sources.rides.ride_count(zone_id, &DEMAND_STATUSES, window, now)
            ),
            bounded("driver counter", timeout, sources.drivers.available_drivers(zone_id)),
        );
        let (rides, drivers) = match (rides, drivers) {
            (Ok(rides), Ok(drivers)) => (rides, drivers),
            (Err(err), _) | (_, Err(err)) => {
                warn!(zone_id = %zone_id, error = %err, "surge counters unavailable, using 1.0");
                return 1.0;
            }
        };

        let hour = local_hour(now, self.utc_offset_minutes);
        let multiplier = self.multiplier_for(rides, drivers, hour);
        debug!(zone_id = %zone_id, rides, drivers, hour, multiplier, "surge estimated");
        multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::error::{DispatchError, Result};
    use crate::test_helpers::{square_zone, CITY_CENTER};
    use crate::zones::{InMemoryZoneStore, RateCard};

    struct FixedCounts {
        rides: u64,
        drivers: u64,
    }

    #[async_trait]
    impl RideCountInWindow for FixedCounts {
        async fn ride_count(
            &self,
            _zone_id: ZoneId,
            _statuses: &[RideStatus],
            _window: chrono::Duration,
            _now: DateTime<Utc>,
        ) -> Result<u64> {
            Ok(self.rides)
        }
    }

    #[async_trait]
    impl OnlineDriverCount for FixedCounts {
        async fn available_drivers(&self, _zone_id: ZoneId) -> Result<u64> {
            Ok(self.drivers)
        }
    }

    struct BrokenCounts;

    #[async_trait]
    impl OnlineDriverCount for BrokenCounts {
        async fn available_drivers(&self, _zone_id: ZoneId) -> Result<u64> {
            Err(DispatchError::upstream("driver counter", "redis down"))
        }
    }

    fn no_rush() -> SurgeConfig {
        SurgeConfig {
            rush_hours: Vec::new(),
            ..SurgeConfig::default()
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    fn store_with_zone(surge_enabled: bool) -> Arc<InMemoryZoneStore> {
        let store = Arc::new(InMemoryZoneStore::new());
        store
            .insert_zone(square_zone(ZoneId(1), CITY_CENTER, 2.0, RateCard::default(), surge_enabled))
            .unwrap();
        store
    }

    #[test]
    fn piecewise_breakpoints() {
        assert_eq!(demand_multiplier(0.0), 1.0);
        assert_eq!(demand_multiplier(0.5), 1.0);
        assert_eq!(demand_multiplier(1.0), 1.5);
        assert_eq!(demand_multiplier(2.0), 3.0);
        assert_eq!(demand_multiplier(9.0), 3.0);
        assert_eq!(demand_multiplier(f64::NAN), 1.0);
    }

    #[test]
    fn multiplier_is_monotonic_and_bounded() {
        let estimator = SurgeEstimator::disabled(no_rush());
        let mut previous = 0.0;
        for rides in 0..=60 {
            let m = estimator.multiplier_for(rides, 10, 12);
            assert!((1.0..=3.0).contains(&m), "rides={rides} m={m}");
            assert!(m >= previous, "not monotonic at rides={rides}");
            previous = m;
        }
    }

    #[test]
    fn rush_factor_applies_inside_window_and_respects_cap() {
        let estimator = SurgeEstimator::disabled(SurgeConfig::default());
        // ratio 1.0 → 1.5, rush → 1.8
        assert_eq!(estimator.multiplier_for(10, 10, 9), 1.8);
        assert_eq!(estimator.multiplier_for(10, 10, 12), 1.5);
        assert_eq!(estimator.multiplier_for(50, 10, 18), 3.0);
        // quiet rush hour stays at the floor
        assert_eq!(estimator.multiplier_for(0, 10, 18), 1.2);
    }

    #[test]
    fn zero_drivers_counts_as_one() {
        let estimator = SurgeEstimator::disabled(no_rush());
        assert_eq!(estimator.multiplier_for(1, 0, 12), 1.5);
    }

    #[tokio::test]
    async fn estimate_reads_live_counts_for_surge_zones() {
        let counts = Arc::new(FixedCounts { rides: 15, drivers: 10 });
        let store = store_with_zone(true);
        let estimator = SurgeEstimator::new(no_rush(), store, counts.clone(), counts, 0);
        // ratio 1.5 → 2.25 → 2.3
        assert_eq!(estimator.estimate(Some(ZoneId(1)), noon()).await, 2.3);
        assert_eq!(estimator.estimate(Some(ZoneId(9)), noon()).await, 1.0);
        assert_eq!(estimator.estimate(None, noon()).await, 1.0);
    }

    #[tokio::test]
    async fn estimate_is_flat_when_zone_has_surge_disabled() {
        let counts = Arc::new(FixedCounts { rides: 100, drivers: 1 });
        let estimator = SurgeEstimator::new(no_rush(), store_with_zone(false), counts.clone(), counts, 0);
        assert_eq!(estimator.estimate(Some(ZoneId(1)), noon()).await, 1.0);
    }

    #[tokio::test]
    async fn estimate_fails_open() {
        let rides = Arc::new(FixedCounts { rides: 100, drivers: 1 });
        let estimator = SurgeEstimator::new(no_rush(), store_with_zone(true), rides, Arc::new(BrokenCounts), 0);
        assert_eq!(estimator.estimate(Some(ZoneId(1)), noon()).await, 1.0);
    }
}
