//! Collaborator interfaces the dispatch core depends on.
//!
//! Zone storage, proximity search, demand counters and delivery of notifications
//! live outside this crate in production. In-memory implementations are provided
//! by [`crate::zones::InMemoryZoneStore`], [`crate::registry::DriverRegistry`],
//! [`crate::lifecycle::RideBook`] and [`crate::events::LocalNotifier`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::events::Topic;
use crate::geo::GeoPoint;
use crate::lifecycle::RideStatus;
use crate::registry::DriverId;
use crate::zones::{RateCard, Zone, ZoneId};

#[async_trait]
pub trait PointInZone: Send + Sync {
    /// First zone whose polygon contains `point`, if any.
    async fn zone_for_point(&self, point: GeoPoint) -> Result<Option<Zone>>;
}

#[async_trait]
pub trait ZoneRateLookup: Send + Sync {
    async fn zone(&self, zone_id: ZoneId) -> Result<Option<Zone>>;
}

#[async_trait]
pub trait ZonePairRateLookup: Send + Sync {
    /// Rate card negotiated for travel from `from` to `to`, if one exists.
    async fn pair_rate(&self, from: ZoneId, to: ZoneId) -> Result<Option<RateCard>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct NearbyDriver {
    pub driver_id: DriverId,
    pub distance_km: f64,
    pub position: GeoPoint,
}

#[async_trait]
pub trait NearbyDrivers: Send + Sync {
    /// Online drivers within `radius_km` of `center`. Order is not significant.
    async fn nearby(&self, center: GeoPoint, radius_km: f64) -> Result<Vec<NearbyDriver>>;
}

#[async_trait]
pub trait RideCountInWindow: Send + Sync {
    async fn ride_count(
        &self,
        zone_id: ZoneId,
        statuses: &[RideStatus],
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64>;
}

#[async_trait]
pub trait OnlineDriverCount: Send + Sync {
    /// Drivers online, unreserved and located in the zone.
    async fn available_drivers(&self, zone_id: ZoneId) -> Result<u64>;
}

/// Fire-and-forget delivery to subscribers of a topic.
pub trait Notifier: Send + Sync {
    fn notify(&self, topic: &Topic, payload: serde_json::Value);
}
