//! Driver availability, positions and the reservation flag.
//!
//! Each driver's `reserved` flag is the only thing preventing two rides from
//! claiming the same driver. It is flipped with compare-and-set and never
//! under a map-wide lock, so searches for different rides run in parallel.
//!
//! Lock order when both are needed: a driver's `location` mutex, then the
//! spatial index. Neither is held across an await.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DispatchError, Result};
use crate::geo::{DistanceMetric, GeoPoint};
use crate::ports::{NearbyDriver, NearbyDrivers, OnlineDriverCount};
use crate::pricing::VehicleType;
use crate::spatial::{GeoIndex, SpatialIndex};
use crate::zones::ZoneId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverId(String);

impl DriverId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DriverId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DriverId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

fn default_rating() -> f64 {
    5.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverProfile {
    #[serde(default = "default_rating")]
    pub rating: f64,
    /// `None` serves requests of any vehicle type.
    #[serde(default)]
    pub vehicle_type: Option<VehicleType>,
}

impl Default for DriverProfile {
    fn default() -> Self {
        Self {
            rating: default_rating(),
            vehicle_type: None,
        }
    }
}

impl DriverProfile {
    pub fn with_vehicle(vehicle_type: VehicleType) -> Self {
        Self {
            vehicle_type: Some(vehicle_type),
            ..Self::default()
        }
    }

    pub fn serves(&self, requested: VehicleType) -> bool {
        self.vehicle_type.map_or(true, |v| v == requested)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub position: GeoPoint,
    pub zone_id: Option<ZoneId>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct DriverEntry {
    profile: DriverProfile,
    online: AtomicBool,
    reserved: AtomicBool,
    location: Mutex<Option<Location>>,
}

impl DriverEntry {
    fn location(&self) -> Option<Location> {
        *self.location.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_available(&self) -> bool {
        self.online.load(Ordering::Acquire) && !self.reserved.load(Ordering::Acquire)
    }
}

/// Point-in-time view of one driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverSnapshot {
    pub driver_id: DriverId,
    #[serde(flatten)]
    pub profile: DriverProfile,
    pub online: bool,
    pub reserved: bool,
    pub position: Option<GeoPoint>,
    pub zone_id: Option<ZoneId>,
    pub updated_at: Option<DateTime<Utc>>,
}

pub struct DriverRegistry {
    drivers: DashMap<DriverId, Arc<DriverEntry>>,
    /// Online drivers only.
    spatial: RwLock<SpatialIndex>,
    metric: DistanceMetric,
}

impl DriverRegistry {
    pub fn new(geo: GeoIndex, metric: DistanceMetric) -> Self {
        Self {
            drivers: DashMap::new(),
            spatial: RwLock::new(SpatialIndex::new(geo)),
            metric,
        }
    }

    fn entry(&self, driver_id: &DriverId) -> Result<Arc<DriverEntry>> {
        self.drivers
            .get(driver_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| DispatchError::DriverNotFound(driver_id.clone()))
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Add a driver. Returns false, leaving the existing profile in place, if
    /// the id is already registered.
    pub fn register(&self, driver_id: DriverId, profile: DriverProfile) -> Result<bool> {
        if !profile.rating.is_finite() || !(0.0..=5.0).contains(&profile.rating) {
            return Err(DispatchError::invalid_input(format!(
                "driver rating must be within [0, 5], got {}",
                profile.rating
            )));
        }
        let mut inserted = false;
        self.drivers.entry(driver_id.clone()).or_insert_with(|| {
            inserted = true;
            Arc::new(DriverEntry {
                profile,
                online: AtomicBool::new(false),
                reserved: AtomicBool::new(false),
                location: Mutex::new(None),
            })
        });
        if inserted {
            debug!(driver_id = %driver_id, "driver registered");
        }
        Ok(inserted)
    }

    pub fn go_online(
        &self,
        driver_id: &DriverId,
        position: GeoPoint,
        zone_id: Option<ZoneId>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        position.validate("driver position")?;
        let entry = self.entry(driver_id)?;
        let mut location = entry.location.lock().unwrap_or_else(PoisonError::into_inner);
        *location = Some(Location {
            position,
            zone_id,
            updated_at: at,
        });
        entry.online.store(true, Ordering::Release);
        self.spatial
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .upsert(driver_id, position);
        info!(driver_id = %driver_id, zone_id = ?zone_id, "driver online");
        Ok(())
    }

    /// Take the driver out of matching. An existing reservation is kept; the
    /// ride holding it releases it as usual.
    pub fn go_offline(&self, driver_id: &DriverId) -> Result<()> {
        let entry = self.entry(driver_id)?;
        let _location = entry.location.lock().unwrap_or_else(PoisonError::into_inner);
        entry.online.store(false, Ordering::Release);
        self.spatial
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(driver_id);
        info!(driver_id = %driver_id, "driver offline");
        Ok(())
    }

    /// Last-write-wins on `at`. Returns false when the update is older than
    /// the stored position and was ignored.
    pub fn update_position(
        &self,
        driver_id: &DriverId,
        position: GeoPoint,
        zone_id: Option<ZoneId>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        position.validate("driver position")?;
        let entry = self.entry(driver_id)?;
        let mut location = entry.location.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = location.as_ref() {
            if current.updated_at > at {
                debug!(driver_id = %driver_id, "stale position update ignored");
                return Ok(false);
            }
        }
        *location = Some(Location {
            position,
            zone_id,
            updated_at: at,
        });
        if entry.online.load(Ordering::Acquire) {
            self.spatial
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .upsert(driver_id, position);
        }
        Ok(true)
    }

    /// Claim the driver for one ride. Linearizable: of any number of concurrent
    /// callers at most one sees `true` until [`release`](Self::release).
    pub fn try_reserve(&self, driver_id: &DriverId) -> bool {
        let Ok(entry) = self.entry(driver_id) else {
            return false;
        };
        if !entry.online.load(Ordering::Acquire) {
            return false;
        }
        if entry
            .reserved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // Went offline between the check and the swap.
        if !entry.online.load(Ordering::Acquire) {
            entry.reserved.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Clear the reservation. Idempotent; unknown drivers are ignored.
    pub fn release(&self, driver_id: &DriverId) {
        if let Ok(entry) = self.entry(driver_id) {
            if entry.reserved.swap(false, Ordering::AcqRel) {
                debug!(driver_id = %driver_id, "driver released");
            }
        }
    }

    pub fn is_reserved(&self, driver_id: &DriverId) -> bool {
        self.entry(driver_id)
            .map(|e| e.reserved.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn is_available(&self, driver_id: &DriverId) -> bool {
        self.entry(driver_id)
            .map(|e| e.is_available())
            .unwrap_or(false)
    }

    pub fn snapshot(&self, driver_id: &DriverId) -> Option<DriverSnapshot> {
        let entry = self.entry(driver_id).ok()?;
        Some(Self::snapshot_of(driver_id, &entry))
    }

    pub fn snapshots(&self) -> Vec<DriverSnapshot> {
        let entries: Vec<(DriverId, Arc<DriverEntry>)> = self
            .drivers
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let mut out: Vec<_> = entries
            .iter()
            .map(|(id, entry)| Self::snapshot_of(id, entry))
            .collect();
        out.sort_by(|a, b| a.driver_id.cmp(&b.driver_id));
        out
    }

    fn snapshot_of(driver_id: &DriverId, entry: &DriverEntry) -> DriverSnapshot {
        let location = entry.location();
        DriverSnapshot {
            driver_id: driver_id.clone(),
            profile: entry.profile.clone(),
            online: entry.online.load(Ordering::Acquire),
            reserved: entry.reserved.load(Ordering::Acquire),
            position: location.map(|l| l.position),
            zone_id: location.and_then(|l| l.zone_id),
            updated_at: location.map(|l| l.updated_at),
        }
    }

    /// Online, unreserved drivers whose last position is in `zone_id`.
    pub fn available_in_zone(&self, zone_id: ZoneId) -> u64 {
        self.drivers
            .iter()
            .filter(|e| {
                let entry = e.value();
                entry.is_available()
                    && entry.location().and_then(|l| l.zone_id) == Some(zone_id)
            })
            .count() as u64
    }

    fn indexed_within(&self, center: GeoPoint, radius_km: f64) -> Vec<NearbyDriver> {
        self.spatial
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .within(center, radius_km, self.metric)
            .into_iter()
            .map(|(driver_id, distance_km, position)| NearbyDriver {
                driver_id,
                distance_km,
                position,
            })
            .collect()
    }

    fn scanned_within(&self, center: GeoPoint, radius_km: f64, metric: DistanceMetric) -> Vec<NearbyDriver> {
        let entries: Vec<(DriverId, Arc<DriverEntry>)> = self
            .drivers
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        entries
            .into_iter()
            .filter(|(_, entry)| entry.online.load(Ordering::Acquire))
            .filter_map(|(driver_id, entry)| {
                let position = entry.location()?.position;
                let distance_km = metric.distance_km(center, position);
                (distance_km <= radius_km).then_some(NearbyDriver {
                    driver_id,
                    distance_km,
                    position,
                })
            })
            .collect()
    }
}

#[async_trait]
impl NearbyDrivers for DriverRegistry {
    async fn nearby(&self, center: GeoPoint, radius_km: f64) -> Result<Vec<NearbyDriver>> {
        Ok(self.indexed_within(center, radius_km))
    }
}

#[async_trait]
impl OnlineDriverCount for DriverRegistry {
    async fn available_drivers(&self, zone_id: ZoneId) -> Result<u64> {
        Ok(self.available_in_zone(zone_id))
    }
}

/// Proximity by scanning every online driver. No index to maintain; fine for
/// small fleets and as a cross-check for the H3 index.
pub struct LinearScanNearby {
    registry: Arc<DriverRegistry>,
    metric: DistanceMetric,
}

impl LinearScanNearby {
    pub fn new(registry: Arc<DriverRegistry>, metric: DistanceMetric) -> Self {
        Self { registry, metric }
    }
}

#[async_trait]
impl NearbyDrivers for LinearScanNearby {
    async fn nearby(&self, center: GeoPoint, radius_km: f64) -> Result<Vec<NearbyDriver>> {
        Ok(self.registry.scanned_within(center, radius_km, self.metric))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{point_near, CITY_CENTER};
    use chrono::TimeZone;

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, minute, 0).unwrap()
    }

    fn registry() -> DriverRegistry {
        DriverRegistry::new(GeoIndex::default(), DistanceMetric::Haversine)
    }

    #[test]
    fn register_is_idempotent_and_validates_rating() {
        let reg = registry();
        let id = DriverId::from("d1");
        assert!(reg.register(id.clone(), DriverProfile::default()).unwrap());
        assert!(!reg.register(id, DriverProfile::default()).unwrap());
        let bad = DriverProfile {
            rating: 7.0,
            ..DriverProfile::default()
        };
        assert!(reg.register(DriverId::from("d2"), bad).is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn reservation_requires_online_and_is_exclusive() {
        let reg = registry();
        let id = DriverId::from("d1");
        reg.register(id.clone(), DriverProfile::default()).unwrap();
        assert!(!reg.try_reserve(&id), "offline drivers cannot be reserved");

        reg.go_online(&id, CITY_CENTER, None, t(0)).unwrap();
        assert!(reg.try_reserve(&id));
        assert!(!reg.try_reserve(&id));
        assert!(reg.is_reserved(&id));

        reg.release(&id);
        reg.release(&id);
        assert!(!reg.is_reserved(&id));
        assert!(reg.try_reserve(&id));
        assert!(!reg.try_reserve(&DriverId::from("ghost")));
    }

    #[test]
    fn stale_position_updates_are_ignored() {
        let reg = registry();
        let id = DriverId::from("d1");
        reg.register(id.clone(), DriverProfile::default()).unwrap();
        reg.go_online(&id, CITY_CENTER, None, t(5)).unwrap();

        let newer = point_near(CITY_CENTER, 1.0, 0.0);
        assert!(reg.update_position(&id, newer, None, t(6)).unwrap());
        let older = point_near(CITY_CENTER, -1.0, 0.0);
        assert!(!reg.update_position(&id, older, None, t(4)).unwrap());
        assert_eq!(reg.snapshot(&id).unwrap().position, Some(newer));
        assert_eq!(reg.snapshot(&id).unwrap().updated_at, Some(t(6)));
    }

    #[test]
    fn unknown_driver_operations_fail() {
        let reg = registry();
        let ghost = DriverId::from("ghost");
        assert!(matches!(
            reg.go_online(&ghost, CITY_CENTER, None, t(0)),
            Err(DispatchError::DriverNotFound(_))
        ));
        assert!(reg.go_offline(&ghost).is_err());
        assert!(reg.snapshot(&ghost).is_none());
    }

    #[tokio::test]
    async fn offline_drivers_leave_proximity_results_and_zone_counts() {
        let reg = Arc::new(registry());
        for (name, north) in [("a", 0.5), ("b", 1.0), ("c", 8.0)] {
            let id = DriverId::from(name);
            reg.register(id.clone(), DriverProfile::default()).unwrap();
            reg.go_online(&id, point_near(CITY_CENTER, north, 0.0), Some(ZoneId(1)), t(0))
                .unwrap();
        }
        let scan = LinearScanNearby::new(reg.clone(), DistanceMetric::Haversine);

        let near = reg.nearby(CITY_CENTER, 5.0).await.unwrap();
        assert_eq!(near.len(), 2);
        assert_eq!(scan.nearby(CITY_CENTER, 5.0).await.unwrap().len(), 2);
        assert_eq!(reg.available_drivers(ZoneId(1)).await.unwrap(), 3);

        reg.go_offline(&DriverId::from("a")).unwrap();
        assert!(reg.try_reserve(&DriverId::from("b")));

        let near: Vec<_> = reg
            .nearby(CITY_CENTER, 5.0)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.driver_id)
            .collect();
        assert_eq!(near, vec![DriverId::from("b")]);
        assert_eq!(scan.nearby(CITY_CENTER, 5.0).await.unwrap().len(), 1);
        assert_eq!(reg.available_in_zone(ZoneId(1)), 1);
    }
}
