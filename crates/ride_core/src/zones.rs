//! Pricing zones, rate cards and coordinate → zone resolution.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{bounded, DispatchError, Result};
use crate::geo::GeoPoint;
use crate::ports::{PointInZone, ZonePairRateLookup, ZoneRateLookup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(pub u32);

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateCard {
    pub base_fare: f64,
    pub per_km: f64,
    pub per_min: f64,
    pub minimum_fare: f64,
}

impl Default for RateCard {
    fn default() -> Self {
        Self {
            base_fare: 30.0,
            per_km: 15.0,
            per_min: 2.0,
            minimum_fare: 50.0,
        }
    }
}

impl RateCard {
    /// Mean of the metered rates, keeping the higher minimum fare.
    pub fn blend(&self, other: &RateCard) -> RateCard {
        RateCard {
            base_fare: (self.base_fare + other.base_fare) / 2.0,
            per_km: (self.per_km + other.per_km) / 2.0,
            per_min: (self.per_min + other.per_min) / 2.0,
            minimum_fare: self.minimum_fare.max(other.minimum_fare),
        }
    }

    pub fn is_valid(&self) -> bool {
        [self.base_fare, self.per_km, self.per_min, self.minimum_fare]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    }
}

/// A pricing zone. `id` is `None` only for the configured fallback zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: Option<ZoneId>,
    pub name: String,
    /// Closed ring; the last vertex connects back to the first.
    pub polygon: Vec<GeoPoint>,
    pub rates: RateCard,
    pub surge_enabled: bool,
}

impl Zone {
    pub fn default_zone(rates: RateCard) -> Self {
        Self {
            id: None,
            name: "default".to_string(),
            polygon: Vec::new(),
            rates,
            surge_enabled: false,
        }
    }

    pub fn is_default(&self) -> bool {
        self.id.is_none()
    }

    /// Even-odd ray cast. Points on an edge may land either side.
    pub fn contains(&self, point: GeoPoint) -> bool {
        let ring = &self.polygon;
        if ring.len() < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = ring.len() - 1;
        for i in 0..ring.len() {
            let (a, b) = (ring[i], ring[j]);
            if (a.lat > point.lat) != (b.lat > point.lat) {
                let cross_lon = a.lon + (point.lat - a.lat) / (b.lat - a.lat) * (b.lon - a.lon);
                if point.lon < cross_lon {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

#[derive(Debug, Default)]
struct ZoneTables {
    zones: Vec<Zone>,
    pair_rates: HashMap<(ZoneId, ZoneId), RateCard>,
}

/// Zone polygons and pair rates held in process.
///
/// Zones are checked in insertion order; the first containing polygon wins.
#[derive(Debug, Default)]
pub struct InMemoryZoneStore {
    tables: RwLock<ZoneTables>,
}

impl InMemoryZoneStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_zone(&self, zone: Zone) -> Result<()> {
        let Some(id) = zone.id else {
            return Err(DispatchError::invalid_input("stored zones need an id"));
        };
        if zone.polygon.len() < 3 {
            return Err(DispatchError::invalid_input(format!(
                "zone {id} polygon needs at least 3 vertices"
            )));
        }
        if let Some(bad) = zone.polygon.iter().find(|p| !p.is_valid()) {
            return Err(DispatchError::invalid_input(format!(
                "zone {id} has invalid vertex ({}, {})",
                bad.lat, bad.lon
            )));
        }
        if !zone.rates.is_valid() {
            return Err(DispatchError::invalid_input(format!(
                "zone {id} rate card has negative or non-finite values"
            )));
        }
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.zones.retain(|z| z.id != Some(id));
        tables.zones.push(zone);
        Ok(())
    }

    pub fn remove_zone(&self, zone_id: ZoneId) -> bool {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let before = tables.zones.len();
        tables.zones.retain(|z| z.id != Some(zone_id));
        tables
            .pair_rates
            .retain(|(from, to), _| *from != zone_id && *to != zone_id);
        tables.zones.len() != before
    }

    pub fn set_pair_rate(&self, from: ZoneId, to: ZoneId, rates: RateCard) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .pair_rates
            .insert((from, to), rates);
    }

    pub fn len(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .zones
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PointInZone for InMemoryZoneStore {
    async fn zone_for_point(&self, point: GeoPoint) -> Result<Option<Zone>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.zones.iter().find(|z| z.contains(point)).cloned())
    }
}

#[async_trait]
impl ZoneRateLookup for InMemoryZoneStore {
    async fn zone(&self, zone_id: ZoneId) -> Result<Option<Zone>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.zones.iter().find(|z| z.id == Some(zone_id)).cloned())
    }
}

#[async_trait]
impl ZonePairRateLookup for InMemoryZoneStore {
    async fn pair_rate(&self, from: ZoneId, to: ZoneId) -> Result<Option<RateCard>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.pair_rates.get(&(from, to)).copied())
    }
}

/// Resolves a coordinate to its zone, falling back to the default zone when the
/// lookup finds nothing, fails or runs past its timeout.
#[derive(Clone)]
pub struct ZoneResolver {
    lookup: Arc<dyn PointInZone>,
    default_zone: Zone,
    timeout: Duration,
}

impl ZoneResolver {
    pub fn new(lookup: Arc<dyn PointInZone>, default_rates: RateCard, timeout: Duration) -> Self {
        Self {
            lookup,
            default_zone: Zone::default_zone(default_rates),
            timeout,
        }
    }

    pub fn default_zone(&self) -> &Zone {
        &self.default_zone
    }

    pub async fn resolve(&self, point: GeoPoint) -> Zone {
        match bounded("zone lookup", self.timeout, self.lookup.zone_for_point(point)).await {
            Ok(Some(zone)) => zone,
            Ok(None) => self.default_zone.clone(),
            Err(err) => {
                warn!(lat = point.lat, lon = point.lon, error = %err, "zone lookup failed, using default zone");
                self.default_zone.clone()
            }
        }
    }
}
