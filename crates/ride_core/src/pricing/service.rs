use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{bounded, DispatchError, Result};
use crate::geo::{estimate_trip, GeoPoint};
use crate::ports::ZonePairRateLookup;
use crate::pricing::engine::{PricingEngine, QuoteContext, TripFacts};
use crate::pricing::{FareQuote, VehicleType};
use crate::surge::SurgeEstimator;
use crate::zones::{RateCard, Zone, ZoneId, ZoneResolver};

/// Input for a standalone fare quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub pickup: GeoPoint,
    pub drop: GeoPoint,
    pub vehicle_type: VehicleType,
    /// Routed distance; estimated from the coordinates when absent.
    pub distance_km: Option<f64>,
    pub duration_min: Option<f64>,
    #[serde(default)]
    pub waiting_min: f64,
    /// Overrides `pricing.use_pickup_zone_rates` for this quote.
    pub use_pickup_zone_rates: Option<bool>,
}

impl QuoteRequest {
    pub fn new(pickup: GeoPoint, drop: GeoPoint, vehicle_type: VehicleType) -> Self {
        Self {
            pickup,
            drop,
            vehicle_type,
            distance_km: None,
            duration_min: None,
            waiting_min: 0.0,
            use_pickup_zone_rates: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.pickup.validate("pickup")?;
        self.drop.validate("drop")?;
        for (field, value) in [
            ("distance_km", self.distance_km),
            ("duration_min", self.duration_min),
            ("waiting_min", Some(self.waiting_min)),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(DispatchError::invalid_input(format!(
                        "{field} must be a non-negative number, got {v}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn trip_facts(&self) -> TripFacts {
        let (distance_km, duration_min) = match (self.distance_km, self.duration_min) {
            (Some(d), Some(t)) => (d, t),
            (distance, duration) => {
                let estimate = estimate_trip(self.pickup, self.drop);
                (
                    distance.unwrap_or(estimate.distance_km),
                    duration.unwrap_or(estimate.duration_min),
                )
            }
        };
        TripFacts {
            distance_km,
            duration_min,
            waiting_min: self.waiting_min,
            vehicle_type: self.vehicle_type,
        }
    }
}

/// A quote plus the zones it was priced in.
#[derive(Debug, Clone, PartialEq)]
pub struct PricedTrip {
    pub quote: FareQuote,
    pub pickup_zone: Zone,
    pub drop_zone: Zone,
}

/// Resolves zones, pair rates and surge for a trip, then prices it.
pub struct FareService {
    engine: PricingEngine,
    zones: ZoneResolver,
    pair_rates: Arc<dyn ZonePairRateLookup>,
    surge: SurgeEstimator,
    /// Pair-rate lookups, including negative results.
    rate_cache: Mutex<LruCache<(ZoneId, ZoneId), Option<RateCard>>>,
    lookup_timeout: Duration,
}

impl FareService {
    pub fn new(
        engine: PricingEngine,
        zones: ZoneResolver,
        pair_rates: Arc<dyn ZonePairRateLookup>,
        surge: SurgeEstimator,
        cache_capacity: usize,
        lookup_timeout: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            engine,
            zones,
            pair_rates,
            surge,
            rate_cache: Mutex::new(LruCache::new(capacity)),
            lookup_timeout,
        }
    }

    pub fn engine(&self) -> &PricingEngine {
        &self.engine
    }

    pub fn zones(&self) -> &ZoneResolver {
        &self.zones
    }

    pub async fn quote(&self, req: &QuoteRequest, now: DateTime<Utc>) -> Result<PricedTrip> {
        req.validate()?;

        let (pickup_zone, drop_zone) =
            tokio::join!(self.zones.resolve(req.pickup), self.zones.resolve(req.drop));

        let pair_rate = match (pickup_zone.id, drop_zone.id) {
            (Some(from), Some(to)) => self.pair_rate(from, to).await,
            _ => None,
        };
        let surge_multiplier = self.surge.estimate(pickup_zone.id, now).await;

        let ctx = QuoteContext {
            pickup_zone: &pickup_zone,
            drop_zone: &drop_zone,
            pair_rate,
            use_pickup_zone_rates: req
                .use_pickup_zone_rates
                .unwrap_or(self.engine.config().use_pickup_zone_rates),
            surge_multiplier,
            now,
        };
        let quote = self.engine.quote(&req.trip_facts(), &ctx);
        debug!(
            pickup_zone = ?pickup_zone.id,
            drop_zone = ?drop_zone.id,
            surge = quote.surge_multiplier,
            total = quote.total,
            "fare quoted"
        );

        Ok(PricedTrip {
            quote,
            pickup_zone,
            drop_zone,
        })
    }

    async fn pair_rate(&self, from: ZoneId, to: ZoneId) -> Option<RateCard> {
        let key = (from, to);
        if let Ok(mut cache) = self.rate_cache.lock() {
            if let Some(hit) = cache.get(&key) {
                return *hit;
            }
        }

        let lookup = self.pair_rates.pair_rate(from, to);
        let fetched = match bounded("pair rate lookup", self.lookup_timeout, lookup).await {
            Ok(rate) => rate,
            Err(err) if err.is_retryable() => {
                warn!(from = %from, to = %to, error = %err, "pair rate lookup failed");
                return None;
            }
            // Asking again will not help; remember that this pair has no rate.
            Err(err) => {
                warn!(from = %from, to = %to, error = %err, "pair rate lookup rejected");
                None
            }
        };

        // Skip caching if the mutex is poisoned; the next call will fetch again.
        if let Ok(mut cache) = self.rate_cache.lock() {
            cache.put(key, fetched);
        }
        fetched
    }

    /// Drop cached pair rates after zone or rate changes.
    pub fn invalidate_rates(&self) {
        if let Ok(mut cache) = self.rate_cache.lock() {
            cache.clear();
        }
    }
}
