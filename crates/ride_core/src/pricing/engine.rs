use chrono::{DateTime, Utc};

use crate::clock::local_hour;
use crate::pricing::{FareQuote, PricingConfig, RateSource, VehicleType};
use crate::zones::{RateCard, Zone};

/// Trip measurements a fare is computed from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripFacts {
    pub distance_km: f64,
    pub duration_min: f64,
    pub waiting_min: f64,
    pub vehicle_type: VehicleType,
}

/// Everything a quote depends on besides the trip itself.
#[derive(Debug, Clone, Copy)]
pub struct QuoteContext<'a> {
    pub pickup_zone: &'a Zone,
    pub drop_zone: &'a Zone,
    pub pair_rate: Option<RateCard>,
    pub use_pickup_zone_rates: bool,
    pub surge_multiplier: f64,
    pub now: DateTime<Utc>,
}

/// Pick the rate card: explicit pair rate, then pickup zone, then a blend of
/// pickup and drop zones.
pub fn resolve_rates(ctx: &QuoteContext<'_>) -> (RateCard, RateSource) {
    if let Some(pair) = ctx.pair_rate {
        (pair, RateSource::ZonePair)
    } else if ctx.use_pickup_zone_rates {
        (ctx.pickup_zone.rates, RateSource::PickupZone)
    } else {
        (
            ctx.pickup_zone.rates.blend(&ctx.drop_zone.rates),
            RateSource::Blended,
        )
    }
}

fn round_to(value: f64, unit: f64) -> f64 {
    if unit > 0.0 {
        (value / unit).round() * unit
    } else {
        value
    }
}

#[derive(Debug, Clone, Default)]
pub struct PricingEngine {
    config: PricingConfig,
}

impl PricingEngine {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PricingConfig {
        &self.config
    }

    /// Clamp a raw surge multiplier into `[1.0, max_surge_multiplier]`.
    pub fn clamp_surge(&self, surge: f64) -> f64 {
        if surge.is_nan() {
            return 1.0;
        }
        surge.clamp(1.0, self.config.max_surge_multiplier.max(1.0))
    }

    pub fn quote(&self, trip: &TripFacts, ctx: &QuoteContext<'_>) -> FareQuote {
        let cfg = &self.config;
        let (rates, rate_source) = resolve_rates(ctx);
        let vehicle_multiplier = cfg.vehicle_multipliers.get(trip.vehicle_type);

        let distance_km = trip.distance_km.max(0.0);
        let duration_min = trip.duration_min.max(0.0);
        let billable_waiting_min = cfg.waiting.billable_minutes(trip.waiting_min.max(0.0));

        let base_fare = rates.base_fare * vehicle_multiplier;
        let distance_fare = rates.per_km * distance_km * vehicle_multiplier;
        let time_fare = rates.per_min * duration_min * vehicle_multiplier;
        let waiting_fare = billable_waiting_min * cfg.waiting.per_minute;
        let minimum_fare = rates.minimum_fare * vehicle_multiplier;

        let metered = base_fare + distance_fare + time_fare + waiting_fare;
        let night_multiplier = cfg
            .night
            .multiplier_at(local_hour(ctx.now, cfg.utc_offset_minutes));
        let surge_multiplier = self.clamp_surge(ctx.surge_multiplier);

        let subtotal = round_to(
            metered.max(minimum_fare) * night_multiplier * surge_multiplier,
            cfg.currency_unit,
        );
        let commission = round_to(subtotal * cfg.commission_rate, cfg.currency_unit);
        let tax = round_to(subtotal * cfg.tax_rate, cfg.currency_unit);

        FareQuote {
            vehicle_type: trip.vehicle_type,
            distance_km,
            duration_min,
            billable_waiting_min,
            rate_source,
            pickup_zone_id: ctx.pickup_zone.id,
            drop_zone_id: ctx.drop_zone.id,
            vehicle_multiplier,
            base_fare,
            distance_fare,
            time_fare,
            waiting_fare,
            minimum_fare,
            night_multiplier,
            surge_multiplier,
            subtotal,
            commission,
            tax,
            driver_payout: subtotal - commission - tax,
            total: subtotal + tax,
        }
    }
}
