//! Fare calculation.
//!
//! [`engine::PricingEngine`] is pure: given trip facts, rate cards, a surge
//! multiplier and a timestamp it always returns the same breakdown.
//! [`service::FareService`] does the I/O around it (zone resolution, pair-rate
//! lookup, surge estimation) with timeouts and fallbacks.

pub mod engine;
pub mod service;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::clock::HourWindow;
use crate::error::DispatchError;
use crate::zones::ZoneId;

pub use engine::{PricingEngine, QuoteContext, TripFacts};
pub use service::{FareService, PricedTrip, QuoteRequest};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Bike,
    Scooty,
    #[default]
    Standard,
    Comfort,
    Premium,
    Xl,
}

impl VehicleType {
    pub const ALL: [VehicleType; 6] = [
        VehicleType::Bike,
        VehicleType::Scooty,
        VehicleType::Standard,
        VehicleType::Comfort,
        VehicleType::Premium,
        VehicleType::Xl,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VehicleType::Bike => "bike",
            VehicleType::Scooty => "scooty",
            VehicleType::Standard => "standard",
            VehicleType::Comfort => "comfort",
            VehicleType::Premium => "premium",
            VehicleType::Xl => "xl",
        }
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleType {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        VehicleType::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| DispatchError::invalid_input(format!("unknown vehicle type '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VehicleMultipliers {
    pub bike: f64,
    pub scooty: f64,
    pub standard: f64,
    pub comfort: f64,
    pub premium: f64,
    pub xl: f64,
}

impl Default for VehicleMultipliers {
    fn default() -> Self {
        Self {
            bike: 0.6,
            scooty: 0.7,
            standard: 1.0,
            comfort: 1.3,
            premium: 1.8,
            xl: 1.5,
        }
    }
}

impl VehicleMultipliers {
    pub fn get(&self, vehicle_type: VehicleType) -> f64 {
        match vehicle_type {
            VehicleType::Bike => self.bike,
            VehicleType::Scooty => self.scooty,
            VehicleType::Standard => self.standard,
            VehicleType::Comfort => self.comfort,
            VehicleType::Premium => self.premium,
            VehicleType::Xl => self.xl,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (VehicleType, f64)> + '_ {
        VehicleType::ALL.into_iter().map(|v| (v, self.get(v)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NightSurcharge {
    pub enabled: bool,
    pub start_hour: u32,
    pub end_hour: u32,
    pub multiplier: f64,
}

impl Default for NightSurcharge {
    fn default() -> Self {
        Self {
            enabled: true,
            start_hour: 22,
            end_hour: 6,
            multiplier: 1.25,
        }
    }
}

impl NightSurcharge {
    pub fn window(&self) -> HourWindow {
        HourWindow::new(self.start_hour, self.end_hour)
    }

    pub fn multiplier_at(&self, local_hour: u32) -> f64 {
        if self.enabled && self.window().contains(local_hour) {
            self.multiplier
        } else {
            1.0
        }
    }
}

/// Waiting beyond the free allowance is billed per minute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitingCharge {
    pub free_minutes: f64,
    pub per_minute: f64,
}

impl Default for WaitingCharge {
    fn default() -> Self {
        Self {
            free_minutes: 3.0,
            per_minute: 2.0,
        }
    }
}

impl WaitingCharge {
    pub fn billable_minutes(&self, waiting_min: f64) -> f64 {
        (waiting_min - self.free_minutes).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub vehicle_multipliers: VehicleMultipliers,
    pub night: NightSurcharge,
    pub waiting: WaitingCharge,
    pub max_surge_multiplier: f64,
    pub commission_rate: f64,
    pub tax_rate: f64,
    /// Fares are rounded to a multiple of this amount.
    pub currency_unit: f64,
    pub use_pickup_zone_rates: bool,
    /// Offset applied to UTC to get the local hour for night and rush windows.
    pub utc_offset_minutes: i32,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            vehicle_multipliers: VehicleMultipliers::default(),
            night: NightSurcharge::default(),
            waiting: WaitingCharge::default(),
            max_surge_multiplier: 3.0,
            commission_rate: 0.20,
            tax_rate: 0.05,
            currency_unit: 1.0,
            use_pickup_zone_rates: true,
            utc_offset_minutes: 0,
        }
    }
}

/// Which rate card a quote was priced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateSource {
    ZonePair,
    PickupZone,
    Blended,
}

/// Itemised fare. `subtotal` and everything derived from it are rounded to the
/// currency unit; the components are left unrounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FareQuote {
    pub vehicle_type: VehicleType,
    pub distance_km: f64,
    pub duration_min: f64,
    pub billable_waiting_min: f64,
    pub rate_source: RateSource,
    pub pickup_zone_id: Option<ZoneId>,
    pub drop_zone_id: Option<ZoneId>,
    pub vehicle_multiplier: f64,
    pub base_fare: f64,
    pub distance_fare: f64,
    pub time_fare: f64,
    pub waiting_fare: f64,
    pub minimum_fare: f64,
    pub night_multiplier: f64,
    pub surge_multiplier: f64,
    pub subtotal: f64,
    pub commission: f64,
    pub tax: f64,
    pub driver_payout: f64,
    pub total: f64,
}
