//! Service configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Sections: `[pricing]`, `[surge]`, `[dispatch]`, `[zones]`,
//! `[events]`.

use std::path::Path;
use std::time::Duration;

use h3o::Resolution;
use serde::{Deserialize, Serialize};

use crate::dispatch::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::pricing::PricingConfig;
use crate::surge::SurgeConfig;
use crate::zones::RateCard;

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

fn invalid(field: &str, value: impl std::fmt::Display, reason: &str) -> DispatchError {
    DispatchError::config(format!("{field} = {value}: {reason}"))
}

pub fn validate_non_negative(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(field, value, "must be a non-negative number"))
    }
}

pub fn validate_positive(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(field, value, "must be greater than zero"))
    }
}

pub fn validate_fraction(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, value, "must be within [0, 1]"))
    }
}

pub fn validate_hour(field: &str, hour: u32) -> Result<()> {
    if hour < 24 {
        Ok(())
    } else {
        Err(invalid(field, hour, "must be an hour of day in 0..24"))
    }
}

pub fn validate_multiplier_cap(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 1.0 {
        Ok(())
    } else {
        Err(invalid(field, value, "must be at least 1.0"))
    }
}

fn validate_rate_card(prefix: &str, rates: &RateCard) -> Result<()> {
    validate_non_negative(&format!("{prefix}.base_fare"), rates.base_fare)?;
    validate_non_negative(&format!("{prefix}.per_km"), rates.per_km)?;
    validate_non_negative(&format!("{prefix}.per_min"), rates.per_min)?;
    validate_non_negative(&format!("{prefix}.minimum_fare"), rates.minimum_fare)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    /// Rates of the fallback zone used when no polygon contains a point.
    pub default_rates: RateCard,
    pub lookup_timeout_ms: u64,
    pub rate_cache_capacity: usize,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            default_rates: RateCard::default(),
            lookup_timeout_ms: 500,
            rate_cache_capacity: 1024,
        }
    }
}

impl ZoneConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Per-topic buffer; slower subscribers lose the oldest messages.
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub pricing: PricingConfig,
    pub surge: SurgeConfig,
    pub dispatch: DispatchConfig,
    pub zones: ZoneConfig,
    pub events: EventsConfig,
}

impl ServiceConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ServiceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn h3_resolution(&self) -> Result<Resolution> {
        Resolution::try_from(self.dispatch.h3_resolution).map_err(|_| {
            invalid(
                "dispatch.h3_resolution",
                self.dispatch.h3_resolution,
                "must be an H3 resolution in 0..=15",
            )
        })
    }
}

impl Validate for PricingConfig {
    fn validate(&self) -> Result<()> {
        for (vehicle, multiplier) in self.vehicle_multipliers.iter() {
            validate_positive(&format!("pricing.vehicle_multipliers.{vehicle}"), multiplier)?;
        }
        validate_hour("pricing.night.start_hour", self.night.start_hour)?;
        validate_hour("pricing.night.end_hour", self.night.end_hour)?;
        validate_positive("pricing.night.multiplier", self.night.multiplier)?;
        validate_non_negative("pricing.waiting.free_minutes", self.waiting.free_minutes)?;
        validate_non_negative("pricing.waiting.per_minute", self.waiting.per_minute)?;
        validate_multiplier_cap("pricing.max_surge_multiplier", self.max_surge_multiplier)?;
        validate_fraction("pricing.commission_rate", self.commission_rate)?;
        validate_fraction("pricing.tax_rate", self.tax_rate)?;
        validate_positive("pricing.currency_unit", self.currency_unit)?;
        if self.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(invalid(
                "pricing.utc_offset_minutes",
                self.utc_offset_minutes,
                "must be within ±24h",
            ));
        }
        Ok(())
    }
}

impl Validate for SurgeConfig {
    fn validate(&self) -> Result<()> {
        if self.window_minutes == 0 {
            return Err(invalid("surge.window_minutes", 0, "must be greater than zero"));
        }
        validate_multiplier_cap("surge.cap", self.cap)?;
        validate_positive("surge.rush_factor", self.rush_factor)?;
        for window in &self.rush_hours {
            validate_hour("surge.rush_hours.start_hour", window.start_hour)?;
            validate_hour("surge.rush_hours.end_hour", window.end_hour)?;
        }
        Ok(())
    }
}

impl Validate for DispatchConfig {
    fn validate(&self) -> Result<()> {
        validate_positive("dispatch.search_radius_km", self.search_radius_km)?;
        if self.search_timeout_secs == 0 {
            return Err(invalid("dispatch.search_timeout_secs", 0, "search budget must be greater than zero"));
        }
        if self.lookup_timeout_ms == 0 {
            return Err(invalid("dispatch.lookup_timeout_ms", 0, "must be greater than zero"));
        }
        let backoff = &self.backoff;
        if backoff.initial_delay_ms == 0 {
            return Err(invalid("dispatch.backoff.initial_delay_ms", 0, "must be greater than zero"));
        }
        validate_multiplier_cap("dispatch.backoff.multiplier", backoff.multiplier)?;
        if backoff.max_delay_ms < backoff.initial_delay_ms {
            return Err(invalid(
                "dispatch.backoff.max_delay_ms",
                backoff.max_delay_ms,
                "must not be below initial_delay_ms",
            ));
        }
        Ok(())
    }
}

impl Validate for ServiceConfig {
    fn validate(&self) -> Result<()> {
        self.pricing.validate()?;
        self.surge.validate()?;
        self.dispatch.validate()?;
        self.h3_resolution()?;
        validate_rate_card("zones.default_rates", &self.zones.default_rates)?;
        if self.zones.lookup_timeout_ms == 0 {
            return Err(invalid("zones.lookup_timeout_ms", 0, "must be greater than zero"));
        }
        if self.zones.rate_cache_capacity == 0 {
            return Err(invalid("zones.rate_cache_capacity", 0, "must be greater than zero"));
        }
        if self.events.channel_capacity == 0 {
            return Err(invalid("events.channel_capacity", 0, "must be greater than zero"));
        }
        Ok(())
    }
}
