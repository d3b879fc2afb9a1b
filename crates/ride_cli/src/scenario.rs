//! Seeded demo scenario: a fleet comes online around a city centre, riders
//! request concurrently, drivers accept (or now and then decline) and finish.

use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ride_core::geo::GeoPoint;
use ride_core::lifecycle::{Ride, RideId, RiderId};
use ride_core::pricing::VehicleType;
use ride_core::registry::{DriverId, DriverProfile};
use ride_core::zones::{InMemoryZoneStore, RateCard, Zone, ZoneId};
use ride_core::{DispatchError, RideRequest, RideService};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const BENGALURU: GeoPoint = GeoPoint::new(12.9716, 77.5946);

#[derive(Debug, Clone)]
pub struct ScenarioParams {
    pub num_drivers: usize,
    pub num_riders: usize,
    pub seed: u64,
    pub center: GeoPoint,
    /// Half side of the square drivers and pickups are spread over.
    pub spread_km: f64,
    /// Chance that the first matched driver passes on a ride.
    pub decline_rate: f64,
    /// Longest a rider waits for a match or a cancellation.
    pub match_wait: Duration,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScenarioReport {
    pub completed: usize,
    pub no_driver: usize,
    pub failed: usize,
    pub declined: usize,
    pub fares_collected: f64,
}

enum RiderOutcome {
    Completed { fare: f64, declined: bool },
    NoDriver,
}

impl ScenarioReport {
    fn record(&mut self, outcome: RiderOutcome) {
        match outcome {
            RiderOutcome::Completed { fare, declined } => {
                self.completed += 1;
                self.fares_collected += fare;
                if declined {
                    self.declined += 1;
                }
            }
            RiderOutcome::NoDriver => self.no_driver += 1,
        }
    }
}

struct RiderPlan {
    rider_id: RiderId,
    pickup: GeoPoint,
    drop: GeoPoint,
    vehicle_type: VehicleType,
    decline_first: bool,
}

fn square(id: ZoneId, name: &str, center: GeoPoint, half_km: f64, rates: RateCard, surge_enabled: bool) -> Zone {
    Zone {
        id: Some(id),
        name: name.to_string(),
        polygon: vec![
            center.offset_km(-half_km, -half_km),
            center.offset_km(-half_km, half_km),
            center.offset_km(half_km, half_km),
            center.offset_km(half_km, -half_km),
        ],
        rates,
        surge_enabled,
    }
}

/// A surge-enabled core zone and a cheaper zone east of it, with a pair rate
/// for trips from the core to the east.
pub fn demo_zones(center: GeoPoint) -> Result<InMemoryZoneStore> {
    let store = InMemoryZoneStore::new();
    store.insert_zone(square(ZoneId(1), "core", center, 4.0, RateCard::default(), true))?;
    store.insert_zone(square(
        ZoneId(2),
        "east",
        center.offset_km(0.0, 8.0),
        4.0,
        RateCard {
            base_fare: 25.0,
            per_km: 12.0,
            per_min: 1.5,
            minimum_fare: 40.0,
        },
        false,
    ))?;
    store.set_pair_rate(
        ZoneId(1),
        ZoneId(2),
        RateCard {
            base_fare: 40.0,
            per_km: 14.0,
            per_min: 2.0,
            minimum_fare: 60.0,
        },
    );
    Ok(store)
}

fn random_point(rng: &mut StdRng, center: GeoPoint, spread_km: f64) -> GeoPoint {
    center.offset_km(
        rng.gen_range(-spread_km..=spread_km),
        rng.gen_range(-spread_km..=spread_km),
    )
}

/// Most riders book a standard car; the rest pick one of the other types.
fn random_vehicle(rng: &mut StdRng) -> VehicleType {
    if rng.gen_bool(0.6) {
        VehicleType::Standard
    } else {
        VehicleType::ALL[rng.gen_range(0..VehicleType::ALL.len())]
    }
}

async fn bring_fleet_online(service: &RideService, rng: &mut StdRng, params: &ScenarioParams) -> Result<()> {
    for i in 0..params.num_drivers {
        let driver_id = DriverId::new(format!("driver-{i:03}"));
        // Two in three drivers take any ride; the rest drive one vehicle type.
        let mut profile = if rng.gen_bool(2.0 / 3.0) {
            DriverProfile::default()
        } else {
            DriverProfile::with_vehicle(random_vehicle(rng))
        };
        profile.rating = rng.gen_range(3.5..=5.0);
        service.register_driver(driver_id.clone(), profile)?;
        let position = random_point(rng, params.center, params.spread_km);
        service
            .driver_online(&driver_id, position)
            .await
            .with_context(|| format!("bringing {driver_id} online"))?;
    }
    info!(drivers = params.num_drivers, "fleet online");
    Ok(())
}

/// The matched ride, or `None` when the search ran out of budget.
async fn wait_for_match(service: &RideService, ride_id: RideId, within: Duration) -> Result<Option<Ride>> {
    let waited = tokio::time::timeout(within, service.wait_for_driver(ride_id))
        .await
        .with_context(|| format!("ride {ride_id} neither matched nor cancelled in {within:?}"))?;
    match waited {
        Ok(ride) => Ok(Some(ride)),
        Err(DispatchError::NoDriverFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn ride_once(service: RideService, plan: RiderPlan, match_wait: Duration) -> Result<RiderOutcome> {
    let request = RideRequest::new(plan.rider_id.clone(), plan.pickup, plan.drop, plan.vehicle_type);
    let receipt = service.request_ride(request).await?;
    debug!(
        ride_id = %receipt.ride_id,
        rider_id = %plan.rider_id,
        total = receipt.quote.total,
        surge = receipt.quote.surge_multiplier,
        "ride requested"
    );

    let mut declined = false;
    loop {
        let Some(ride) = wait_for_match(&service, receipt.ride_id, match_wait).await? else {
            return Ok(RiderOutcome::NoDriver);
        };
        let driver_id = ride.driver_id.context("matched ride has no driver")?;
        if plan.decline_first && !declined {
            declined = true;
            service.decline_ride(ride.id, &driver_id)?;
            continue;
        }
        service.accept_ride(ride.id, &driver_id)?;
        service.update_driver_location(&driver_id, plan.pickup, None).await?;
        service.start_ride(ride.id)?;
        service.update_driver_location(&driver_id, plan.drop, None).await?;
        let completed = service.complete_ride(ride.id, None)?;
        return Ok(RiderOutcome::Completed {
            fare: completed.final_fare.unwrap_or_default(),
            declined,
        });
    }
}

pub async fn run(service: &RideService, params: &ScenarioParams) -> Result<ScenarioReport> {
    let mut rng = StdRng::seed_from_u64(params.seed);
    bring_fleet_online(service, &mut rng, params).await?;

    let mut riders = JoinSet::new();
    for i in 0..params.num_riders {
        let pickup = random_point(&mut rng, params.center, params.spread_km);
        let trip_km = rng.gen_range(1.0..8.0);
        let bearing: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
        let plan = RiderPlan {
            rider_id: RiderId::new(format!("rider-{i:04}")),
            pickup,
            drop: pickup.offset_km(trip_km * bearing.cos(), trip_km * bearing.sin()),
            vehicle_type: random_vehicle(&mut rng),
            decline_first: rng.gen_bool(params.decline_rate),
        };
        riders.spawn(ride_once(service.clone(), plan, params.match_wait));
    }

    let mut report = ScenarioReport::default();
    while let Some(joined) = riders.join_next().await {
        match joined {
            Ok(Ok(outcome)) => report.record(outcome),
            Ok(Err(err)) => {
                warn!(error = %err, "rider flow failed");
                report.failed += 1;
            }
            Err(err) => {
                warn!(error = %err, "rider task aborted");
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_zones_cover_the_centre_and_the_east() {
        let store = demo_zones(BENGALURU).unwrap();
        assert_eq!(store.len(), 2);
        let core = square(ZoneId(1), "core", BENGALURU, 4.0, RateCard::default(), true);
        assert!(core.contains(BENGALURU));
        assert!(!core.contains(BENGALURU.offset_km(0.0, 8.0)));
    }

    #[test]
    fn the_same_seed_draws_the_same_points() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            assert_eq!(random_point(&mut a, BENGALURU, 5.0), random_point(&mut b, BENGALURU, 5.0));
        }
    }
}
