//! The ride service: one owned object wiring zones, pricing, drivers, dispatch
//! and the ride book together.
//!
//! Created once at process start with [`RideService::new`] and torn down with
//! [`RideService::shutdown`]. Cloning is cheap and every clone refers to the
//! same service. Each dispatch search runs as its own task, tracked so that
//! shutdown can wait for all of them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::clock::Clock;
use crate::config::{ServiceConfig, Validate};
use crate::dispatch::{CandidateRanking, DispatchEngine, ProximityIndex, SearchOutcome, SearchRequest};
use crate::error::{DispatchError, Result};
use crate::events::{EventBroadcaster, PositionUpdate};
use crate::geo::GeoPoint;
use crate::lifecycle::{
    CancellationReason, EarningsSummary, Ride, RideBook, RideDraft, RideId, RideStatus, RiderId,
    Transition,
};
use crate::ports::{NearbyDrivers, Notifier, PointInZone, ZonePairRateLookup, ZoneRateLookup};
use crate::pricing::{FareQuote, FareService, PricingEngine, QuoteRequest, VehicleType};
use crate::registry::{DriverId, DriverProfile, DriverRegistry, DriverSnapshot, LinearScanNearby};
use crate::spatial::GeoIndex;
use crate::surge::SurgeEstimator;
use crate::telemetry::{DispatchStats, StatsSnapshot};
use crate::zones::{InMemoryZoneStore, ZoneResolver};

/// A rider asking for a ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideRequest {
    pub rider_id: RiderId,
    pub pickup: GeoPoint,
    pub drop: GeoPoint,
    /// Required; `None` is rejected as invalid input.
    pub vehicle_type: Option<VehicleType>,
    pub distance_km: Option<f64>,
    pub duration_min: Option<f64>,
    #[serde(default)]
    pub waiting_min: f64,
    pub use_pickup_zone_rates: Option<bool>,
}

impl RideRequest {
    pub fn new(rider_id: impl Into<RiderId>, pickup: GeoPoint, drop: GeoPoint, vehicle_type: VehicleType) -> Self {
        Self {
            rider_id: rider_id.into(),
            pickup,
            drop,
            vehicle_type: Some(vehicle_type),
            distance_km: None,
            duration_min: None,
            waiting_min: 0.0,
            use_pickup_zone_rates: None,
        }
    }

    pub fn with_trip(mut self, distance_km: f64, duration_min: f64) -> Self {
        self.distance_km = Some(distance_km);
        self.duration_min = Some(duration_min);
        self
    }
}

/// Returned as soon as the ride is priced and searching.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RideReceipt {
    pub ride_id: RideId,
    pub status: RideStatus,
    pub quote: FareQuote,
}

/// External systems the service talks to.
pub struct Collaborators {
    pub point_in_zone: Arc<dyn PointInZone>,
    pub zone_lookup: Arc<dyn ZoneRateLookup>,
    pub pair_rates: Arc<dyn ZonePairRateLookup>,
    pub notifier: Arc<dyn Notifier>,
    /// Proximity index to use instead of the in-process one.
    pub nearby_drivers: Option<Arc<dyn NearbyDrivers>>,
    /// Candidate order for reservation attempts; nearest first when unset.
    pub ranking: Option<Arc<dyn CandidateRanking>>,
}

impl Collaborators {
    pub fn in_memory(store: Arc<InMemoryZoneStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            point_in_zone: store.clone(),
            zone_lookup: store.clone(),
            pair_rates: store,
            notifier,
            nearby_drivers: None,
            ranking: None,
        }
    }
}

struct Inner {
    clock: Arc<dyn Clock>,
    registry: Arc<DriverRegistry>,
    book: Arc<RideBook>,
    zones: ZoneResolver,
    fares: FareService,
    dispatch: DispatchEngine,
    events: EventBroadcaster,
    stats: Arc<DispatchStats>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

#[derive(Clone)]
pub struct RideService {
    inner: Arc<Inner>,
}

impl RideService {
    pub fn new(config: ServiceConfig, collaborators: Collaborators, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let resolution = config.h3_resolution()?;
        let metric = config.dispatch.distance_metric;

        let stats = Arc::new(DispatchStats::new());
        let registry = Arc::new(DriverRegistry::new(GeoIndex::new(resolution), metric));
        let events = EventBroadcaster::new(collaborators.notifier);
        let book = Arc::new(RideBook::new(events.clone()));

        let zones = ZoneResolver::new(
            collaborators.point_in_zone,
            config.zones.default_rates,
            config.zones.lookup_timeout(),
        );
        let surge = SurgeEstimator::new(
            config.surge.clone(),
            collaborators.zone_lookup,
            book.clone(),
            registry.clone(),
            config.pricing.utc_offset_minutes,
        );
        let fares = FareService::new(
            PricingEngine::new(config.pricing.clone()),
            zones.clone(),
            collaborators.pair_rates,
            surge,
            config.zones.rate_cache_capacity,
            config.zones.lookup_timeout(),
        );

        let nearby: Arc<dyn NearbyDrivers> = match collaborators.nearby_drivers {
            Some(external) => external,
            None => match config.dispatch.proximity_index {
                ProximityIndex::H3Grid => registry.clone() as Arc<dyn NearbyDrivers>,
                ProximityIndex::LinearScan => Arc::new(LinearScanNearby::new(registry.clone(), metric)),
            },
        };
        let mut dispatch = DispatchEngine::new(registry.clone(), nearby, config.dispatch.clone(), stats.clone());
        if let Some(ranking) = collaborators.ranking {
            dispatch = dispatch.with_ranking(ranking);
        }

        info!(
            radius_km = config.dispatch.search_radius_km,
            search_timeout_secs = config.dispatch.search_timeout_secs,
            proximity = ?config.dispatch.proximity_index,
            "ride service started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                clock,
                registry,
                book,
                zones,
                fares,
                dispatch,
                events,
                stats,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        })
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            Err(DispatchError::invalid_input("service is shutting down"))
        } else {
            Ok(())
        }
    }

    fn release(&self, driver_id: Option<&DriverId>) {
        if let Some(driver_id) = driver_id {
            self.inner.dispatch.release(driver_id);
        }
    }

    /// Price the trip, open the ride and start searching in the background.
    pub async fn request_ride(&self, req: RideRequest) -> Result<RideReceipt> {
        self.ensure_running()?;
        let vehicle_type = req
            .vehicle_type
            .ok_or_else(|| DispatchError::invalid_input("vehicle type is required"))?;
        if let Some(ride_id) = self.inner.book.active_ride_for_rider(&req.rider_id) {
            return Err(DispatchError::ActiveRideExists {
                rider_id: req.rider_id,
                ride_id,
            });
        }

        let quote_request = QuoteRequest {
            pickup: req.pickup,
            drop: req.drop,
            vehicle_type,
            distance_km: req.distance_km,
            duration_min: req.duration_min,
            waiting_min: req.waiting_min,
            use_pickup_zone_rates: req.use_pickup_zone_rates,
        };
        let priced = self.inner.fares.quote(&quote_request, self.now()).await?;

        let draft = RideDraft {
            rider_id: req.rider_id,
            pickup: req.pickup,
            drop: req.drop,
            pickup_zone_id: priced.pickup_zone.id,
            drop_zone_id: priced.drop_zone.id,
            vehicle_type,
            quote: priced.quote,
        };
        let opened = self.inner.book.open(draft, self.now())?;
        self.inner.stats.record_requested();
        let ride_id = opened.ride.id;

        let token = self.inner.shutdown.child_token();
        let (searching, search) = self.inner.book.begin_search(ride_id, token.clone(), self.now())?;
        self.spawn_search(search, token);

        Ok(RideReceipt {
            ride_id,
            status: searching.ride.status,
            quote: searching.ride.quoted_fare,
        })
    }

    fn spawn_search(&self, search: SearchRequest, token: CancellationToken) {
        let service = self.clone();
        let span = info_span!("ride_search", ride_id = %search.ride_id);
        self.inner
            .tasks
            .spawn(async move { service.run_search(search, token).await }.instrument(span));
    }

    async fn run_search(&self, search: SearchRequest, token: CancellationToken) {
        let ride_id = search.ride_id;
        match self.inner.dispatch.search(&search, &token).await {
            SearchOutcome::Reserved(driver_id) => {
                match self.inner.book.mark_matched(ride_id, &driver_id, self.now()) {
                    Ok(_) => {
                        self.inner.stats.record_matched();
                        info!(driver_id = %driver_id, "ride matched");
                    }
                    Err(err) => {
                        self.inner.dispatch.release(&driver_id);
                        debug!(driver_id = %driver_id, error = %err, "match discarded, driver released");
                    }
                }
            }
            SearchOutcome::Exhausted { attempts } => {
                match self
                    .inner
                    .book
                    .cancel(ride_id, CancellationReason::NoDriverFound, self.now())
                {
                    Ok(cancelled) => {
                        self.release(cancelled.released.as_ref());
                        self.inner.stats.record_no_driver_found();
                        self.inner.stats.record_cancelled();
                        info!(attempts, "no driver found, ride cancelled");
                    }
                    Err(err) => debug!(error = %err, "ride left searching before budget ran out"),
                }
            }
            SearchOutcome::Cancelled => debug!("search cancelled"),
        }
    }

    pub fn accept_ride(&self, ride_id: RideId, driver_id: &DriverId) -> Result<Ride> {
        let accepted = self.inner.book.accept(ride_id, driver_id, self.now())?;
        Ok(accepted.ride)
    }

    /// The matched driver passes; the ride goes back to searching without them.
    pub fn decline_ride(&self, ride_id: RideId, driver_id: &DriverId) -> Result<Ride> {
        self.ensure_running()?;
        let token = self.inner.shutdown.child_token();
        let (declined, search) = self
            .inner
            .book
            .decline(ride_id, driver_id, token.clone(), self.now())?;
        self.release(declined.released.as_ref());
        self.inner.stats.record_declined();
        self.spawn_search(search, token);
        Ok(declined.ride)
    }

    pub fn start_ride(&self, ride_id: RideId) -> Result<Ride> {
        Ok(self.inner.book.start(ride_id, self.now())?.ride)
    }

    /// Finish the trip at the quoted total, or at `final_fare` when given.
    pub fn complete_ride(&self, ride_id: RideId, final_fare: Option<f64>) -> Result<Ride> {
        let completed = self.inner.book.complete(ride_id, final_fare, self.now())?;
        self.release(completed.released.as_ref());
        self.inner.stats.record_completed();
        Ok(completed.ride)
    }

    pub fn cancel_ride(&self, ride_id: RideId, reason: CancellationReason) -> Result<Ride> {
        let Transition { ride, released, .. } = self.inner.book.cancel(ride_id, reason, self.now())?;
        self.release(released.as_ref());
        self.inner.stats.record_cancelled();
        Ok(ride)
    }

    pub fn register_driver(&self, driver_id: impl Into<DriverId>, profile: DriverProfile) -> Result<bool> {
        self.inner.registry.register(driver_id.into(), profile)
    }

    pub async fn driver_online(&self, driver_id: &DriverId, position: GeoPoint) -> Result<()> {
        position.validate("driver position")?;
        let zone = self.inner.zones.resolve(position).await;
        self.inner
            .registry
            .go_online(driver_id, position, zone.id, self.now())
    }

    pub fn driver_offline(&self, driver_id: &DriverId) -> Result<()> {
        self.inner.registry.go_offline(driver_id)
    }

    /// Record a driver's position. Older reports than the stored one are
    /// ignored (returns false). The position is forwarded to the driver's
    /// active ride, if any.
    pub async fn update_driver_location(
        &self,
        driver_id: &DriverId,
        position: GeoPoint,
        reported_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        position.validate("driver position")?;
        let at = reported_at.unwrap_or_else(|| self.now());
        let zone = self.inner.zones.resolve(position).await;
        let applied = self
            .inner
            .registry
            .update_position(driver_id, position, zone.id, at)?;
        if applied {
            if let Some(ride_id) = self.inner.book.active_ride_for_driver(driver_id) {
                self.inner.events.position(&PositionUpdate {
                    ride_id,
                    driver_id: driver_id.clone(),
                    position,
                    at,
                });
            }
        }
        Ok(applied)
    }

    pub fn ride(&self, ride_id: RideId) -> Result<Ride> {
        self.inner
            .book
            .get(ride_id)
            .ok_or(DispatchError::RideNotFound(ride_id))
    }

    /// Wait until the ride has a driver. A ride whose search ran out of budget
    /// fails with [`DispatchError::NoDriverFound`]; any other cancellation
    /// with [`DispatchError::AlreadyTerminal`]. A decline puts the wait back
    /// on until the next match.
    pub async fn wait_for_driver(&self, ride_id: RideId) -> Result<Ride> {
        let mut status = self.inner.book.watch(ride_id)?;
        loop {
            let current = *status.borrow_and_update();
            if current.has_driver() {
                return self.ride(ride_id);
            }
            if current == RideStatus::Cancelled {
                let ride = self.ride(ride_id)?;
                return Err(match ride.cancellation_reason {
                    Some(CancellationReason::NoDriverFound) => DispatchError::NoDriverFound(ride_id),
                    _ => DispatchError::AlreadyTerminal {
                        ride_id,
                        status: RideStatus::Cancelled,
                    },
                });
            }
            if status.changed().await.is_err() {
                return self.ride(ride_id);
            }
        }
    }

    /// The rider's rides, oldest request first.
    pub fn rides_for_rider(&self, rider_id: &RiderId) -> Vec<Ride> {
        self.inner.book.rides_for_rider(rider_id)
    }

    /// Rides the driver was matched to and did not decline, oldest first.
    pub fn rides_for_driver(&self, driver_id: &DriverId) -> Result<Vec<Ride>> {
        if self.inner.registry.snapshot(driver_id).is_none() {
            return Err(DispatchError::DriverNotFound(driver_id.clone()));
        }
        Ok(self.inner.book.rides_for_driver(driver_id))
    }

    pub fn driver(&self, driver_id: &DriverId) -> Result<DriverSnapshot> {
        self.inner
            .registry
            .snapshot(driver_id)
            .ok_or_else(|| DispatchError::DriverNotFound(driver_id.clone()))
    }

    pub fn drivers(&self) -> Vec<DriverSnapshot> {
        self.inner.registry.snapshots()
    }

    pub fn driver_earnings(&self, driver_id: &DriverId, since: DateTime<Utc>) -> Result<EarningsSummary> {
        if self.inner.registry.snapshot(driver_id).is_none() {
            return Err(DispatchError::DriverNotFound(driver_id.clone()));
        }
        Ok(self.inner.book.earnings(driver_id, since))
    }

    /// Price a trip without opening a ride.
    pub async fn quote(&self, req: &QuoteRequest) -> Result<FareQuote> {
        Ok(self.inner.fares.quote(req, self.now()).await?.quote)
    }

    /// Drop cached pair rates after zone or rate changes.
    pub fn invalidate_rates(&self) {
        self.inner.fares.invalidate_rates();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Stop all searches, wait for their tasks and cancel every ride that was
    /// still waiting for a driver.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!(searches = self.inner.tasks.len(), "ride service shutting down");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        let mut cancelled = 0usize;
        for ride_id in self.inner.book.unmatched_ids() {
            match self
                .inner
                .book
                .cancel(ride_id, CancellationReason::SystemShutdown, self.now())
            {
                Ok(transition) => {
                    self.release(transition.released.as_ref());
                    self.inner.stats.record_cancelled();
                    cancelled += 1;
                }
                Err(err) => warn!(ride_id = %ride_id, error = %err, "could not cancel ride on shutdown"),
            }
        }
        info!(cancelled, "ride service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::clock::ManualClock;
    use crate::dispatch::Candidate;
    use crate::events::LocalNotifier;
    use crate::test_helpers::{central_zone, point_near, test_config, test_start, TestHarness, CITY_CENTER};

    struct TopRatedFirst;

    impl CandidateRanking for TopRatedFirst {
        fn rank(&self, candidates: &mut [Candidate]) {
            candidates.sort_by(|a, b| b.rating.total_cmp(&a.rating));
        }
    }

    #[tokio::test]
    async fn missing_vehicle_type_is_invalid_input() {
        let harness = TestHarness::new();
        let mut req = RideRequest::new("r1", CITY_CENTER, point_near(CITY_CENTER, 2.0, 0.0), VehicleType::Standard);
        req.vehicle_type = None;
        assert!(matches!(
            harness.service.request_ride(req).await,
            Err(DispatchError::InvalidInput { .. })
        ));
        assert_eq!(harness.service.stats().requested, 0);
    }

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let harness = TestHarness::new();
        let ride_id = RideId::new();
        assert!(matches!(harness.service.ride(ride_id), Err(DispatchError::RideNotFound(_))));
        assert!(matches!(
            harness.service.accept_ride(ride_id, &DriverId::from("d1")),
            Err(DispatchError::RideNotFound(_))
        ));
        assert!(matches!(
            harness.service.driver_earnings(&DriverId::from("d1"), harness.clock.now()),
            Err(DispatchError::DriverNotFound(_))
        ));
    }

    #[tokio::test]
    async fn a_supplied_ranking_decides_who_is_reserved() {
        let zones = Arc::new(InMemoryZoneStore::new());
        zones.insert_zone(central_zone()).unwrap();
        let mut collaborators = Collaborators::in_memory(zones, Arc::new(LocalNotifier::default()));
        collaborators.ranking = Some(Arc::new(TopRatedFirst));
        let service = RideService::new(test_config(), collaborators, Arc::new(ManualClock::new(test_start()))).unwrap();

        for (name, rating, north_km) in [("close", 3.5, 0.2), ("star", 5.0, 2.0)] {
            let profile = DriverProfile {
                rating,
                ..DriverProfile::default()
            };
            service.register_driver(name, profile).unwrap();
            service
                .driver_online(&DriverId::from(name), point_near(CITY_CENTER, north_km, 0.0))
                .await
                .unwrap();
        }

        let req = RideRequest::new("r1", CITY_CENTER, point_near(CITY_CENTER, 3.0, 0.0), VehicleType::Standard);
        let receipt = service.request_ride(req).await.unwrap();
        let ride = tokio::time::timeout(Duration::from_secs(2), service.wait_for_driver(receipt.ride_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ride.driver_id, Some(DriverId::from("star")));
    }

    #[tokio::test]
    async fn waiting_riders_learn_no_driver_was_found() {
        let mut config = test_config();
        config.dispatch.search_timeout_secs = 1;
        let harness = TestHarness::with_config(config);
        let req = RideRequest::new("r1", CITY_CENTER, point_near(CITY_CENTER, 2.0, 0.0), VehicleType::Standard);
        let receipt = harness.service.request_ride(req).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), harness.service.wait_for_driver(receipt.ride_id))
            .await
            .unwrap();
        assert!(matches!(outcome, Err(DispatchError::NoDriverFound(id)) if id == receipt.ride_id));
        let history = harness.service.rides_for_rider(&RiderId::from("r1"));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].cancellation_reason, Some(CancellationReason::NoDriverFound));
    }

    #[tokio::test]
    async fn requests_after_shutdown_are_refused() {
        let harness = TestHarness::new();
        harness.service.shutdown().await;
        let req = RideRequest::new("r1", CITY_CENTER, point_near(CITY_CENTER, 2.0, 0.0), VehicleType::Standard);
        assert!(harness.service.request_ride(req).await.is_err());
    }
}
