//! Nearest-driver search with exclusive reservation.
//!
//! A search repeatedly asks the proximity index for candidates, ranks them and
//! tries to flip each one's reservation flag in order. Losing a race to another
//! ride just moves on to the next candidate. When nobody can be reserved the
//! search sleeps on the backoff schedule and tries again until its budget runs
//! out or the ride's cancellation token fires.

pub mod backoff;
pub mod ranking;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{bounded, DispatchError, Result};
use crate::geo::{DistanceMetric, GeoPoint};
use crate::lifecycle::RideId;
use crate::ports::NearbyDrivers;
use crate::pricing::VehicleType;
use crate::registry::{DriverId, DriverRegistry};
use crate::telemetry::DispatchStats;

pub use backoff::BackoffPolicy;
pub use ranking::{compare_candidates, Candidate, CandidateRanking, NearestFirst};

/// Which in-process index answers proximity queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProximityIndex {
    #[default]
    H3Grid,
    LinearScan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub search_radius_km: f64,
    /// Total time a ride may spend searching before it is cancelled.
    pub search_timeout_secs: u64,
    pub lookup_timeout_ms: u64,
    pub distance_metric: DistanceMetric,
    pub proximity_index: ProximityIndex,
    pub h3_resolution: u8,
    pub backoff: BackoffPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            search_radius_km: 5.0,
            search_timeout_secs: 120,
            lookup_timeout_ms: 500,
            distance_metric: DistanceMetric::Haversine,
            proximity_index: ProximityIndex::H3Grid,
            h3_resolution: 9,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl DispatchConfig {
    pub fn search_budget(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

/// What a search needs to know about its ride.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub ride_id: RideId,
    pub pickup: GeoPoint,
    pub vehicle_type: VehicleType,
    /// Drivers that already declined this ride.
    pub excluded: Vec<DriverId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    /// The driver is reserved for this ride; the caller owns the reservation.
    Reserved(DriverId),
    Exhausted { attempts: u32 },
    Cancelled,
}

pub struct DispatchEngine {
    registry: Arc<DriverRegistry>,
    nearby: Arc<dyn NearbyDrivers>,
    ranking: Arc<dyn CandidateRanking>,
    config: DispatchConfig,
    stats: Arc<DispatchStats>,
}

impl DispatchEngine {
    pub fn new(
        registry: Arc<DriverRegistry>,
        nearby: Arc<dyn NearbyDrivers>,
        config: DispatchConfig,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            registry,
            nearby,
            ranking: Arc::new(NearestFirst),
            config,
            stats,
        }
    }

    pub fn with_ranking(mut self, ranking: Arc<dyn CandidateRanking>) -> Self {
        self.ranking = ranking;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Available drivers near the pickup, best first. Proximity failures give
    /// an empty list.
    pub async fn candidates(&self, req: &SearchRequest) -> Vec<Candidate> {
        let radius = self.config.search_radius_km;
        let lookup = self.nearby.nearby(req.pickup, radius);
        let nearby = match bounded("proximity lookup", self.config.lookup_timeout(), lookup).await {
            Ok(nearby) => nearby,
            Err(err) => {
                warn!(ride_id = %req.ride_id, error = %err, "proximity lookup failed");
                return Vec::new();
            }
        };

        let metric = self.config.distance_metric;
        let mut candidates: Vec<Candidate> = nearby
            .into_iter()
            .filter(|n| !req.excluded.contains(&n.driver_id))
            .filter_map(|n| {
                let snapshot = self.registry.snapshot(&n.driver_id)?;
                if !snapshot.online || snapshot.reserved {
                    return None;
                }
                if !snapshot.profile.serves(req.vehicle_type) {
                    return None;
                }
                let distance_km = metric.distance_km(req.pickup, n.position);
                (distance_km <= radius).then_some(Candidate {
                    driver_id: n.driver_id,
                    distance_km,
                    rating: snapshot.profile.rating,
                    last_update: snapshot.updated_at,
                })
            })
            .collect();
        self.ranking.rank(&mut candidates);
        candidates
    }

    /// One pass over the ranked candidates. On success the returned driver is
    /// reserved and the caller must hand it to the ride or release it.
    pub async fn find_and_reserve(&self, req: &SearchRequest) -> Result<DriverId> {
        let candidates = self.candidates(req).await;
        for candidate in candidates {
            if self.registry.try_reserve(&candidate.driver_id) {
                debug!(
                    ride_id = %req.ride_id,
                    driver_id = %candidate.driver_id,
                    distance_km = candidate.distance_km,
                    "driver reserved"
                );
                return Ok(candidate.driver_id);
            }
            self.stats.record_reservation_conflict();
            debug!(ride_id = %req.ride_id, driver_id = %candidate.driver_id, "lost reservation race");
        }
        Err(DispatchError::NoDriverAvailable)
    }

    /// Retry [`find_and_reserve`](Self::find_and_reserve) on the backoff
    /// schedule until a driver is reserved, the budget is spent or `cancel`
    /// fires.
    pub async fn search(&self, req: &SearchRequest, cancel: &CancellationToken) -> SearchOutcome {
        let deadline = Instant::now() + self.config.search_budget();
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return SearchOutcome::Cancelled;
            }
            attempts += 1;
            self.stats.record_search_attempt();

            match self.find_and_reserve(req).await {
                Ok(driver_id) => {
                    if cancel.is_cancelled() {
                        self.release(&driver_id);
                        return SearchOutcome::Cancelled;
                    }
                    info!(ride_id = %req.ride_id, driver_id = %driver_id, attempts, "search reserved driver");
                    return SearchOutcome::Reserved(driver_id);
                }
                Err(err) => {
                    debug!(ride_id = %req.ride_id, attempts, error = %err, "no driver this attempt");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                info!(ride_id = %req.ride_id, attempts, "search budget exhausted");
                return SearchOutcome::Exhausted { attempts };
            }
            let delay = self
                .config
                .backoff
                .delay(attempts - 1, &mut rand::thread_rng());
            let wake = (now + delay).min(deadline);

            tokio::select! {
                _ = cancel.cancelled() => return SearchOutcome::Cancelled,
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    pub fn release(&self, driver_id: &DriverId) {
        self.registry.release(driver_id);
    }
}
