//! Ride state machine and the book of all rides.
//!
//! ```text
//! Requested → Searching → Matched → Accepted → InProgress → Completed
//!                 ↑           │
//!                 └─ decline ─┘        (Requested..Accepted) → Cancelled
//! ```
//!
//! Each ride sits behind its own mutex. A transition validates and mutates the
//! ride, then publishes its event while still holding that mutex, so events for
//! one ride are observed in transition order. The mutex is never held across an
//! await and never while touching a driver's reservation flag; transitions that
//! free a driver hand it back in [`Transition::released`] for the caller.
//!
//! Lock order: active-rider shard → rides shard → ride mutex → driver and
//! history index shards. Readers copy ids out of an index before locking any
//! ride. The driver's active entry is written under the ride mutex so a racing
//! cancel always sees it; other index cleanup runs after the mutex is dropped.
//!
//! History indexes (per rider, per driver, per pickup zone) keep queries and
//! demand counts off the full book.

mod ride;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatch::SearchRequest;
use crate::error::{DispatchError, Result};
use crate::events::{EventBroadcaster, RideEvent};
use crate::ports::RideCountInWindow;
use crate::registry::DriverId;
use crate::zones::ZoneId;

pub use ride::{CancellationReason, Ride, RideDraft, RideId, RideStatus, RideTimeline, RiderId};

/// Result of a successful transition.
#[derive(Debug, Clone)]
pub struct Transition {
    pub event: RideEvent,
    /// The ride as it was right after the transition.
    pub ride: Ride,
    /// Driver no longer attached to the ride; its reservation must be released.
    pub released: Option<DriverId>,
}

struct RideSlot {
    ride: Ride,
    /// Cancels the running search, if any.
    search: Option<CancellationToken>,
    status: watch::Sender<RideStatus>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EarningsSummary {
    pub completed_rides: u64,
    pub total_fares: f64,
    /// Total of rides completed at or after the `since` cut-off.
    pub fares_since: f64,
    pub average_fare: f64,
}

pub struct RideBook {
    rides: DashMap<RideId, Arc<Mutex<RideSlot>>>,
    active_by_rider: DashMap<RiderId, RideId>,
    active_by_driver: DashMap<DriverId, RideId>,
    rides_by_rider: DashMap<RiderId, Vec<RideId>>,
    /// Rides each driver was matched to, declined ones included.
    rides_by_driver: DashMap<DriverId, Vec<RideId>>,
    rides_by_zone: DashMap<ZoneId, Vec<RideId>>,
    events: EventBroadcaster,
}

fn lock(slot: &Mutex<RideSlot>) -> MutexGuard<'_, RideSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn search_request(ride: &Ride) -> SearchRequest {
    SearchRequest {
        ride_id: ride.id,
        pickup: ride.pickup,
        vehicle_type: ride.vehicle_type,
        excluded: ride.declined_by.clone(),
    }
}

impl RideBook {
    pub fn new(events: EventBroadcaster) -> Self {
        Self {
            rides: DashMap::new(),
            active_by_rider: DashMap::new(),
            active_by_driver: DashMap::new(),
            rides_by_rider: DashMap::new(),
            rides_by_driver: DashMap::new(),
            rides_by_zone: DashMap::new(),
            events,
        }
    }

    fn slot(&self, ride_id: RideId) -> Result<Arc<Mutex<RideSlot>>> {
        self.rides
            .get(&ride_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(DispatchError::RideNotFound(ride_id))
    }

    fn all_slots(&self) -> Vec<Arc<Mutex<RideSlot>>> {
        self.rides.iter().map(|s| Arc::clone(s.value())).collect()
    }

    fn indexed<K>(index: &DashMap<K, Vec<RideId>>, key: &K) -> Vec<RideId>
    where
        K: std::hash::Hash + Eq,
    {
        index.get(key).map(|ids| ids.value().clone()).unwrap_or_default()
    }

    /// Current copies of `ids`, oldest request first.
    fn rides_of(&self, ids: Vec<RideId>) -> Vec<Ride> {
        let mut rides: Vec<Ride> = ids.into_iter().filter_map(|id| self.get(id)).collect();
        rides.sort_by(|a, b| {
            a.timeline
                .created_at
                .cmp(&b.timeline.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        rides
    }

    fn is_active(&self, ride_id: RideId) -> bool {
        self.slot(ride_id)
            .map(|slot| !lock(&slot).ride.status.is_terminal())
            .unwrap_or(false)
    }

    /// Apply `f` under the ride's lock, publish the event it produced and
    /// return the transition.
    fn transition<F>(&self, ride_id: RideId, f: F) -> Result<Transition>
    where
        F: FnOnce(&mut RideSlot) -> Result<(RideEvent, Option<DriverId>)>,
    {
        let slot = self.slot(ride_id)?;
        let mut guard = lock(&slot);
        let (event, released) = f(&mut guard)?;
        let status = guard.ride.status;
        guard.status.send_replace(status);
        self.events.lifecycle(&event);
        debug!(ride_id = %ride_id, event = event.name(), status = %guard.ride.status, "ride transition");
        Ok(Transition {
            event,
            ride: guard.ride.clone(),
            released,
        })
    }

    fn clear_indexes(&self, ride: &Ride, driver: Option<&DriverId>) {
        if ride.status.is_terminal() {
            self.active_by_rider
                .remove_if(&ride.rider_id, |_, active| *active == ride.id);
        }
        if let Some(driver_id) = driver {
            self.active_by_driver
                .remove_if(driver_id, |_, active| *active == ride.id);
        }
    }

    pub fn len(&self) -> usize {
        self.rides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rides.is_empty()
    }

    /// Create a ride in `Requested`. A rider may hold one non-terminal ride.
    pub fn open(&self, draft: RideDraft, now: DateTime<Utc>) -> Result<Transition> {
        let ride = Ride::new(draft, now);
        let ride_id = ride.id;
        let rider_id = ride.rider_id.clone();
        let event = RideEvent::Requested {
            ride_id,
            rider_id: rider_id.clone(),
            pickup: ride.pickup,
            drop: ride.drop,
            vehicle_type: ride.vehicle_type,
            fare_total: ride.quoted_fare.total,
            at: now,
        };
        let pickup_zone_id = ride.pickup_zone_id;
        let (status, _) = watch::channel(ride.status);
        let slot = Arc::new(Mutex::new(RideSlot {
            ride,
            search: None,
            status,
        }));

        // The rider's shard stays locked until the new ride is in the book.
        let active = self.active_by_rider.entry(rider_id.clone());
        if let Entry::Occupied(existing) = &active {
            let existing = *existing.get();
            if self.is_active(existing) {
                return Err(DispatchError::ActiveRideExists {
                    rider_id,
                    ride_id: existing,
                });
            }
        }
        self.rides.insert(ride_id, Arc::clone(&slot));
        active.insert(ride_id);
        self.rides_by_rider.entry(rider_id.clone()).or_default().push(ride_id);
        if let Some(zone_id) = pickup_zone_id {
            self.rides_by_zone.entry(zone_id).or_default().push(ride_id);
        }

        let guard = lock(&slot);
        self.events.lifecycle(&event);
        info!(ride_id = %ride_id, rider_id = %rider_id, fare = guard.ride.quoted_fare.total, "ride requested");
        Ok(Transition {
            event,
            ride: guard.ride.clone(),
            released: None,
        })
    }

    /// `Requested → Searching`. `search` is cancelled if the ride is cancelled.
    pub fn begin_search(
        &self,
        ride_id: RideId,
        search: CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<(Transition, SearchRequest)> {
        let transition = self.transition(ride_id, |slot| {
            slot.ride.begin_search(now)?;
            slot.search = Some(search);
            Ok((
                RideEvent::SearchStarted {
                    ride_id,
                    pickup: slot.ride.pickup,
                    vehicle_type: slot.ride.vehicle_type,
                    fare_total: slot.ride.quoted_fare.total,
                    at: now,
                },
                None,
            ))
        })?;
        let request = search_request(&transition.ride);
        Ok((transition, request))
    }

    /// `Searching → Matched`. On error the caller still owns the reservation.
    pub fn mark_matched(&self, ride_id: RideId, driver_id: &DriverId, now: DateTime<Utc>) -> Result<Transition> {
        self.transition(ride_id, |slot| {
            slot.ride.mark_matched(driver_id.clone(), now)?;
            slot.search = None;
            self.active_by_driver.insert(driver_id.clone(), ride_id);
            self.rides_by_driver
                .entry(driver_id.clone())
                .or_default()
                .push(ride_id);
            Ok((
                RideEvent::Matched {
                    ride_id,
                    driver_id: driver_id.clone(),
                    at: now,
                },
                None,
            ))
        })
    }

    pub fn accept(&self, ride_id: RideId, driver_id: &DriverId, now: DateTime<Utc>) -> Result<Transition> {
        self.transition(ride_id, |slot| {
            slot.ride.accept(driver_id, now)?;
            Ok((
                RideEvent::Accepted {
                    ride_id,
                    driver_id: driver_id.clone(),
                    at: now,
                },
                None,
            ))
        })
    }

    /// `Matched → Searching` without this driver. Returns the request for the
    /// fresh search, which runs under `search`.
    pub fn decline(
        &self,
        ride_id: RideId,
        driver_id: &DriverId,
        search: CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<(Transition, SearchRequest)> {
        let transition = self.transition(ride_id, |slot| {
            let released = slot.ride.decline(driver_id, now)?;
            slot.search = Some(search);
            Ok((
                RideEvent::Declined {
                    ride_id,
                    driver_id: released.clone(),
                    at: now,
                },
                Some(released),
            ))
        })?;
        self.clear_indexes(&transition.ride, transition.released.as_ref());
        let request = search_request(&transition.ride);
        Ok((transition, request))
    }

    pub fn start(&self, ride_id: RideId, now: DateTime<Utc>) -> Result<Transition> {
        self.transition(ride_id, |slot| {
            slot.ride.start(now)?;
            let driver_id = slot
                .ride
                .driver_id
                .clone()
                .ok_or_else(|| DispatchError::invalid_input("accepted ride has no driver"))?;
            Ok((RideEvent::Started { ride_id, driver_id, at: now }, None))
        })
    }

    pub fn complete(&self, ride_id: RideId, final_fare: Option<f64>, now: DateTime<Utc>) -> Result<Transition> {
        let transition = self.transition(ride_id, |slot| {
            let driver_id = slot
                .ride
                .complete(final_fare, now)?
                .ok_or_else(|| DispatchError::invalid_input("completed ride has no driver"))?;
            let fare = slot.ride.final_fare.unwrap_or(slot.ride.quoted_fare.total);
            Ok((
                RideEvent::Completed {
                    ride_id,
                    driver_id: driver_id.clone(),
                    final_fare: fare,
                    at: now,
                },
                Some(driver_id),
            ))
        })?;
        self.clear_indexes(&transition.ride, transition.released.as_ref());
        Ok(transition)
    }

    /// Cancel the ride and abort its search. The assigned driver, if any, is
    /// returned for release.
    pub fn cancel(&self, ride_id: RideId, reason: CancellationReason, now: DateTime<Utc>) -> Result<Transition> {
        let transition = self.transition(ride_id, |slot| {
            let released = slot.ride.cancel(reason.clone(), now)?;
            if let Some(search) = slot.search.take() {
                search.cancel();
            }
            Ok((
                RideEvent::Cancelled {
                    ride_id,
                    reason,
                    driver_id: released.clone(),
                    at: now,
                },
                released,
            ))
        })?;
        self.clear_indexes(&transition.ride, transition.released.as_ref());
        Ok(transition)
    }

    /// Follow the ride's status. The receiver sees the latest status after
    /// every transition.
    pub fn watch(&self, ride_id: RideId) -> Result<watch::Receiver<RideStatus>> {
        let slot = self.slot(ride_id)?;
        let receiver = lock(&slot).status.subscribe();
        Ok(receiver)
    }

    /// Every ride the rider has requested, oldest first.
    pub fn rides_for_rider(&self, rider_id: &RiderId) -> Vec<Ride> {
        self.rides_of(Self::indexed(&self.rides_by_rider, rider_id))
    }

    /// Rides the driver was matched to and did not decline, oldest first.
    pub fn rides_for_driver(&self, driver_id: &DriverId) -> Vec<Ride> {
        let mut rides = self.rides_of(Self::indexed(&self.rides_by_driver, driver_id));
        rides.retain(|ride| !ride.declined_by.contains(driver_id));
        rides
    }

    pub fn get(&self, ride_id: RideId) -> Option<Ride> {
        let slot = self.slot(ride_id).ok()?;
        let ride = lock(&slot).ride.clone();
        Some(ride)
    }

    pub fn active_ride_for_rider(&self, rider_id: &RiderId) -> Option<RideId> {
        let ride_id = *self.active_by_rider.get(rider_id)?;
        self.is_active(ride_id).then_some(ride_id)
    }

    /// The non-terminal ride the driver is attached to.
    pub fn active_ride_for_driver(&self, driver_id: &DriverId) -> Option<RideId> {
        let ride_id = *self.active_by_driver.get(driver_id)?;
        self.is_active(ride_id).then_some(ride_id)
    }

    /// Rides still waiting for a driver.
    pub fn unmatched_ids(&self) -> Vec<RideId> {
        self.all_slots()
            .iter()
            .filter_map(|slot| {
                let guard = lock(slot);
                matches!(guard.ride.status, RideStatus::Requested | RideStatus::Searching)
                    .then_some(guard.ride.id)
            })
            .collect()
    }

    pub fn earnings(&self, driver_id: &DriverId, since: DateTime<Utc>) -> EarningsSummary {
        let mut summary = EarningsSummary::default();
        for ride in self.rides_for_driver(driver_id) {
            if ride.status != RideStatus::Completed || ride.driver_id.as_ref() != Some(driver_id) {
                continue;
            }
            let fare = ride.final_fare.unwrap_or(ride.quoted_fare.total);
            summary.completed_rides += 1;
            summary.total_fares += fare;
            if ride.timeline.completed_at.is_some_and(|at| at >= since) {
                summary.fares_since += fare;
            }
        }
        if summary.completed_rides > 0 {
            summary.average_fare = summary.total_fares / summary.completed_rides as f64;
        }
        summary
    }

    fn count_in_window(
        &self,
        zone_id: ZoneId,
        statuses: &[RideStatus],
        window: Duration,
        now: DateTime<Utc>,
    ) -> u64 {
        let from = now - window;
        Self::indexed(&self.rides_by_zone, &zone_id)
            .into_iter()
            .filter_map(|ride_id| self.slot(ride_id).ok())
            .filter(|slot| {
                let guard = lock(slot);
                let ride = &guard.ride;
                statuses.contains(&ride.status)
                    && ride
                        .timeline
                        .created_at
                        .is_some_and(|created| created >= from && created <= now)
            })
            .count() as u64
    }
}

#[async_trait]
impl RideCountInWindow for RideBook {
    async fn ride_count(
        &self,
        zone_id: ZoneId,
        statuses: &[RideStatus],
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        Ok(self.count_in_window(zone_id, statuses, window, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{LocalNotifier, Topic};
    use crate::pricing::VehicleType;
    use crate::test_helpers::{sample_quote, CITY_CENTER};
    use chrono::TimeZone;

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn draft(rider: &str, zone: Option<ZoneId>) -> RideDraft {
        RideDraft {
            rider_id: RiderId::from(rider),
            pickup: CITY_CENTER,
            drop: CITY_CENTER,
            pickup_zone_id: zone,
            drop_zone_id: zone,
            vehicle_type: VehicleType::Standard,
            quote: sample_quote(220.0),
        }
    }

    fn book() -> (RideBook, Arc<LocalNotifier>) {
        let notifier = Arc::new(LocalNotifier::new(64));
        (RideBook::new(EventBroadcaster::new(notifier.clone())), notifier)
    }

    fn matched(book: &RideBook, rider: &str, driver: &DriverId) -> RideId {
        let ride_id = book.open(draft(rider, Some(ZoneId(1))), t(0)).unwrap().ride.id;
        book.begin_search(ride_id, CancellationToken::new(), t(0)).unwrap();
        book.mark_matched(ride_id, driver, t(1)).unwrap();
        ride_id
    }

    #[test]
    fn rider_may_hold_one_active_ride() {
        let (book, _) = book();
        let first = book.open(draft("r1", None), t(0)).unwrap().ride.id;
        assert!(matches!(
            book.open(draft("r1", None), t(0)),
            Err(DispatchError::ActiveRideExists { ride_id, .. }) if ride_id == first
        ));
        book.cancel(first, CancellationReason::RiderCancelled, t(1)).unwrap();
        assert!(book.open(draft("r1", None), t(2)).is_ok());
    }

    #[test]
    fn cancel_fires_the_search_token_and_returns_driver() {
        let (book, _) = book();
        let ride_id = book.open(draft("r1", None), t(0)).unwrap().ride.id;
        let token = CancellationToken::new();
        book.begin_search(ride_id, token.clone(), t(0)).unwrap();
        let transition = book.cancel(ride_id, CancellationReason::RiderCancelled, t(1)).unwrap();
        assert!(token.is_cancelled());
        assert!(transition.released.is_none());

        let driver = DriverId::from("d1");
        let ride_id = matched(&book, "r2", &driver);
        assert_eq!(book.active_ride_for_driver(&driver), Some(ride_id));
        let transition = book.cancel(ride_id, CancellationReason::DriverCancelled, t(2)).unwrap();
        assert_eq!(transition.released, Some(driver.clone()));
        assert_eq!(book.active_ride_for_driver(&driver), None);
    }

    #[test]
    fn events_follow_transition_order() {
        let (book, notifier) = book();
        let mut drivers = notifier.subscribe(Topic::NewRequests);
        let ride_id = book.open(draft("r1", None), t(0)).unwrap().ride.id;
        let mut ride_topic = notifier.subscribe(Topic::Ride(ride_id));
        let driver = DriverId::from("d1");

        let (_, request) = book.begin_search(ride_id, CancellationToken::new(), t(0)).unwrap();
        assert_eq!(request.ride_id, ride_id);
        book.mark_matched(ride_id, &driver, t(1)).unwrap();
        let (_, retry) = book.decline(ride_id, &driver, CancellationToken::new(), t(2)).unwrap();
        assert_eq!(retry.excluded, vec![driver.clone()]);

        let names: Vec<String> = std::iter::from_fn(|| ride_topic.try_recv())
            .map(|e| e.payload["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["search-started", "matched", "declined"]);
        let offered: Vec<String> = std::iter::from_fn(|| drivers.try_recv())
            .map(|e| e.payload["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(offered, vec!["search-started", "declined"]);
    }

    #[test]
    fn earnings_sum_completed_rides_only() {
        let (book, _) = book();
        let driver = DriverId::from("d1");
        for (rider, fare, minute) in [("r1", Some(100.0), 5), ("r2", None, 50)] {
            let ride_id = matched(&book, rider, &driver);
            book.accept(ride_id, &driver, t(2)).unwrap();
            book.start(ride_id, t(3)).unwrap();
            book.complete(ride_id, fare, t(minute)).unwrap();
        }
        let cancelled = matched(&book, "r3", &driver);
        book.cancel(cancelled, CancellationReason::RiderCancelled, t(4)).unwrap();

        let summary = book.earnings(&driver, t(30));
        assert_eq!(summary.completed_rides, 2);
        assert_eq!(summary.total_fares, 100.0 + 231.0);
        assert_eq!(summary.fares_since, 231.0);
        assert_eq!(summary.average_fare, 165.5);
        assert_eq!(book.earnings(&DriverId::from("nobody"), t(0)), EarningsSummary::default());
    }

    #[test]
    fn histories_are_ordered_by_request_time() {
        let (book, _) = book();
        let d1 = DriverId::from("d1");
        let d2 = DriverId::from("d2");

        let first = book.open(draft("r1", None), t(0)).unwrap().ride.id;
        book.begin_search(first, CancellationToken::new(), t(0)).unwrap();
        book.mark_matched(first, &d1, t(1)).unwrap();
        book.decline(first, &d1, CancellationToken::new(), t(2)).unwrap();
        book.mark_matched(first, &d2, t(3)).unwrap();
        book.cancel(first, CancellationReason::RiderCancelled, t(4)).unwrap();
        let second = book.open(draft("r1", None), t(5)).unwrap().ride.id;
        book.open(draft("r2", None), t(6)).unwrap();

        let rider_rides: Vec<RideId> = book
            .rides_for_rider(&RiderId::from("r1"))
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(rider_rides, vec![first, second]);
        assert!(book.rides_for_driver(&d1).is_empty());
        let d2_rides = book.rides_for_driver(&d2);
        assert_eq!(d2_rides.len(), 1);
        assert_eq!(d2_rides[0].status, RideStatus::Cancelled);
        assert!(book.rides_for_rider(&RiderId::from("nobody")).is_empty());
    }

    #[test]
    fn cancel_after_match_leaves_no_driver_entry() {
        let (book, _) = book();
        let driver = DriverId::from("d1");
        let ride_id = matched(&book, "r1", &driver);
        assert_eq!(book.active_by_driver.get(&driver).map(|e| *e.value()), Some(ride_id));
        book.cancel(ride_id, CancellationReason::RiderCancelled, t(2)).unwrap();
        assert!(book.active_by_driver.get(&driver).is_none());
    }

    #[tokio::test]
    async fn watchers_see_every_status_change() {
        let (book, _) = book();
        let ride_id = book.open(draft("r1", None), t(0)).unwrap().ride.id;
        let mut status = book.watch(ride_id).unwrap();
        assert_eq!(*status.borrow_and_update(), RideStatus::Requested);

        book.begin_search(ride_id, CancellationToken::new(), t(0)).unwrap();
        status.changed().await.unwrap();
        assert_eq!(*status.borrow_and_update(), RideStatus::Searching);
        book.cancel(ride_id, CancellationReason::NoDriverFound, t(1)).unwrap();
        status.changed().await.unwrap();
        assert_eq!(*status.borrow_and_update(), RideStatus::Cancelled);
        assert!(matches!(book.watch(RideId::new()), Err(DispatchError::RideNotFound(_))));
    }

    #[tokio::test]
    async fn counts_demand_in_zone_and_window() {
        let (book, _) = book();
        let d1 = DriverId::from("d1");
        let d2 = DriverId::from("d2");
        matched(&book, "r1", &d1);
        let accepted = matched(&book, "r2", &d2);
        book.accept(accepted, &d2, t(2)).unwrap();
        book.open(draft("r3", Some(ZoneId(1))), t(0)).unwrap();
        book.open(draft("r4", Some(ZoneId(2))), t(0)).unwrap();

        let statuses = [RideStatus::Matched, RideStatus::Accepted];
        let count = book
            .ride_count(ZoneId(1), &statuses, Duration::minutes(15), t(10))
            .await
            .unwrap();
        assert_eq!(count, 2);
        let stale = book
            .ride_count(ZoneId(1), &statuses, Duration::minutes(15), t(30))
            .await
            .unwrap();
        assert_eq!(stale, 0);
    }
}
