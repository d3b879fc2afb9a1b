use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::geo::GeoPoint;
use crate::pricing::{FareQuote, VehicleType};
use crate::registry::DriverId;
use crate::zones::ZoneId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RideId(Uuid);

impl RideId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RideId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RideId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RideId {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DispatchError::invalid_input(format!("bad ride id '{s}': {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RiderId(String);

impl RiderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RiderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RiderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RideStatus {
    Requested,
    Searching,
    Matched,
    Accepted,
    InProgress,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    pub fn can_cancel(self) -> bool {
        matches!(
            self,
            RideStatus::Requested | RideStatus::Searching | RideStatus::Matched | RideStatus::Accepted
        )
    }

    /// Statuses in which a driver is attached to the ride.
    pub fn has_driver(self) -> bool {
        matches!(
            self,
            RideStatus::Matched | RideStatus::Accepted | RideStatus::InProgress | RideStatus::Completed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RideStatus::Requested => "requested",
            RideStatus::Searching => "searching",
            RideStatus::Matched => "matched",
            RideStatus::Accepted => "accepted",
            RideStatus::InProgress => "in-progress",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }

    /// Status line suitable for showing to a rider.
    pub fn describe(self) -> &'static str {
        match self {
            RideStatus::Requested => "Ride requested",
            RideStatus::Searching => "Looking for a driver nearby",
            RideStatus::Matched => "Driver found, waiting for confirmation",
            RideStatus::Accepted => "Driver is on the way",
            RideStatus::InProgress => "Ride in progress",
            RideStatus::Completed => "Ride completed",
            RideStatus::Cancelled => "Ride cancelled",
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancellationReason {
    RiderCancelled,
    DriverCancelled,
    NoDriverFound,
    SystemShutdown,
    Other(String),
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancellationReason::RiderCancelled => f.write_str("rider cancelled"),
            CancellationReason::DriverCancelled => f.write_str("driver cancelled"),
            CancellationReason::NoDriverFound => f.write_str("no driver found"),
            CancellationReason::SystemShutdown => f.write_str("system shutdown"),
            CancellationReason::Other(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RideTimeline {
    pub created_at: Option<DateTime<Utc>>,
    pub search_started_at: Option<DateTime<Utc>>,
    /// Latest return to searching after a driver declined.
    pub rematch_started_at: Option<DateTime<Utc>>,
    pub matched_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl RideTimeline {
    /// Set timestamps in the order they can occur.
    pub fn ordered(&self) -> Vec<DateTime<Utc>> {
        [
            self.created_at,
            self.search_started_at,
            self.rematch_started_at,
            self.matched_at,
            self.accepted_at,
            self.started_at,
            self.completed_at.or(self.cancelled_at),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Everything needed to open a ride, already validated and priced.
#[derive(Debug, Clone)]
pub struct RideDraft {
    pub rider_id: RiderId,
    pub pickup: GeoPoint,
    pub drop: GeoPoint,
    pub pickup_zone_id: Option<ZoneId>,
    pub drop_zone_id: Option<ZoneId>,
    pub vehicle_type: VehicleType,
    pub quote: FareQuote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub id: RideId,
    pub rider_id: RiderId,
    pub status: RideStatus,
    pub pickup: GeoPoint,
    pub drop: GeoPoint,
    pub pickup_zone_id: Option<ZoneId>,
    pub drop_zone_id: Option<ZoneId>,
    pub vehicle_type: VehicleType,
    pub quoted_fare: FareQuote,
    pub final_fare: Option<f64>,
    pub driver_id: Option<DriverId>,
    pub timeline: RideTimeline,
    pub cancellation_reason: Option<CancellationReason>,
    pub declined_by: Vec<DriverId>,
}

impl Ride {
    pub fn new(draft: RideDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: RideId::new(),
            rider_id: draft.rider_id,
            status: RideStatus::Requested,
            pickup: draft.pickup,
            drop: draft.drop,
            pickup_zone_id: draft.pickup_zone_id,
            drop_zone_id: draft.drop_zone_id,
            vehicle_type: draft.vehicle_type,
            quoted_fare: draft.quote,
            final_fare: None,
            driver_id: None,
            timeline: RideTimeline {
                created_at: Some(now),
                ..RideTimeline::default()
            },
            cancellation_reason: None,
            declined_by: Vec::new(),
        }
    }

    fn invalid(&self, action: &'static str) -> DispatchError {
        DispatchError::InvalidTransition {
            ride_id: self.id,
            from: self.status,
            action,
        }
    }

    fn expect_status(&self, wanted: RideStatus, action: &'static str) -> Result<()> {
        if self.status == wanted {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    fn expect_driver(&self, driver_id: &DriverId) -> Result<()> {
        if self.driver_id.as_ref() == Some(driver_id) {
            Ok(())
        } else {
            Err(DispatchError::NotAssignedDriver {
                ride_id: self.id,
                driver_id: driver_id.clone(),
            })
        }
    }

    pub fn begin_search(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(RideStatus::Requested, "begin search")?;
        self.status = RideStatus::Searching;
        self.timeline.search_started_at = Some(now);
        Ok(())
    }

    pub fn mark_matched(&mut self, driver_id: DriverId, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(DispatchError::AlreadyTerminal {
                ride_id: self.id,
                status: self.status,
            });
        }
        self.expect_status(RideStatus::Searching, "match")?;
        self.status = RideStatus::Matched;
        self.driver_id = Some(driver_id);
        self.timeline.matched_at = Some(now);
        Ok(())
    }

    pub fn accept(&mut self, driver_id: &DriverId, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(RideStatus::Matched, "accept")?;
        self.expect_driver(driver_id)?;
        self.status = RideStatus::Accepted;
        self.timeline.accepted_at = Some(now);
        Ok(())
    }

    /// Send the ride back to searching without this driver. Returns the
    /// driver whose reservation must be released.
    pub fn decline(&mut self, driver_id: &DriverId, now: DateTime<Utc>) -> Result<DriverId> {
        self.expect_status(RideStatus::Matched, "decline")?;
        self.expect_driver(driver_id)?;
        let released = self.driver_id.take().unwrap_or_else(|| driver_id.clone());
        if !self.declined_by.contains(&released) {
            self.declined_by.push(released.clone());
        }
        self.status = RideStatus::Searching;
        self.timeline.matched_at = None;
        self.timeline.rematch_started_at = Some(now);
        Ok(released)
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(RideStatus::Accepted, "start")?;
        self.status = RideStatus::InProgress;
        self.timeline.started_at = Some(now);
        Ok(())
    }

    /// Finish the trip. Returns the driver to release.
    pub fn complete(&mut self, final_fare: Option<f64>, now: DateTime<Utc>) -> Result<Option<DriverId>> {
        self.expect_status(RideStatus::InProgress, "complete")?;
        if let Some(fare) = final_fare {
            if !fare.is_finite() || fare < 0.0 {
                return Err(DispatchError::invalid_input(format!(
                    "final fare must be a non-negative number, got {fare}"
                )));
            }
        }
        self.status = RideStatus::Completed;
        self.final_fare = Some(final_fare.unwrap_or(self.quoted_fare.total));
        self.timeline.completed_at = Some(now);
        Ok(self.driver_id.clone())
    }

    /// Cancel the ride. Returns the driver whose reservation must be released.
    pub fn cancel(&mut self, reason: CancellationReason, now: DateTime<Utc>) -> Result<Option<DriverId>> {
        if !self.status.can_cancel() {
            return Err(DispatchError::CannotCancelTerminal {
                ride_id: self.id,
                status: self.status,
            });
        }
        self.status = RideStatus::Cancelled;
        self.cancellation_reason = Some(reason);
        self.timeline.cancelled_at = Some(now);
        Ok(self.driver_id.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{sample_quote, CITY_CENTER};
    use chrono::{Duration, TimeZone};

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn ride() -> Ride {
        Ride::new(
            RideDraft {
                rider_id: RiderId::from("r1"),
                pickup: CITY_CENTER,
                drop: CITY_CENTER,
                pickup_zone_id: None,
                drop_zone_id: None,
                vehicle_type: VehicleType::Standard,
                quote: sample_quote(220.0),
            },
            t(0),
        )
    }

    #[test]
    fn happy_path_sets_timestamps_in_order() {
        let driver = DriverId::from("d1");
        let mut ride = ride();
        ride.begin_search(t(1)).unwrap();
        ride.mark_matched(driver.clone(), t(2)).unwrap();
        ride.accept(&driver, t(3)).unwrap();
        ride.start(t(4)).unwrap();
        let released = ride.complete(None, t(5)).unwrap();

        assert_eq!(released, Some(driver));
        assert_eq!(ride.status, RideStatus::Completed);
        assert_eq!(ride.final_fare, Some(ride.quoted_fare.total));
        let stamps = ride.timeline.ordered();
        assert_eq!(stamps.len(), 6);
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
        assert!(ride.timeline.cancelled_at.is_none());
    }

    #[test]
    fn only_the_assigned_driver_may_accept_or_decline() {
        let mut ride = ride();
        ride.begin_search(t(1)).unwrap();
        ride.mark_matched(DriverId::from("d1"), t(2)).unwrap();
        assert!(matches!(
            ride.accept(&DriverId::from("d2"), t(3)),
            Err(DispatchError::NotAssignedDriver { .. })
        ));
        assert!(matches!(
            ride.decline(&DriverId::from("d2"), t(3)),
            Err(DispatchError::NotAssignedDriver { .. })
        ));
        assert_eq!(ride.status, RideStatus::Matched);
    }

    #[test]
    fn decline_returns_to_searching_and_remembers_driver() {
        let driver = DriverId::from("d1");
        let mut ride = ride();
        ride.begin_search(t(1)).unwrap();
        ride.mark_matched(driver.clone(), t(2)).unwrap();
        assert_eq!(ride.decline(&driver, t(3)).unwrap(), driver);
        assert_eq!(ride.status, RideStatus::Searching);
        assert!(ride.driver_id.is_none());
        assert!(ride.timeline.matched_at.is_none());
        assert_eq!(ride.declined_by, vec![driver]);
    }

    #[test]
    fn decline_keeps_the_first_search_time() {
        let first = DriverId::from("d1");
        let second = DriverId::from("d2");
        let mut ride = ride();
        ride.begin_search(t(1)).unwrap();
        ride.mark_matched(first.clone(), t(2)).unwrap();
        ride.decline(&first, t(3)).unwrap();
        ride.mark_matched(second.clone(), t(4)).unwrap();
        ride.decline(&second, t(5)).unwrap();

        assert_eq!(ride.timeline.search_started_at, Some(t(1)));
        assert_eq!(ride.timeline.rematch_started_at, Some(t(5)));
        ride.mark_matched(DriverId::from("d3"), t(6)).unwrap();
        let stamps = ride.timeline.ordered();
        assert_eq!(stamps, vec![t(0), t(1), t(5), t(6)]);
    }

    #[test]
    fn match_after_cancel_is_already_terminal() {
        let mut ride = ride();
        ride.begin_search(t(1)).unwrap();
        ride.cancel(CancellationReason::RiderCancelled, t(2)).unwrap();
        assert!(matches!(
            ride.mark_matched(DriverId::from("d1"), t(3)),
            Err(DispatchError::AlreadyTerminal { status: RideStatus::Cancelled, .. })
        ));
        assert!(ride.driver_id.is_none());
    }

    #[test]
    fn cannot_cancel_once_in_progress() {
        let driver = DriverId::from("d1");
        let mut ride = ride();
        ride.begin_search(t(1)).unwrap();
        ride.mark_matched(driver.clone(), t(2)).unwrap();
        ride.accept(&driver, t(3)).unwrap();
        ride.start(t(4)).unwrap();
        assert!(matches!(
            ride.cancel(CancellationReason::RiderCancelled, t(5)),
            Err(DispatchError::CannotCancelTerminal { status: RideStatus::InProgress, .. })
        ));
    }

    #[test]
    fn cancel_from_accepted_hands_back_driver() {
        let driver = DriverId::from("d1");
        let mut ride = ride();
        ride.begin_search(t(1)).unwrap();
        ride.mark_matched(driver.clone(), t(2)).unwrap();
        ride.accept(&driver, t(3)).unwrap();
        let released = ride.cancel(CancellationReason::DriverCancelled, t(4)).unwrap();
        assert_eq!(released, Some(driver));
        assert!(ride.driver_id.is_none());
        assert!(ride.timeline.completed_at.is_none());
        assert_eq!(ride.cancellation_reason, Some(CancellationReason::DriverCancelled));
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let mut ride = ride();
        assert!(matches!(ride.start(t(1)), Err(DispatchError::InvalidTransition { .. })));
        assert!(matches!(
            ride.complete(None, t(1)),
            Err(DispatchError::InvalidTransition { .. })
        ));
        assert!(matches!(
            ride.mark_matched(DriverId::from("d1"), t(1)),
            Err(DispatchError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn negative_final_fare_is_rejected() {
        let driver = DriverId::from("d1");
        let mut ride = ride();
        ride.begin_search(t(1)).unwrap();
        ride.mark_matched(driver.clone(), t(2)).unwrap();
        ride.accept(&driver, t(3)).unwrap();
        ride.start(t(4)).unwrap();
        assert!(ride.complete(Some(-5.0), t(5)).is_err());
        assert!(ride.complete(Some(f64::INFINITY), t(5)).is_err());
        assert_eq!(ride.status, RideStatus::InProgress);
        ride.complete(Some(180.0), t(6)).unwrap();
        assert_eq!(ride.final_fare, Some(180.0));
    }

    #[test]
    fn status_strings() {
        assert_eq!(RideStatus::InProgress.to_string(), "in-progress");
        assert_eq!(
            serde_json::to_string(&RideStatus::InProgress).unwrap(),
            "\"in-progress\""
        );
        assert!(RideStatus::Cancelled.is_terminal());
        assert!(!RideStatus::InProgress.can_cancel());
        assert_eq!(RideStatus::Searching.describe(), "Looking for a driver nearby");
    }
}
