#![allow(dead_code)]

use std::time::Duration;

use ride_core::events::Subscription;
use ride_core::lifecycle::{Ride, RideId, RideStatus};
use ride_core::pricing::VehicleType;
use ride_core::test_helpers::{point_near, CITY_CENTER};
use ride_core::{RideRequest, RideService};

/// A standard ride from the city centre to `drop_north_km` north of it.
pub fn ride_request(rider: &str, drop_north_km: f64) -> RideRequest {
    RideRequest::new(
        rider,
        CITY_CENTER,
        point_near(CITY_CENTER, drop_north_km, 0.0),
        VehicleType::Standard,
    )
}

/// Poll until the ride reaches `status` or `within` elapses.
///
/// # Panics
///
/// Panics with the last observed ride when the status is not reached in time.
pub async fn wait_for_status(service: &RideService, ride_id: RideId, status: RideStatus, within: Duration) -> Ride {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let ride = service.ride(ride_id).expect("ride should exist");
        if ride.status == status {
            return ride;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("ride {ride_id} stuck in {:?}, wanted {status:?}", ride.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Every event type currently buffered on `subscription`, in order.
pub fn drain_event_types(subscription: &mut Subscription) -> Vec<String> {
    let mut types = Vec::new();
    while let Some(envelope) = subscription.try_recv() {
        types.push(
            envelope.payload["type"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        );
    }
    types
}
