pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod geo;
pub mod lifecycle;
pub mod ports;
pub mod pricing;
pub mod registry;
pub mod service;
pub mod spatial;
pub mod surge;
pub mod telemetry;
pub mod zones;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use error::{DispatchError, Result};
pub use service::{RideReceipt, RideRequest, RideService};
