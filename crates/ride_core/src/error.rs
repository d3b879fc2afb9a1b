//! Error taxonomy for the dispatch core.
//!
//! Lifecycle contract violations (`InvalidTransition`, `NotAssignedDriver`,
//! `AlreadyTerminal`, `CannotCancelTerminal`) are rejected immediately and never
//! retried. `NoDriverAvailable` is transient and only seen inside the search loop;
//! callers observe `NoDriverFound` once the search budget is spent.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::{RideId, RideStatus, RiderId};
use crate::registry::DriverId;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("ride {0} not found")]
    RideNotFound(RideId),

    #[error("driver {0} not found")]
    DriverNotFound(DriverId),

    #[error("rider {rider_id} already has an active ride {ride_id}")]
    ActiveRideExists { rider_id: RiderId, ride_id: RideId },

    #[error("ride {ride_id}: cannot {action} while {from}")]
    InvalidTransition {
        ride_id: RideId,
        from: RideStatus,
        action: &'static str,
    },

    #[error("ride {ride_id} is not assigned to driver {driver_id}")]
    NotAssignedDriver { ride_id: RideId, driver_id: DriverId },

    #[error("ride {ride_id} is already {status}")]
    AlreadyTerminal { ride_id: RideId, status: RideStatus },

    #[error("ride {ride_id} cannot be cancelled once {status}")]
    CannotCancelTerminal { ride_id: RideId, status: RideStatus },

    #[error("no driver available")]
    NoDriverAvailable,

    #[error("no driver found for ride {0} within the search budget")]
    NoDriverFound(RideId),

    #[error("{component} failed: {message}")]
    Upstream {
        component: &'static str,
        message: String,
    },

    #[error("{component} timed out")]
    Timeout { component: &'static str },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl DispatchError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        DispatchError::InvalidInput {
            message: message.into(),
        }
    }

    pub fn upstream(component: &'static str, cause: impl std::fmt::Display) -> Self {
        DispatchError::Upstream {
            component,
            message: cause.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        DispatchError::Config {
            message: message.into(),
        }
    }

    /// True for failures that may succeed if the same call is repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::NoDriverAvailable
                | DispatchError::Upstream { .. }
                | DispatchError::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Await an external lookup for at most `limit`; overruns become
/// [`DispatchError::Timeout`] for `component`.
pub async fn bounded<T>(
    component: &'static str,
    limit: Duration,
    lookup: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, lookup)
        .await
        .unwrap_or_else(|_| Err(DispatchError::Timeout { component }))
}
