//! Dispatch KPIs: process-wide counters for requests, matches and outcomes.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct DispatchStats {
    requested: AtomicU64,
    matched: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    no_driver_found: AtomicU64,
    /// Reservation attempts that lost the compare-and-set to another ride.
    reservation_conflicts: AtomicU64,
    search_attempts: AtomicU64,
    declined: AtomicU64,
}

/// Counter values at one instant. Individual fields are read independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requested: u64,
    pub matched: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub no_driver_found: u64,
    pub reservation_conflicts: u64,
    pub search_attempts: u64,
    pub declined: u64,
}

impl StatsSnapshot {
    /// Share of requests that reached a driver at least once.
    pub fn match_rate(&self) -> f64 {
        if self.requested == 0 {
            return 0.0;
        }
        self.matched.min(self.requested) as f64 / self.requested as f64
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_requested(&self) {
        bump(&self.requested);
    }

    pub fn record_matched(&self) {
        bump(&self.matched);
    }

    pub fn record_completed(&self) {
        bump(&self.completed);
    }

    pub fn record_cancelled(&self) {
        bump(&self.cancelled);
    }

    pub fn record_no_driver_found(&self) {
        bump(&self.no_driver_found);
    }

    pub fn record_reservation_conflict(&self) {
        bump(&self.reservation_conflicts);
    }

    pub fn record_search_attempt(&self) {
        bump(&self.search_attempts);
    }

    pub fn record_declined(&self) {
        bump(&self.declined);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requested: self.requested.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            no_driver_found: self.no_driver_found.load(Ordering::Relaxed),
            reservation_conflicts: self.reservation_conflicts.load(Ordering::Relaxed),
            search_attempts: self.search_attempts.load(Ordering::Relaxed),
            declined: self.declined.load(Ordering::Relaxed),
        }
    }
}
