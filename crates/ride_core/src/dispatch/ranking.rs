use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::registry::DriverId;

/// A driver that passed the availability filters for one ride.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub driver_id: DriverId,
    pub distance_km: f64,
    pub rating: f64,
    pub last_update: Option<DateTime<Utc>>,
}

/// Orders candidates for a reservation attempt; the first is tried first.
pub trait CandidateRanking: Send + Sync {
    fn rank(&self, candidates: &mut [Candidate]);
}

/// Nearest first; ties go to the higher rating, then the driver whose
/// position was reported earliest, then the lower driver id.
#[derive(Debug, Default, Clone, Copy)]
pub struct NearestFirst;

pub fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    a.distance_km
        .total_cmp(&b.distance_km)
        .then_with(|| b.rating.total_cmp(&a.rating))
        .then_with(|| match (a.last_update, b.last_update) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.driver_id.cmp(&b.driver_id))
}

impl CandidateRanking for NearestFirst {
    fn rank(&self, candidates: &mut [Candidate]) {
        candidates.sort_by(compare_candidates);
    }
}
