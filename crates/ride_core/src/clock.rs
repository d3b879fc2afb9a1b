use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Source of wall-clock time for ride timestamps and time-of-day pricing.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used for deterministic tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Half-open window `[start_hour, end_hour)` on a 24h clock.
///
/// When `start_hour > end_hour` the window wraps midnight (22→6 covers 22:00–05:59).
/// Equal bounds describe an empty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl HourWindow {
    pub const fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour,
            end_hour,
        }
    }

    pub fn wraps_midnight(&self) -> bool {
        self.start_hour > self.end_hour
    }

    pub fn contains(&self, hour: u32) -> bool {
        if self.wraps_midnight() {
            hour >= self.start_hour || hour < self.end_hour
        } else {
            hour >= self.start_hour && hour < self.end_hour
        }
    }
}

/// Hour of day at a fixed UTC offset. Offsets outside ±24h fall back to UTC.
pub fn local_hour(now: DateTime<Utc>, utc_offset_minutes: i32) -> u32 {
    match FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60)) {
        Some(offset) => now.with_timezone(&offset).hour(),
        None => now.hour(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn wrapping_window_covers_both_sides_of_midnight() {
        let night = HourWindow::new(22, 6);
        assert!(night.wraps_midnight());
        assert!(night.contains(23));
        assert!(night.contains(0));
        assert!(night.contains(5));
        assert!(!night.contains(6));
        assert!(!night.contains(10));
        assert!(night.contains(22));
    }

    #[test]
    fn plain_window_is_half_open() {
        let rush = HourWindow::new(17, 20);
        assert!(!rush.wraps_midnight());
        assert!(rush.contains(17));
        assert!(rush.contains(19));
        assert!(!rush.contains(20));
        assert!(!rush.contains(3));
        assert!(!HourWindow::new(8, 8).contains(8));
    }

    #[test]
    fn local_hour_applies_offset() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 20, 30, 0).unwrap();
        assert_eq!(local_hour(now, 0), 20);
        // +05:30
        assert_eq!(local_hour(now, 330), 2);
        assert_eq!(local_hour(now, -120), 18);
    }

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let start = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start + Duration::minutes(5));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
