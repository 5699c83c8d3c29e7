//! Dual-clock timestamps.
//!
//! Measurement rows and session documents carry both a wall-clock time (for
//! humans and databases) and a monotonic offset (for pacing guarantees, which
//! must not jump when NTP adjusts the system clock). The monotonic half is an
//! offset in seconds from a [`MonotonicClock`] origin so it serializes as a
//! plain float.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// A wall-clock instant paired with a monotonic offset from the owning
/// clock's origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Wall-clock time (UTC).
    pub wall: DateTime<Utc>,
    /// Seconds since the owning clock's origin. Strictly non-decreasing
    /// across timestamps taken from the same clock.
    pub monotonic_s: f64,
}

/// Clock source handed to transports and sessions so every timestamp in one
/// run shares a single monotonic origin.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Seconds elapsed since this clock was created.
    pub fn elapsed_s(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Take a timestamp on both clocks.
    pub fn now(&self) -> Timestamp {
        Timestamp {
            wall: Utc::now(),
            monotonic_s: self.elapsed_s(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_offsets_do_not_go_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b.monotonic_s >= a.monotonic_s);
    }

    #[test]
    fn timestamp_round_trips_through_serde() {
        let clock = MonotonicClock::new();
        let ts = clock.now();
        let json = serde_json::to_string(&ts).unwrap();
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(ts.monotonic_s, back.monotonic_s);
        assert_eq!(ts.wall, back.wall);
    }
}
