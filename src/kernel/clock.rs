//! Monotonic timestamps with explicit second/nanosecond arithmetic.

use nix::time::{clock_gettime, ClockId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// Seconds + nanoseconds, used both for instants and for signed spans
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: i64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { sec: 0, nsec: 0 };

    pub fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Self {
            sec: nanos.div_euclid(NSEC_PER_SEC),
            nsec: nanos.rem_euclid(NSEC_PER_SEC),
        }
    }

    /// `self - start`, borrowing one second when the nanosecond part underflows
    pub fn diff(self, start: Timestamp) -> Timestamp {
        if self.nsec - start.nsec < 0 {
            Timestamp {
                sec: self.sec - start.sec - 1,
                nsec: self.nsec - start.nsec + NSEC_PER_SEC,
            }
        } else {
            Timestamp {
                sec: self.sec - start.sec,
                nsec: self.nsec - start.nsec,
            }
        }
    }

    pub fn as_nanos(self) -> i64 {
        self.sec * NSEC_PER_SEC + self.nsec
    }

    /// Non-negative spans as a `Duration`; negative spans clamp to zero
    pub fn to_duration(self) -> Duration {
        let nanos = self.as_nanos();
        if nanos <= 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}

impl std::ops::Add for Timestamp {
    type Output = Timestamp;

    /// Carries one second when the nanosecond part overflows
    fn add(self, other: Timestamp) -> Timestamp {
        let mut sec = self.sec + other.sec;
        let mut nsec = self.nsec + other.nsec;
        if nsec >= NSEC_PER_SEC {
            nsec -= NSEC_PER_SEC;
            sec += 1;
        }
        Timestamp { sec, nsec }
    }
}

/// Source of monotonic time for the engine
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// `CLOCK_MONOTONIC`
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => Timestamp::new(ts.tv_sec() as i64, ts.tv_nsec() as i64),
            Err(e) => {
                // CLOCK_MONOTONIC is mandatory on Linux; this only fires under seccomp denial
                log::error!("clock_gettime(CLOCK_MONOTONIC) failed: {}", e);
                Timestamp::ZERO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_without_borrow() {
        let d = Timestamp::new(5, 700).diff(Timestamp::new(3, 200));
        assert_eq!(d, Timestamp::new(2, 500));
    }

    #[test]
    fn test_diff_borrows_a_second() {
        let d = Timestamp::new(5, 100).diff(Timestamp::new(3, 900_000_000));
        assert_eq!(d, Timestamp::new(1, 100_000_100));
        assert_eq!(d.as_nanos(), 1_100_000_100);
    }

    #[test]
    fn test_add_carries_a_second() {
        let s = Timestamp::new(1, 600_000_000) + Timestamp::new(0, 500_000_000);
        assert_eq!(s, Timestamp::new(2, 100_000_000));
    }

    #[test]
    fn test_negative_span() {
        let d = Timestamp::new(1, 0).diff(Timestamp::new(2, 500));
        assert!(d.as_nanos() < 0);
        assert_eq!(d.to_duration(), Duration::ZERO);
    }

    #[test]
    fn test_from_nanos_roundtrip() {
        assert_eq!(Timestamp::from_nanos(2_000_000_123), Timestamp::new(2, 123));
        assert_eq!(Timestamp::from_nanos(-1), Timestamp::new(-1, 999_999_999));
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a.sec > 0 || a.nsec > 0);
    }
}
