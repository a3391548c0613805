//! Integer-nanosecond time model.
//!
//! Logical time is an integer count of nanoseconds from a process-chosen
//! epoch. [`TimePoint`] and [`Duration`] are distinct types; arithmetic
//! between them is total except where it overflows `i64`, which is a fatal
//! programming error rather than a value to propagate (see
//! [`crate::error::precondition`]).

use std::ops::{Add, Sub};

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// A duration between two [`TimePoint`]s, in nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(i64);

/// An instant in logical simulation time, in nanoseconds since the
/// execution's epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimePoint(i64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    pub const fn from_nanos(nanos: i64) -> Self {
        Duration(nanos)
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    pub fn as_seconds_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_SEC
    }

    /// Converts a duration expressed in seconds to an integer-nanosecond
    /// [`Duration`], rounding to the nearest nanosecond.
    ///
    /// `reference` is the point in time (in seconds) the duration starts
    /// from; it participates in the rounding so that `to_time_point(t) +
    /// to_duration(dt, t) == to_time_point(t + dt)` holds exactly (see
    /// `TimePoint::from_seconds`'s docs and the crate's round-trip test).
    pub fn from_seconds(dt: f64, reference: f64) -> Self {
        let start = TimePoint::from_seconds(reference);
        let end = TimePoint::from_seconds(reference + dt);
        end - start
    }

    pub fn checked_mul(self, factor: i64) -> Option<Duration> {
        self.0.checked_mul(factor).map(Duration)
    }
}

impl TimePoint {
    pub const EPOCH: TimePoint = TimePoint(0);

    pub const fn from_nanos(nanos: i64) -> Self {
        TimePoint(nanos)
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    pub fn as_seconds_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_SEC
    }

    /// Converts a double-precision seconds value to an integer-nanosecond
    /// [`TimePoint`], rounding to the nearest nanosecond.
    pub fn from_seconds(t: f64) -> Self {
        TimePoint((t * NANOS_PER_SEC).round() as i64)
    }
}

impl Add<Duration> for TimePoint {
    type Output = TimePoint;

    fn add(self, rhs: Duration) -> TimePoint {
        TimePoint(
            self.0
                .checked_add(rhs.0)
                .unwrap_or_else(|| crate::error::precondition_fail("time_point + duration overflowed i64 nanoseconds")),
        )
    }
}

impl Sub<TimePoint> for TimePoint {
    type Output = Duration;

    fn sub(self, rhs: TimePoint) -> Duration {
        Duration(
            self.0
                .checked_sub(rhs.0)
                .unwrap_or_else(|| crate::error::precondition_fail("time_point - time_point overflowed i64 nanoseconds")),
        )
    }
}
