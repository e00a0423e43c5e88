/// Durations and wall-clock time for the scheduler and timers.
///
/// The original packed durations into 30 bits plus a unit field to save
/// RAM; a plain microsecond count is the natural shape here and keeps the
/// arithmetic exact across the full timer range.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// A signed span of time in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Duration(i64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    pub const fn from_us(us: i64) -> Duration {
        Duration(us)
    }

    pub const fn from_ms(ms: i64) -> Duration {
        Duration(ms * 1000)
    }

    /// Seconds, the unit scripts use (`new Timer(0.1, ...)` is 100 ms).
    pub fn from_secs_f32(secs: f32) -> Duration {
        Duration((secs as f64 * 1_000_000.0) as i64)
    }

    pub fn us(self) -> i64 {
        self.0
    }

    pub fn ms(self) -> i64 {
        self.0 / 1000
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn to_std(self) -> std::time::Duration {
        std::time::Duration::from_micros(self.0.max(0) as u64)
    }
}

impl Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.abs() >= 1_000_000 {
            write!(f, "{}s", self.0 as f64 / 1_000_000.0)
        } else if self.0.abs() >= 1000 {
            write!(f, "{}ms", self.0 as f64 / 1000.0)
        } else {
            write!(f, "{}us", self.0)
        }
    }
}

/// A point in wall-clock time, microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Time(i64);

impl Time {
    pub fn now() -> Time {
        Time(chrono::Utc::now().timestamp_micros())
    }

    pub fn from_us(us: i64) -> Time {
        Time(us)
    }

    pub fn us(self) -> i64 {
        self.0
    }
}

impl Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs.us())
    }
}

impl AddAssign<Duration> for Time {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.us();
    }
}

impl Sub for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration::from_us(self.0 - rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_units() {
        assert_eq!(Duration::from_ms(50).us(), 50_000);
        assert_eq!(Duration::from_secs_f32(0.1).ms(), 100);
    }

    #[test]
    fn time_arithmetic() {
        let t = Time::from_us(1_000_000);
        let later = t + Duration::from_ms(250);
        assert_eq!(later - t, Duration::from_ms(250));
        assert!(later > t);
    }
}
