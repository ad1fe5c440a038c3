use std::fmt::{self, Display, Formatter};
use std::ops::Add;
use std::time::Duration;

const MICROS_PER_SEC: i64 = 1_000_000;

/// Microsecond-precision reading of the monotonic clock.
///
/// All expiry arithmetic inside the engine happens on this value type, so it
/// must never go backwards; wall-clock adjustments do not affect it.
#[derive(Copy, Clone, Default, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Current reading of `CLOCK_MONOTONIC`.
    pub fn now() -> Timestamp {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // cannot fail for a valid CLOCK_MONOTONIC request
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        Timestamp(ts.tv_sec as i64 * MICROS_PER_SEC + ts.tv_nsec as i64 / 1_000)
    }

    /// Microseconds since the (arbitrary) monotonic epoch.
    pub fn micros(self) -> i64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0).max(0) as u64)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs.as_micros() as i64)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / MICROS_PER_SEC, self.0 % MICROS_PER_SEC)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn monotonic_and_ordered() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a <= b);
        assert!(a + Duration::from_secs(1) > b || b.micros() - a.micros() >= MICROS_PER_SEC);
    }

    #[test]
    fn addition_by_seconds() {
        let a = Timestamp::now();
        let b = a + Duration::from_millis(1500);
        assert_eq!(b.micros() - a.micros(), 1_500_000);
        assert_eq!(b.saturating_duration_since(a), Duration::from_millis(1500));
        assert_eq!(a.saturating_duration_since(b), Duration::ZERO);
    }
}
