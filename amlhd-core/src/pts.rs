//! Presentation timestamps
//!
//! PTS values are 33-bit counters running at 90 kHz. They wrap roughly
//! every 26.5 hours, so any comparison between two of them has to go
//! through [`difference`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// PTS clock rate.
pub const PTS_FREQ: i64 = 90_000;

/// PTS ticks per millisecond of wall time.
pub const PTS_TICKS_PER_MS: i64 = PTS_FREQ / 1000;

/// Width of the timestamp field in a PES header.
pub const PTS_BITS: u32 = 33;

/// Timestamps are equal modulo this value.
pub const PTS_WRAP: i64 = 1 << PTS_BITS;

const PTS_MASK: i64 = PTS_WRAP - 1;
const PTS_HALF_WRAP: i64 = PTS_WRAP / 2;

/// A 90 kHz presentation timestamp.
///
/// "No timestamp" is expressed as `Option<Pts>::None` rather than a
/// magic value, so a `Pts` is always comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pts(i64);

impl Pts {
    /// Wraps `ticks` into the 33-bit timestamp space.
    pub const fn new(ticks: i64) -> Self {
        Self(ticks & PTS_MASK)
    }

    pub const fn ticks(self) -> i64 {
        self.0
    }

    pub fn from_millis(ms: i64) -> Self {
        Self::new(ms * PTS_TICKS_PER_MS)
    }

    pub fn as_millis(self) -> i64 {
        self.0 / PTS_TICKS_PER_MS
    }
}

impl fmt::Display for Pts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}ms)", self.0, self.as_millis())
    }
}

/// Forward-time ticks needed to go from `a` to `b`.
///
/// The raw difference is taken modulo [`PTS_WRAP`] and mapped into
/// `(-PTS_WRAP / 2, PTS_WRAP / 2]`, so a timestamp that has just wrapped
/// past zero reads as a small step forward instead of a jump back.
pub fn difference(a: Pts, b: Pts) -> i64 {
    let diff = (b.0 - a.0) & PTS_MASK;
    if diff > PTS_HALF_WRAP {
        diff - PTS_WRAP
    } else {
        diff
    }
}

/// Converts wall time to PTS ticks.
pub fn duration_to_ticks(d: Duration) -> i64 {
    (d.as_micros() as i64).saturating_mul(PTS_TICKS_PER_MS) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difference_same_is_zero() {
        for t in [0, 1, 90_000, PTS_WRAP - 1] {
            assert_eq!(difference(Pts::new(t), Pts::new(t)), 0);
        }
    }

    #[test]
    fn test_difference_antisymmetric() {
        let pairs = [
            (0, 90_000),
            (1_000, 500),
            (PTS_WRAP - 100, 50),
            (12_345_678, 8_000_000_000),
        ];
        for (a, b) in pairs {
            let (a, b) = (Pts::new(a), Pts::new(b));
            assert_eq!(difference(a, b), -difference(b, a));
        }
    }

    #[test]
    fn test_difference_across_wrap() {
        // 100 ticks before the wrap to 50 ticks after it
        let before = Pts::new(PTS_WRAP - 100);
        let after = Pts::new(50);
        assert_eq!(difference(before, after), 150);
        assert_eq!(difference(after, before), -150);
    }

    #[test]
    fn test_new_wraps_into_33_bits() {
        assert_eq!(Pts::new(PTS_WRAP + 5).ticks(), 5);
        assert_eq!(Pts::new(-1).ticks(), PTS_WRAP - 1);
    }

    #[test]
    fn test_duration_to_ticks() {
        assert_eq!(duration_to_ticks(Duration::from_millis(1)), 90);
        assert_eq!(duration_to_ticks(Duration::from_secs(1)), PTS_FREQ);
        assert_eq!(duration_to_ticks(Duration::from_micros(500)), 45);
    }
}
