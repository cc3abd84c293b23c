//! Trickplay pacing
//!
//! While the player runs at anything other than normal speed the decoder
//! has no meaningful presentation clock, so access units are gated here
//! instead: a unit is admitted once enough wall time has passed, scaled
//! by the selected speed, to cover its media-time distance from the last
//! admitted unit.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::clock::MonotonicClock;
use crate::pts::{self, Pts};

/// Playback rate selector, slowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Speed {
    Pause,
    Slowest,
    Slower,
    Slow,
    Normal,
    Fast,
    Faster,
    Fastest,
}

impl Speed {
    pub const ALL: [Speed; 8] = [
        Speed::Pause,
        Speed::Slowest,
        Speed::Slower,
        Speed::Slow,
        Speed::Normal,
        Speed::Fast,
        Speed::Faster,
        Speed::Fastest,
    ];

    /// Maps a host trick-speed code onto a level.
    ///
    /// Forward slow motion uses 8/4/2, fast winding 6/3/1 (smaller is
    /// faster), slow reverse 63/48/24. Anything else plays at normal speed.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Speed::Pause,
            8 | 63 => Speed::Slowest,
            4 | 48 => Speed::Slower,
            2 | 24 => Speed::Slow,
            6 => Speed::Fast,
            3 => Speed::Faster,
            1 => Speed::Fastest,
            _ => Speed::Normal,
        }
    }

    /// Media ticks consumed per wall tick, as `(numerator, denominator)`.
    pub fn divisor(self) -> (i64, i64) {
        match self {
            Speed::Pause => (0, 1),
            Speed::Slowest => (1, 12),
            Speed::Slower => (1, 8),
            Speed::Slow => (1, 4),
            Speed::Normal => (1, 1),
            Speed::Fast => (4, 1),
            Speed::Faster => (8, 1),
            Speed::Fastest => (12, 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn from_forward(forward: bool) -> Self {
        if forward {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// Rate-controlled PTS gate.
pub struct TrickPlayScheduler<C: MonotonicClock> {
    clock: C,
    speed: Speed,
    direction: Direction,
    /// Last admitted timestamp and the wall time it was admitted at.
    reference: Option<(Pts, Duration)>,
}

impl<C: MonotonicClock> TrickPlayScheduler<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            speed: Speed::Normal,
            direction: Direction::Forward,
            reference: None,
        }
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn set_speed(&mut self, code: i32, forward: bool) {
        self.set_level(Speed::from_code(code), Direction::from_forward(forward));
    }

    /// Selects a level directly. Changing rate or direction restarts pacing
    /// from the next timestamped unit.
    pub fn set_level(&mut self, speed: Speed, direction: Direction) {
        if speed != self.speed || direction != self.direction {
            tracing::debug!("trick speed {:?} {:?}", speed, direction);
            self.reference = None;
        }
        self.speed = speed;
        self.direction = direction;
    }

    pub fn reset(&mut self) {
        self.reference = None;
        self.speed = Speed::Normal;
        self.direction = Direction::Forward;
    }

    /// Decides whether the unit stamped `pts` may go to the decoder now,
    /// and takes it as the new reference if so.
    pub fn check(&mut self, pts: Option<Pts>) -> bool {
        if !self.admits(pts) {
            return false;
        }
        self.admit(pts);
        true
    }

    /// The admission decision alone. Pair with [`admit`](Self::admit) once
    /// the unit has actually been handed to the decoder.
    pub fn admits(&self, pts: Option<Pts>) -> bool {
        let pts = match pts {
            Some(pts) if self.speed != Speed::Normal => pts,
            _ => return true,
        };
        let (ref_pts, ref_time) = match self.reference {
            Some(r) => r,
            None => return true,
        };

        let elapsed = pts::duration_to_ticks(self.clock.now().saturating_sub(ref_time));
        let required = match self.direction {
            Direction::Forward => pts::difference(ref_pts, pts),
            Direction::Backward => pts::difference(pts, ref_pts),
        };

        let (num, den) = self.speed.divisor();
        let admitted = elapsed.saturating_mul(num) > required.saturating_mul(den);
        if !admitted {
            tracing::trace!(
                "hold {} (elapsed {} ticks, need {} at {:?})",
                pts,
                elapsed,
                required,
                self.speed
            );
        }
        admitted
    }

    /// Makes `pts` the pacing reference, as of now.
    pub fn admit(&mut self, pts: Option<Pts>) {
        match pts {
            Some(pts) if self.speed != Speed::Normal => {
                self.reference = Some((pts, self.clock.now()));
            }
            _ => {}
        }
    }

    /// Timestamp of the last admitted unit, used as a stand-in clock
    /// while trick mode is active.
    pub fn get_pts(&self) -> Option<Pts> {
        self.reference.map(|(pts, _)| pts)
    }
}
