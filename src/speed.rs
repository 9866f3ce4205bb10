//! Moving-average transfer speed, windowed over the last few seconds.

use crate::time::{Tint, TINT_SEC};

/// Default averaging window: 5 seconds.
pub const SPEED_INTERVAL: Tint = 5 * TINT_SEC;
/// Start-up fudge: pretend measurement started 1 s ago so the first
/// points do not read as an absurd burst.
pub const SPEED_FUDGE: Tint = TINT_SEC;

/// Speed estimate that decays when fed zero-sized points.
#[derive(Debug, Clone)]
pub struct MovingAverageSpeed {
    interval: Tint,
    t_start: Tint,
    t_end: Tint,
    speed: f64,
}

impl MovingAverageSpeed {
    pub fn new(now: Tint) -> Self {
        Self::with_interval(now, SPEED_INTERVAL, SPEED_FUDGE)
    }

    pub fn with_interval(now: Tint, interval: Tint, fudge: Tint) -> Self {
        MovingAverageSpeed {
            interval,
            t_start: now - fudge,
            t_end: now - fudge,
            speed: 0.0,
        }
    }

    /// Record `amount` bytes observed at `now`.
    pub fn add_point(&mut self, now: Tint, amount: u64) {
        let held = (self.t_end - self.t_start) as f64 / TINT_SEC as f64;
        let span = (now - self.t_start) as f64 / TINT_SEC as f64 + 0.0001;
        self.speed = (self.speed * held + amount as f64) / span;
        self.t_end = now;
        if self.t_start < now - self.interval {
            self.t_start = now - self.interval;
        }
    }

    /// Current estimate in bytes/s, decayed up to `now`.
    pub fn speed(&mut self, now: Tint) -> f64 {
        self.add_point(now, 0);
        self.speed
    }

    /// Current estimate without touching the window.
    pub fn speed_neutral(&self) -> f64 {
        self.speed
    }
}
