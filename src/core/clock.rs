//! Round Clock
//!
//! Monotonic ticker driving the round scheduler. One tick per period
//! (one second in production); carries no round logic of its own.

use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Default tick period.
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Monotonic ticker.
pub struct Clock {
    interval: Interval,
    ticks: u64,
}

impl Clock {
    /// Create a clock whose first tick fires one period from now.
    pub fn new(period: Duration) -> Self {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval, ticks: 0 }
    }

    /// Create a one-second clock.
    pub fn every_second() -> Self {
        Self::new(TICK_PERIOD)
    }

    /// Wait for the next tick and return the running tick count.
    pub async fn tick(&mut self) -> u64 {
        self.interval.tick().await;
        self.ticks += 1;
        self.ticks
    }
}
