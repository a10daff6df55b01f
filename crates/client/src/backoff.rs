//! Reconnect backoff policy
//!
//! Pure delay computation: grows ×1.5 per failed attempt, capped at the
//! ceiling, reset to the floor after every successful handshake. The
//! connection loop owns the single pending timer; this type only decides
//! how long it sleeps.

use std::time::Duration;

/// Default first-retry delay.
pub const DEFAULT_FLOOR: Duration = Duration::from_millis(1000);
/// Default maximum delay between attempts.
pub const DEFAULT_CEILING: Duration = Duration::from_millis(5000);

const GROWTH_FACTOR: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    floor: Duration,
    ceiling: Duration,
    next: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FLOOR, DEFAULT_CEILING)
    }
}

impl ReconnectPolicy {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling: ceiling.max(floor),
            next: floor,
        }
    }

    /// Delay to sleep before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.mul_f64(GROWTH_FACTOR).min(self.ceiling);
        delay
    }

    /// Called after a successful handshake.
    pub fn reset(&mut self) {
        self.next = self.floor;
    }
}
