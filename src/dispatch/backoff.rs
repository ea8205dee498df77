//! Exponential backoff between failed delivery attempts.
//!
//! The wait starts at a floor, doubles after each consecutive failure up to a
//! ceiling, and drops back to the floor on the first success:
//!
//! ```text
//! failure → wait 10s   (next: 20s)
//! failure → wait 20s   (next: 40s)
//! success → reset      (next: 10s)
//! ```
//!
//! There is no attempt limit: a transport that never recovers is retried at
//! the ceiling interval for as long as the dispatcher runs.

use std::time::Duration;

/// Backoff state owned by one dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    /// Creates a backoff starting at `floor` and capped at `ceiling`.
    ///
    /// A `ceiling` below `floor` is raised to `floor`.
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Backoff {
            floor,
            ceiling: ceiling.max(floor),
            current: floor,
        }
    }

    /// The wait that the next sleep will use.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Records a failure and returns how long to wait before retrying.
    ///
    /// Returns the current wait, then doubles it (capped) for next time.
    pub fn on_failure(&mut self) -> Duration {
        let wait = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        wait
    }

    /// Records a success: the next wait is the floor again.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}
