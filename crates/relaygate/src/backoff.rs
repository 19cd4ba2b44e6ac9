//! Delay between gateway sessions.

use std::time::Duration;

pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Doubling delay, capped at [`BACKOFF_MAX`].
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    next: Duration,
}

impl RestartBackoff {
    pub fn new() -> Self {
        Self {
            next: BACKOFF_INITIAL,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = self.next.saturating_mul(2).min(BACKOFF_MAX);
        current
    }

    pub fn reset(&mut self) {
        self.next = BACKOFF_INITIAL;
    }
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self::new()
    }
}
