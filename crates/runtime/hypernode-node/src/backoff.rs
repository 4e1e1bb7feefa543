use std::time::Duration;

/// Failure counts beyond this no longer change the delay, so the counter stops here.
pub const MAX_TRACKED_FAILURES: u32 = 32;

/// Bounded exponential backoff: `initial × 2^(failures-1)`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = (self.failures + 1).min(MAX_TRACKED_FAILURES);
        self.current()
    }

    /// Delay implied by the current failure count, without recording anything.
    pub fn current(&self) -> Duration {
        if self.failures == 0 {
            return Duration::ZERO;
        }
        let shift = (self.failures - 1).min(20);
        self.initial
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
