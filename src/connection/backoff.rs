//! Accept-loop backoff.

use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_millis(10);
const MAX_DELAY: Duration = Duration::from_secs(1);

/// Capped exponential backoff for consecutive accept failures
#[derive(Debug, Default)]
pub struct AcceptBackoff {
    failures: u32,
}

impl AcceptBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return how long to wait before accepting again
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.failures.min(16);
        self.failures = self.failures.saturating_add(1);
        BASE_DELAY.saturating_mul(1u32 << exponent).min(MAX_DELAY)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
