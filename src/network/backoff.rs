use std::time::Duration;

use rand::Rng;

/// Exponential reconnect backoff with a cap and additive jitter.
///
/// Jitter stays below a quarter of the current delay, which keeps consecutive
/// delays non-decreasing while still spreading a fleet of reconnecting
/// clients apart.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Deterministic delay for a given attempt: the base delay doubled per
    /// attempt, clamped to the cap.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap)
    }

    /// Next delay, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_cap = (delay.as_millis() / 4) as u64;
        let jitter = if jitter_cap == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_cap))
        };

        (delay + jitter).min(self.cap)
    }

    /// Reset after a successful handshake.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
