//! Delay schedules shared by lock polling and remote-call retries.

use std::time::Duration;

use rand::Rng;

/// A delay schedule: `min(base * factor^attempt + jitter, max)`.
///
/// Lock polling uses a fixed schedule (factor 1, no jitter); remote retries use an
/// exponential one (factor 2) with random jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor: u32,
    jitter: Duration,
    attempt: u32,
}

impl Backoff {
    /// Always wait `interval`.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            base: interval,
            max: interval,
            factor: 1,
            jitter: Duration::ZERO,
            attempt: 0,
        }
    }

    /// Double the delay on every attempt, never exceeding `max`.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            factor: 2,
            jitter: Duration::ZERO,
            attempt: 0,
        }
    }

    /// Add a uniformly random extra delay in `[0, jitter]` to every step.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay for a 0-based attempt, without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.factor
            .checked_pow(attempt)
            .and_then(|multiplier| self.base.checked_mul(multiplier))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Delay for a 0-based attempt with jitter applied, still capped at `max`.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter.is_zero() {
            return delay;
        }
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        delay.saturating_add(extra).min(self.max)
    }

    /// Delay for the current step, then advance to the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.jittered(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Steps taken so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
