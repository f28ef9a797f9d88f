use std::time::Duration;

use rand::Rng;

/// Exponential reconnect backoff.
///
/// The delay for attempt `n` is drawn from `[ceiling(n - 1), ceiling(n)]`, so
/// jitter never makes a later attempt wait less than an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            max: Duration::from_secs(25),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Upper bound of the delay after `failures` consecutive failures.
    pub fn ceiling(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(20);
        let base_ms = self.base.as_millis() as u64;
        let scaled = base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(scaled).min(self.max)
    }

    pub fn delay(&self, failures: u32) -> Duration {
        self.delay_with(failures, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let upper = self.ceiling(failures);
        let lower = self.ceiling(failures.saturating_sub(1));
        if upper <= lower {
            return upper;
        }
        let lower_ms = lower.as_millis() as u64;
        let upper_ms = upper.as_millis() as u64;
        Duration::from_millis(rng.gen_range(lower_ms..=upper_ms))
    }
}
