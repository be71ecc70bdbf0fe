//! Bounded exponential backoff.

use std::time::Duration;

/// Retry delay policy: `base * 2^(attempt - 1)`, clamped to a maximum,
/// with optional full jitter.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
    /// Randomize the delay to `[delay/2, delay]` to avoid thundering herds.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Compute the delay before retrying after the given attempt (1-based).
    ///
    /// Without jitter the result is monotonically non-decreasing in the
    /// attempt number. Attempt 0 is treated as attempt 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        // Cap the exponent so the shift cannot overflow before clamping.
        let exponent = (attempt - 1).min(31);
        let scaled = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay);
        let clamped = scaled.min(self.max_delay);

        if self.jitter {
            let half = clamped / 2;
            let spread = clamped.saturating_sub(half);
            half + spread.mul_f64(rand::random::<f64>())
        } else {
            clamped
        }
    }
}
