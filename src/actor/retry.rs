use std::time::Duration;

/// Backoff before retry number `retry_number` (starting at 1).
pub trait RetryPolicy: Send + Sync {
    fn backoff(&self, retry_number: u32) -> Duration;
}

/// `base * multiplier^(n-1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn backoff(&self, retry_number: u32) -> Duration {
        let exponent = retry_number.saturating_sub(1).min(i32::MAX as u32) as i32;
        let seconds = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        if !seconds.is_finite() || seconds >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(self.max)
    }
}

/// Same delay before every retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedBackoff(pub Duration);

impl RetryPolicy for FixedBackoff {
    fn backoff(&self, _retry_number: u32) -> Duration {
        self.0
    }
}
