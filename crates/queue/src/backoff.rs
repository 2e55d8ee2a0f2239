use std::time::Duration;

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self { Self { base, max: max.max(base) } }

    /// Delay for the attempt following `failures` earlier failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).map(|d| d.min(self.max)).unwrap_or(self.max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self { Self::new(Duration::from_millis(5), Duration::from_secs(1000)) }
}
