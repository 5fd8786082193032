use super::Backoff;
use std::time::Duration;

/// 带上限的指数退避
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(10);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}
