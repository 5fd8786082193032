use super::{Backoff, DEFAULT_RETRY_INTERVAL};
use std::time::Duration;

/// 固定间隔退避
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_INTERVAL)
    }
}

impl Backoff for FixedBackoff {
    fn delay(&self, _attempt: usize) -> Duration {
        self.delay
    }
}
