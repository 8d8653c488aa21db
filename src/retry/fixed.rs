use super::RetryPolicy;
use std::time::Duration;

/// 固定延迟重试策略
#[derive(Debug, Clone)]
pub struct FixedRetryPolicy {
    max_attempts: usize,
    delay: Duration,
}

impl FixedRetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl Default for FixedRetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}

impl RetryPolicy for FixedRetryPolicy {
    fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn backoff_duration(&self, _attempt: usize) -> Duration {
        self.delay
    }
}
