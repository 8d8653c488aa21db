use super::RetryPolicy;
use std::time::Duration;

/// 指数退避重试策略
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoffPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// 第 n 次失败后等待 `base * 2^(n-1)`，不超过 `max_delay`
    fn backoff_duration(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(16) as u32;
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}
