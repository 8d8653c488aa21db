//! 调用方重试策略
//!
//! 连接池和注册中心客户端内部都不重试；需要重试的调用通过
//! `ChannelManager::call_with_retry` 在每次尝试前重新选择连接。

pub mod exponential;
pub mod fixed;

pub use exponential::ExponentialBackoffPolicy;
pub use fixed::FixedRetryPolicy;

use std::time::Duration;
use tonic::Status;

use crate::error::GrpcExtError;
use crate::error::grpc::is_retryable_status;

/// 重试策略 trait
///
/// `attempt` 从 1 开始，表示已经完成的尝试次数。
pub trait RetryPolicy: Send + Sync {
    fn max_attempts(&self) -> usize;

    fn backoff_duration(&self, attempt: usize) -> Duration;

    /// RPC 本身失败时是否重试
    fn should_retry(&self, attempt: usize, status: &Status) -> bool {
        attempt < self.max_attempts() && is_retryable_status(status)
    }

    /// 选择连接失败时是否重试（池忙可以重试，池为空不重试）
    fn should_retry_selection(&self, attempt: usize, error: &GrpcExtError) -> bool {
        attempt < self.max_attempts() && error.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_errors_follow_their_codes() {
        let policy = FixedRetryPolicy::new(3, Duration::from_millis(10));
        let busy = GrpcExtError::FetchTimeout {
            service: "greeter".into(),
            timeout: Duration::from_millis(100),
        };
        let empty = GrpcExtError::NoAvailableEndpoint {
            service: "greeter".into(),
        };

        assert!(policy.should_retry_selection(1, &busy));
        assert!(!policy.should_retry_selection(3, &busy));
        assert!(!policy.should_retry_selection(1, &empty));
    }

    #[test]
    fn only_transient_statuses_are_retried() {
        let policy = FixedRetryPolicy::new(3, Duration::from_millis(10));
        assert!(policy.should_retry(1, &Status::unavailable("down")));
        assert!(policy.should_retry(2, &Status::deadline_exceeded("slow")));
        assert!(!policy.should_retry(1, &Status::invalid_argument("bad")));
        assert!(!policy.should_retry(3, &Status::unavailable("down")));
    }
}
