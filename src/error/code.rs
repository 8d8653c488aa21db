//! 错误代码定义
//!
//! 代码段沿用 flare 的分段约定：
//! - 1000-1999: 连接相关错误
//! - 6000-6999: 系统相关错误
//! - 7000-7999: 网络相关错误
//! - 8000-8999: 序列化相关错误
//! - 9000-9999: 通用错误

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 连接相关错误 (1000-1999)
    // ============================================================
    ConnectionFailed = 1000,
    NoAvailableEndpoint = 1007,

    // ============================================================
    // 系统相关错误 (6000-6999)
    // ============================================================
    ResourceExhausted = 6002,
    ConfigurationError = 6003,
    RegistrationFailed = 6005,

    // ============================================================
    // 网络相关错误 (7000-7999)
    // ============================================================
    NetworkError = 7000,

    // ============================================================
    // 序列化相关错误 (8000-8999)
    // ============================================================
    DeserializationError = 8001,

    // ============================================================
    // 通用错误 (9000-9999)
    // ============================================================
    InvalidParameter = 9001,
    OperationFailed = 9003,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ErrorCode {
    /// 获取错误代码的数字值
    #[inline]
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::NoAvailableEndpoint => "NO_AVAILABLE_ENDPOINT",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::RegistrationFailed => "REGISTRATION_FAILED",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::DeserializationError => "DESERIALIZATION_ERROR",
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::OperationFailed => "OPERATION_FAILED",
        }
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionFailed
                | ErrorCode::NetworkError
                | ErrorCode::ResourceExhausted
        )
    }
}
