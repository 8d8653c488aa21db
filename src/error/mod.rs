//! 错误处理模块
//!
//! 统一的错误类型、错误代码，以及到 `tonic::Status` 的转换。
//! 请求路径上的错误总是同步返回给调用方；后台循环中的错误只记录日志。

pub mod code;
pub mod grpc;

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::registry::RegistryError;

pub use code::ErrorCode;

/// 扩展层统一错误类型
#[derive(Error, Debug)]
pub enum GrpcExtError {
    /// 连接池为空，强制刷新后仍然没有可用的节点
    #[error("no-available-endpoint: service `{service}` has no healthy endpoint")]
    NoAvailableEndpoint { service: String },

    /// 在限定时间内拿不到连接池的选择锁（池正在修复中）
    #[error("fetch-timeout: pool of `{service}` stayed locked for more than {timeout:?}")]
    FetchTimeout { service: String, timeout: Duration },

    /// 未配置的服务别名
    #[error("unknown service alias `{0}`")]
    UnknownService(String),

    /// 无法为节点建立连接
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// 启动时注册失败（服务对外提供能力的前提）
    #[error("failed to register service instance: {0}")]
    Registration(#[source] RegistryError),

    /// 注册器已经停止，不能再次启动
    #[error("registrar has already been stopped")]
    RegistrarStopped,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GrpcExtError {
    pub fn connect(endpoint: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        GrpcExtError::Connect {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            GrpcExtError::NoAvailableEndpoint { .. } => ErrorCode::NoAvailableEndpoint,
            GrpcExtError::FetchTimeout { .. } => ErrorCode::ResourceExhausted,
            GrpcExtError::UnknownService(_) => ErrorCode::InvalidParameter,
            GrpcExtError::Connect { .. } => ErrorCode::ConnectionFailed,
            GrpcExtError::Registration(_) => ErrorCode::RegistrationFailed,
            GrpcExtError::RegistrarStopped => ErrorCode::OperationFailed,
            GrpcExtError::Registry(err) => err.code(),
            GrpcExtError::Config(_) => ErrorCode::ConfigurationError,
        }
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, GrpcExtError>;
