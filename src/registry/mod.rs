//! 服务注册中心模块
//!
//! 对外部注册中心（Consul HTTP API）的薄封装，以及本进程的心跳注册器。
//! 客户端内部不做任何重试，重试策略属于调用方。

pub mod consul;
pub mod heartbeat;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::error::ErrorCode;
use crate::types::Endpoint;

pub use consul::ConsulRegistryClient;
pub use heartbeat::{HeartbeatOutcome, HeartbeatRegistrar, RegistrarState};

/// 注册中心调用错误
///
/// 区分"连不上注册中心"和"注册中心拒绝了请求"，心跳逻辑依赖这个区分。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// 连接失败、超时等传输层错误，注册中心预期会自行恢复
    #[error("registry transport error: {0}")]
    Transport(String),

    /// 注册中心已经丢失了这个 TTL 检查（通常是注册中心重启）
    #[error("check `{check_id}` has no associated TTL")]
    CheckNotFound { check_id: String },

    #[error("registry rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("failed to decode registry response: {0}")]
    Decode(String),
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::Transport(_) => ErrorCode::NetworkError,
            RegistryError::CheckNotFound { .. } => ErrorCode::RegistrationFailed,
            RegistryError::Rejected { .. } => ErrorCode::OperationFailed,
            RegistryError::Decode(_) => ErrorCode::DeserializationError,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, RegistryError::Transport(_))
    }
}

/// 本进程的注册记录
///
/// 进程生命周期内只创建一次；因检查丢失而重新注册时沿用同一个 `instance_id`，
/// 在注册中心看来仍是同一个逻辑实例。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub service_name: String,
    pub instance_id: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub ttl_check_id: String,
    /// 注册中心侧 TTL 检查的有效期
    pub check_ttl: Duration,
    /// 检查持续失败多久后由注册中心自动注销
    pub deregister_critical_after: Duration,
}

impl RegistrationRecord {
    pub fn new(
        service_name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        tags: Vec<String>,
    ) -> Self {
        let service_name = service_name.into();
        let address = address.into();
        let instance_id = format!(
            "{}-{}-{}-{}",
            service_name,
            address,
            port,
            uuid::Uuid::new_v4()
        );
        let ttl_check_id = format!("service:{}", instance_id);
        Self {
            service_name,
            instance_id,
            address,
            port,
            tags,
            ttl_check_id,
            check_ttl: Duration::from_secs(15),
            deregister_critical_after: Duration::from_secs(60),
        }
    }

    pub fn with_check_ttl(mut self, ttl: Duration) -> Self {
        self.check_ttl = ttl;
        self
    }

    pub fn with_deregister_after(mut self, after: Duration) -> Self {
        self.deregister_critical_after = after;
        self
    }
}

/// 注册中心客户端
///
/// 所有调用都受传输超时约束；`registry_address` 为 `None` 时使用客户端自身的默认地址。
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// 查询通过健康检查的实例
    async fn query_healthy(
        &self,
        service_name: &str,
        registry_address: Option<&str>,
    ) -> Result<Vec<Endpoint>, RegistryError>;

    /// 注册（同一个 ID 重复注册是幂等的）
    async fn register(&self, record: &RegistrationRecord) -> Result<(), RegistryError>;

    async fn deregister(&self, instance_id: &str) -> Result<(), RegistryError>;

    /// 将 TTL 检查置为通过
    async fn pass_check(&self, check_id: &str, note: &str) -> Result<(), RegistryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_identity_is_derived_once() {
        let record = RegistrationRecord::new("greeter", "10.0.0.5", 50051, vec!["v-1".into()]);
        assert!(record.instance_id.starts_with("greeter-10.0.0.5-50051-"));
        assert_eq!(record.ttl_check_id, format!("service:{}", record.instance_id));

        let other = RegistrationRecord::new("greeter", "10.0.0.5", 50051, vec![]);
        assert_ne!(record.instance_id, other.instance_id);
    }
}
