//! Flare gRPC 客户端扩展
//!
//! 基于注册中心的动态连接池、健康感知的轮询负载均衡，以及本实例的 TTL 心跳注册。

pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod manager;
pub mod meta;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{
    Config, ConfigError, DiscoveryMode, LocalServiceConfig, LogFormat, LoggingConfig,
    PoolSettings, RemoteServiceConfig,
};
pub use context::GrpcExtContext;
pub use error::{ErrorCode, GrpcExtError, Result};
pub use logging::init_tracing;
pub use manager::ChannelManager;
pub use meta::{MethodDescriptor, MethodKind, ServiceMeta};
pub use pool::{
    ChannelEntry, ChannelHandle, ChannelPool, ChannelState, Connector, EndpointDirectory,
    GrpcChannel, GrpcConnector, LoadBalancer, RefreshOutcome,
};
pub use registry::{
    ConsulRegistryClient, HeartbeatOutcome, HeartbeatRegistrar, RegistrarState,
    RegistrationRecord, RegistryClient, RegistryError,
};
pub use retry::{ExponentialBackoffPolicy, FixedRetryPolicy, RetryPolicy};
pub use types::Endpoint;
