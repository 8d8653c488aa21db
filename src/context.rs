//! 扩展层运行上下文
//!
//! 显式构造、显式传递：配置、连接管理器、注册器和服务元数据都归上下文所有，
//! 没有全局单例。典型生命周期：
//!
//! ```ignore
//! let ctx = GrpcExtContext::from_config(Config::load_from_file("grpc-ext.toml")?).await?;
//! ctx.start_registration().await?;
//! let channel = ctx.select_endpoint("users").await?;
//! // ...
//! ctx.shutdown().await;
//! ```

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::Result;
use crate::manager::ChannelManager;
use crate::meta::{MethodDescriptor, ServiceMeta};
use crate::pool::{Connector, GrpcConnector};
use crate::registry::{ConsulRegistryClient, HeartbeatRegistrar, RegistryClient};

pub struct GrpcExtContext<C: Connector = GrpcConnector> {
    config: Config,
    channels: ChannelManager<C>,
    registrar: Option<HeartbeatRegistrar>,
    meta: RwLock<ServiceMeta>,
}

impl GrpcExtContext<GrpcConnector> {
    /// 使用 tonic 连接和 Consul 客户端构建上下文，并启动全部刷新循环
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(ConsulRegistryClient::new(
            config.registry_address(),
            config.pool.registry_timeout(),
        )?);
        let connector = Arc::new(GrpcConnector::new(&config.pool));
        Self::from_parts(config, connector, registry).await
    }
}

impl<C: Connector> GrpcExtContext<C> {
    pub async fn from_parts(
        config: Config,
        connector: Arc<C>,
        registry: Arc<dyn RegistryClient>,
    ) -> Result<Self> {
        config.validate()?;

        let channels = ChannelManager::new(connector, registry.clone(), config.pool.clone());
        for remote in &config.remotes {
            channels.add_remote(remote).await?;
        }

        let (registrar, meta) = match &config.local {
            Some(local) => {
                let record = local.registration_record()?;
                let registrar = HeartbeatRegistrar::new(registry, record, local.ttl_interval());
                let meta = ServiceMeta::new(&local.service_name, Some(local.service_address.clone()));
                (Some(registrar), meta)
            }
            None => (None, ServiceMeta::new(String::new(), None)),
        };

        info!(
            remotes = config.remotes.len(),
            local = config.local.as_ref().map(|l| l.service_name.as_str()),
            "gRPC extension context initialised"
        );

        Ok(Self {
            config,
            channels,
            registrar,
            meta: RwLock::new(meta),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn channels(&self) -> &ChannelManager<C> {
        &self.channels
    }

    pub fn registrar(&self) -> Option<&HeartbeatRegistrar> {
        self.registrar.as_ref()
    }

    /// 注册本实例并开始心跳；没有配置本地实例时什么也不做
    pub async fn start_registration(&self) -> Result<()> {
        match &self.registrar {
            Some(registrar) => registrar.start().await,
            None => {
                debug!("No local service configured, skipping registration");
                Ok(())
            }
        }
    }

    pub async fn stop_registration(&self) {
        if let Some(registrar) = &self.registrar {
            registrar.stop().await;
        }
    }

    pub async fn shutdown_all_pools(&self) {
        self.channels.shutdown_all().await;
    }

    /// 先注销再关闭连接
    pub async fn shutdown(&self) {
        self.stop_registration().await;
        self.shutdown_all_pools().await;
    }

    pub async fn select_endpoint(&self, alias: &str) -> Result<C::Channel> {
        self.channels.select_endpoint(alias).await
    }

    pub async fn register_method(&self, method: MethodDescriptor) -> bool {
        self.meta.write().await.register(method)
    }

    pub async fn meta(&self) -> ServiceMeta {
        self.meta.read().await.clone()
    }
}
