//! 远端服务别名到连接的映射
//!
//! - `direct`：静态地址列表，每个地址一个共享连接，失效时整体替换
//! - `registry`：由注册中心发现，委托给该服务连接池的负载均衡器

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, DiscoveryMode, PoolSettings, RemoteServiceConfig};
use crate::error::{GrpcExtError, Result};
use crate::pool::{
    ChannelHandle, ChannelPool, Connector, EndpointDirectory, GrpcConnector, LoadBalancer,
    RefreshOutcome,
};
use crate::registry::RegistryClient;
use crate::retry::RetryPolicy;
use crate::types::Endpoint;

enum RemoteTarget<C: Connector> {
    Direct {
        endpoints: Vec<Endpoint>,
        cursor: AtomicUsize,
    },
    Registry {
        directory: Arc<EndpointDirectory<C>>,
        balancer: LoadBalancer<C>,
        refresh_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    },
}

/// 连接管理器
pub struct ChannelManager<C: Connector = GrpcConnector> {
    connector: Arc<C>,
    registry: Arc<dyn RegistryClient>,
    settings: PoolSettings,
    targets: RwLock<HashMap<String, Arc<RemoteTarget<C>>>>,
    /// 直连模式的共享连接，按 `host:port` 索引
    direct_channels: Mutex<HashMap<String, C::Channel>>,
    cancel: CancellationToken,
}

impl<C: Connector> ChannelManager<C> {
    pub fn new(connector: Arc<C>, registry: Arc<dyn RegistryClient>, settings: PoolSettings) -> Self {
        Self {
            connector,
            registry,
            settings,
            targets: RwLock::new(HashMap::new()),
            direct_channels: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// 登记一个远端服务；注册中心模式会立即启动后台刷新循环
    pub async fn add_remote(&self, config: &RemoteServiceConfig) -> Result<()> {
        config.validate()?;
        let alias = config.name.trim().to_string();

        let mut targets = self.targets.write().await;
        if targets.contains_key(&alias) {
            return Err(ConfigError::DuplicateAlias(alias).into());
        }

        let target = match config.discovery {
            DiscoveryMode::Direct => RemoteTarget::Direct {
                endpoints: config.direct_endpoints()?,
                cursor: AtomicUsize::new(0),
            },
            DiscoveryMode::Registry => {
                let pool = Arc::new(ChannelPool::new(config.service_name.clone()));
                let directory = Arc::new(EndpointDirectory::new(
                    config.service_name.clone(),
                    config.registry_address.clone(),
                    self.registry.clone(),
                    self.connector.clone(),
                    &pool,
                ));
                let task = directory
                    .clone()
                    .spawn(config.refresh_interval(), self.cancel.child_token());
                let balancer =
                    LoadBalancer::new(pool, directory.clone(), self.settings.fetch_timeout());
                RemoteTarget::Registry {
                    directory,
                    balancer,
                    refresh_task: std::sync::Mutex::new(Some(task)),
                }
            }
        };

        info!(
            alias = %alias,
            service = %config.service_name,
            discovery = ?config.discovery,
            "Remote service added"
        );
        targets.insert(alias, Arc::new(target));
        Ok(())
    }

    pub async fn aliases(&self) -> Vec<String> {
        self.targets.read().await.keys().cloned().collect()
    }

    async fn target(&self, alias: &str) -> Result<Arc<RemoteTarget<C>>> {
        let alias = alias.trim();
        self.targets
            .read()
            .await
            .get(alias)
            .cloned()
            .ok_or_else(|| GrpcExtError::UnknownService(alias.to_string()))
    }

    /// 为别名选择一个可用连接
    pub async fn select_endpoint(&self, alias: &str) -> Result<C::Channel> {
        match self.target(alias).await?.as_ref() {
            RemoteTarget::Direct { endpoints, cursor } => {
                // 从游标位置开始，当前地址不可用时依次尝试下一个
                let start = cursor.fetch_add(1, Ordering::Relaxed);
                let mut last_error = None;
                for offset in 0..endpoints.len() {
                    let endpoint = &endpoints[(start + offset) % endpoints.len()];
                    match self.direct_channel(endpoint).await {
                        Ok(Some(channel)) => return Ok(channel),
                        Ok(None) => {}
                        Err(e) => last_error = Some(e),
                    }
                }
                Err(last_error.unwrap_or_else(|| GrpcExtError::NoAvailableEndpoint {
                    service: endpoints
                        .first()
                        .map(|e| e.service_name.clone())
                        .unwrap_or_else(|| alias.trim().to_string()),
                }))
            }
            RemoteTarget::Registry { balancer, .. } => balancer.select().await,
        }
    }

    /// 取得直连地址的共享连接；连接已失效时建立新连接并替换
    ///
    /// 建立连接时不持有缓存锁，一个地址连接缓慢不会阻塞其他地址。
    /// 新连接本身已失效时返回 `None`，不放入缓存。
    async fn direct_channel(&self, endpoint: &Endpoint) -> Result<Option<C::Channel>> {
        let key = endpoint.authority();
        if let Some(channel) = self.direct_channels.lock().await.get(&key) {
            let state = channel.state();
            if !state.is_failed() {
                return Ok(Some(channel.clone()));
            }
            debug!(endpoint = %key, state = ?state, "Replacing failed direct channel");
        }

        let fresh = self.connector.connect(endpoint).await?;
        let state = fresh.state();
        if state.is_failed() {
            debug!(endpoint = %key, state = ?state, "New direct channel is unusable");
            tokio::spawn(async move { fresh.shutdown().await });
            return Ok(None);
        }

        let mut cache = self.direct_channels.lock().await;
        if self.cancel.is_cancelled() {
            drop(cache);
            tokio::spawn(async move { fresh.shutdown().await });
            return Ok(None);
        }
        // 等待连接期间别的调用方可能已经换上了健康连接
        if let Some(current) = cache.get(&key) {
            if !current.state().is_failed() {
                let current = current.clone();
                drop(cache);
                tokio::spawn(async move { fresh.shutdown().await });
                return Ok(Some(current));
            }
        }
        if let Some(old) = cache.insert(key, fresh.clone()) {
            tokio::spawn(async move { old.shutdown().await });
        }
        Ok(Some(fresh))
    }

    /// 注册中心模式下的连接池
    pub async fn pool(&self, alias: &str) -> Option<Arc<ChannelPool<C::Channel>>> {
        match self.target(alias).await.ok()?.as_ref() {
            RemoteTarget::Registry { balancer, .. } => Some(balancer.pool().clone()),
            RemoteTarget::Direct { .. } => None,
        }
    }

    /// 立即执行一次刷新周期；直连模式没有可刷新的内容
    pub async fn refresh(&self, alias: &str) -> Result<RefreshOutcome> {
        match self.target(alias).await?.as_ref() {
            RemoteTarget::Registry { directory, .. } => directory.refresh().await,
            RemoteTarget::Direct { .. } => Ok(RefreshOutcome::Unchanged),
        }
    }

    /// 选择连接并执行调用，按策略重试
    ///
    /// 每次尝试都重新选择连接，失败的节点不会被反复使用。
    pub async fn call_with_retry<T, F, Fut>(
        &self,
        alias: &str,
        policy: &dyn RetryPolicy,
        mut call: F,
    ) -> std::result::Result<T, Status>
    where
        F: FnMut(C::Channel) -> Fut,
        Fut: Future<Output = std::result::Result<T, Status>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let retry = match self.select_endpoint(alias).await {
                Ok(channel) => match call(channel).await {
                    Ok(value) => return Ok(value),
                    Err(status) if policy.should_retry(attempt, &status) => status,
                    Err(status) => return Err(status),
                },
                Err(e) if policy.should_retry_selection(attempt, &e) => e.into(),
                Err(e) => return Err(e.into()),
            };

            let delay = policy.backoff_duration(attempt);
            debug!(
                alias = %alias,
                attempt,
                delay_ms = delay.as_millis() as u64,
                code = ?retry.code(),
                "Retrying call"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// 停止全部刷新循环并关闭全部连接，等待每个关闭完成
    ///
    /// 之后所有别名都不再可用。
    pub async fn shutdown_all(&self) {
        self.cancel.cancel();
        let targets: Vec<_> = self.targets.write().await.drain().collect();

        for (alias, target) in targets {
            if let RemoteTarget::Registry {
                balancer,
                refresh_task,
                ..
            } = target.as_ref()
            {
                let task = refresh_task.lock().ok().and_then(|mut t| t.take());
                if let Some(task) = task {
                    if let Err(e) = task.await {
                        warn!(alias = %alias, error = %e, "Refresh task ended abnormally");
                    }
                }
                balancer.pool().shutdown_all().await;
            }
        }

        let direct: Vec<_> = self.direct_channels.lock().await.drain().collect();
        futures::future::join_all(direct.iter().map(|(_, channel)| channel.shutdown())).await;
        info!("All channel pools shut down");
    }
}
