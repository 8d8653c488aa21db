//! 节点目录：把注册中心的健康实例同步到连接池
//!
//! 每个刷新周期：
//! 1. 查询注册中心（不持有池锁）
//! 2. 与池中快照按 `instance_id` 求差集
//! 3. 为新增实例建立连接（不持有池锁）
//! 4. 持锁应用：先移除，再插入
//! 5. 被移除的连接在后台关闭，不等待
//!
//! 注册中心返回空列表时视为注册中心异常，不修改连接池。

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel::Connector;
use super::{ChannelEntry, ChannelPool, PoolState, close_detached};
use crate::error::Result;
use crate::registry::RegistryClient;
use crate::types::Endpoint;

/// 一次刷新的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// 注册中心返回空列表，本周期跳过
    EmptyResponse,
    Unchanged,
    Applied { added: usize, removed: usize },
    /// 连接池已被释放，刷新循环应当退出
    PoolDropped,
}

pub struct EndpointDirectory<C: Connector> {
    service_name: String,
    registry_address: Option<String>,
    registry: Arc<dyn RegistryClient>,
    connector: Arc<C>,
    pool: Weak<ChannelPool<C::Channel>>,
    /// 串行化同一个池的后台刷新
    refresh_gate: Mutex<()>,
}

impl<C: Connector> EndpointDirectory<C> {
    pub fn new(
        service_name: impl Into<String>,
        registry_address: Option<String>,
        registry: Arc<dyn RegistryClient>,
        connector: Arc<C>,
        pool: &Arc<ChannelPool<C::Channel>>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            registry_address,
            registry,
            connector,
            pool: Arc::downgrade(pool),
            refresh_gate: Mutex::new(()),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// 执行一个刷新周期
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let _gate = self.refresh_gate.lock().await;
        let Some(pool) = self.pool.upgrade() else {
            return Ok(RefreshOutcome::PoolDropped);
        };

        let Some(latest) = self.query().await? else {
            return Ok(RefreshOutcome::EmptyResponse);
        };

        let (added, removed) = {
            let state = pool.lock().await;
            diff(&state, &latest)
        };
        if added.is_empty() && removed.is_empty() {
            return Ok(RefreshOutcome::Unchanged);
        }

        let opened = self.open_all(added).await;

        let mut state = pool.lock().await;
        // 只移除快照中计算出的那些实例，期间被强制刷新加入的实例不受影响
        let removed_entries: Vec<_> = removed.iter().filter_map(|id| state.remove(id)).collect();
        let added_count = insert_all(&mut state, opened);
        drop(state);

        Ok(self.finish(added_count, removed_entries))
    }

    /// 在已持有池锁的情况下刷新（选择路径上池为空时使用）
    pub async fn refresh_locked(&self, state: &mut PoolState<C::Channel>) -> Result<RefreshOutcome> {
        let Some(latest) = self.query().await? else {
            return Ok(RefreshOutcome::EmptyResponse);
        };

        let (added, removed) = diff(state, &latest);
        if added.is_empty() && removed.is_empty() {
            return Ok(RefreshOutcome::Unchanged);
        }

        let removed_entries: Vec<_> = removed.iter().filter_map(|id| state.remove(id)).collect();
        let opened = self.open_all(added).await;
        let added_count = insert_all(state, opened);

        Ok(self.finish(added_count, removed_entries))
    }

    /// 启动后台刷新循环，第一个周期立即执行
    pub fn spawn(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => match self.refresh().await {
                        Ok(RefreshOutcome::PoolDropped) => break,
                        Ok(_) => {}
                        Err(e) => warn!(
                            service = %self.service_name,
                            error = %e,
                            "Endpoint refresh failed"
                        ),
                    },
                }
            }
            debug!(service = %self.service_name, "Endpoint refresh loop stopped");
        })
    }

    async fn query(&self) -> Result<Option<Vec<Endpoint>>> {
        let latest = self
            .registry
            .query_healthy(&self.service_name, self.registry_address.as_deref())
            .await?;
        if latest.is_empty() {
            warn!(
                service = %self.service_name,
                "Registry returned no healthy instance, keeping current pool"
            );
            return Ok(None);
        }
        Ok(Some(latest))
    }

    /// 并发建立连接，失败的实例跳过，下个周期重试
    async fn open_all(&self, endpoints: Vec<Endpoint>) -> Vec<ChannelEntry<C::Channel>> {
        let attempts = endpoints.into_iter().map(|endpoint| async move {
            match self.connector.connect(&endpoint).await {
                Ok(channel) => Some(ChannelEntry::new(endpoint, channel)),
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Failed to open channel");
                    None
                }
            }
        });
        join_all(attempts).await.into_iter().flatten().collect()
    }

    fn finish(
        &self,
        added: usize,
        removed_entries: Vec<ChannelEntry<C::Channel>>,
    ) -> RefreshOutcome {
        let removed = removed_entries.len();
        for entry in removed_entries {
            close_detached(entry);
        }
        info!(
            service = %self.service_name,
            added,
            removed,
            "Endpoint pool updated"
        );
        RefreshOutcome::Applied { added, removed }
    }
}

/// 计算新增的节点和需要移除的实例 ID
fn diff<H: super::ChannelHandle>(
    state: &PoolState<H>,
    latest: &[Endpoint],
) -> (Vec<Endpoint>, Vec<String>) {
    let current = state.instance_ids();
    let mut seen = HashSet::new();
    let added = latest
        .iter()
        .filter(|e| seen.insert(e.instance_id.as_str()) && !current.contains(&e.instance_id))
        .cloned()
        .collect();
    let removed = current
        .into_iter()
        .filter(|id| !seen.contains(id.as_str()))
        .collect();
    (added, removed)
}

fn insert_all<H: super::ChannelHandle>(state: &mut PoolState<H>, opened: Vec<ChannelEntry<H>>) -> usize {
    let mut added = 0;
    for entry in opened {
        match state.insert(entry) {
            Ok(()) => added += 1,
            Err(duplicate) => close_detached(duplicate),
        }
    }
    added
}
