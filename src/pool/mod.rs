//! 动态连接池
//!
//! 每个远端服务一个池，池内按发现顺序保存每个健康实例的连接。
//! 条目和轮询游标放在同一把锁后面，后台刷新和请求路径上的选择都要经过这把锁。

pub mod channel;
pub mod directory;
pub mod load_balancer;

use futures::future::join_all;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::types::Endpoint;

pub use channel::{ChannelHandle, ChannelState, Connector, GrpcChannel, GrpcConnector};
pub use directory::{EndpointDirectory, RefreshOutcome};
pub use load_balancer::LoadBalancer;

/// 池中的一个条目，独占它的连接
#[derive(Debug)]
pub struct ChannelEntry<H> {
    pub endpoint: Endpoint,
    pub channel: H,
}

impl<H: ChannelHandle> ChannelEntry<H> {
    pub fn new(endpoint: Endpoint, channel: H) -> Self {
        Self { endpoint, channel }
    }

    pub fn instance_id(&self) -> &str {
        &self.endpoint.instance_id
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }
}

/// 锁保护的池状态
#[derive(Debug)]
pub struct PoolState<H> {
    entries: Vec<ChannelEntry<H>>,
    cursor: usize,
}

impl<H> Default for PoolState<H> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
        }
    }
}

impl<H: ChannelHandle> PoolState<H> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.entries.iter().any(|e| e.instance_id() == instance_id)
    }

    pub fn instance_ids(&self) -> HashSet<String> {
        self.entries
            .iter()
            .map(|e| e.endpoint.instance_id.clone())
            .collect()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.entries.iter().map(|e| e.endpoint.clone()).collect()
    }

    /// 插入新条目；同一实例已存在时原样退回
    pub fn insert(&mut self, entry: ChannelEntry<H>) -> Result<(), ChannelEntry<H>> {
        if self.contains(entry.instance_id()) {
            return Err(entry);
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn remove(&mut self, instance_id: &str) -> Option<ChannelEntry<H>> {
        let index = self
            .entries
            .iter()
            .position(|e| e.instance_id() == instance_id)?;
        Some(self.entries.remove(index))
    }

    pub(crate) fn entry_at(&self, index: usize) -> Option<&ChannelEntry<H>> {
        self.entries.get(index)
    }

    pub(crate) fn evict_at(&mut self, index: usize) -> ChannelEntry<H> {
        self.cursor = 0;
        self.entries.remove(index)
    }

    pub(crate) fn set_cursor(&mut self, cursor: usize) {
        self.cursor = cursor;
    }

    fn drain(&mut self) -> Vec<ChannelEntry<H>> {
        self.cursor = 0;
        std::mem::take(&mut self.entries)
    }
}

/// 一个远端服务的连接池
pub struct ChannelPool<H> {
    service_name: String,
    state: Mutex<PoolState<H>>,
}

impl<H: ChannelHandle> ChannelPool<H> {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub async fn lock(&self) -> MutexGuard<'_, PoolState<H>> {
        self.state.lock().await
    }

    /// 限时获取锁，超时返回 `None`
    pub async fn lock_timeout(&self, limit: Duration) -> Option<MutexGuard<'_, PoolState<H>>> {
        tokio::time::timeout(limit, self.state.lock()).await.ok()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn endpoints(&self) -> Vec<Endpoint> {
        self.state.lock().await.endpoints()
    }

    /// 清空并关闭全部连接，等待每个关闭完成
    pub async fn shutdown_all(&self) -> usize {
        let entries = self.state.lock().await.drain();
        let count = entries.len();
        join_all(entries.iter().map(|e| e.channel.shutdown())).await;
        if count > 0 {
            info!(service = %self.service_name, closed = count, "Channel pool shut down");
        }
        count
    }
}

/// 在后台关闭连接，不等待完成
pub(crate) fn close_detached<H: ChannelHandle>(entry: ChannelEntry<H>) {
    tokio::spawn(async move {
        entry.channel.shutdown().await;
        debug!(endpoint = %entry.endpoint, "Channel closed");
    });
}
