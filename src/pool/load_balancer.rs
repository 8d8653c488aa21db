//! 健康感知的轮询负载均衡
//!
//! 选择在池锁内完成，锁的等待时间有上限（默认 100ms），超时返回 `FetchTimeout`。
//! 遇到不健康的连接直接淘汰并重置游标；池为空时在持锁状态下强制刷新一次。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::channel::Connector;
use super::directory::EndpointDirectory;
use super::{ChannelPool, close_detached};
use crate::error::{GrpcExtError, Result};

/// 默认的选择锁等待时间
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_millis(100);

pub struct LoadBalancer<C: Connector> {
    pool: Arc<ChannelPool<C::Channel>>,
    directory: Arc<EndpointDirectory<C>>,
    fetch_timeout: Duration,
}

impl<C: Connector> LoadBalancer<C> {
    pub fn new(
        pool: Arc<ChannelPool<C::Channel>>,
        directory: Arc<EndpointDirectory<C>>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            directory,
            fetch_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<ChannelPool<C::Channel>> {
        &self.pool
    }

    /// 选出一个健康的连接
    ///
    /// 每次调用最多强制刷新一次；刷新后仍没有健康连接返回 `NoAvailableEndpoint`，
    /// 绝不返回已知不健康的连接。
    pub async fn select(&self) -> Result<C::Channel> {
        let service = self.pool.service_name();
        let mut state = self
            .pool
            .lock_timeout(self.fetch_timeout)
            .await
            .ok_or_else(|| GrpcExtError::FetchTimeout {
                service: service.to_string(),
                timeout: self.fetch_timeout,
            })?;

        let mut refreshed = false;
        loop {
            if state.is_empty() {
                if !refreshed {
                    refreshed = true;
                    debug!(service = %service, "Pool is empty, forcing endpoint refresh");
                    if let Err(e) = self.directory.refresh_locked(&mut state).await {
                        warn!(service = %service, error = %e, "Forced endpoint refresh failed");
                    }
                }
                if state.is_empty() {
                    return Err(GrpcExtError::NoAvailableEndpoint {
                        service: service.to_string(),
                    });
                }
            }

            if state.cursor() >= state.len() {
                state.set_cursor(0);
            }
            let index = state.cursor();
            // 非空且游标在范围内，条目一定存在
            let Some(entry) = state.entry_at(index) else {
                state.set_cursor(0);
                continue;
            };

            let health = entry.state();
            if health.is_ready() {
                let channel = entry.channel.clone();
                state.set_cursor(index + 1);
                return Ok(channel);
            }

            let evicted = state.evict_at(index);
            debug!(
                service = %service,
                endpoint = %evicted.endpoint,
                state = ?health,
                "Evicting unhealthy channel"
            );
            close_detached(evicted);
        }
    }
}
