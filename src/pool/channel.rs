//! 连接句柄与连接器
//!
//! 连接池只关心两件事：连接当前是否健康，以及如何关闭它。
//! `GrpcConnector` 是基于 tonic 的实现；测试中可以替换为可控的假连接。

use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint as TonicEndpoint};
use tracing::{debug, warn};

use crate::config::PoolSettings;
use crate::error::{GrpcExtError, Result};
use crate::types::Endpoint;

/// 连接健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Ready = 1,
    TransientFailure = 2,
    Shutdown = 3,
}

impl ChannelState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ChannelState::Ready)
    }

    /// 已失效的连接只能替换，不能修复
    pub fn is_failed(&self) -> bool {
        matches!(self, ChannelState::TransientFailure | ChannelState::Shutdown)
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Connecting,
            1 => ChannelState::Ready,
            2 => ChannelState::TransientFailure,
            _ => ChannelState::Shutdown,
        }
    }
}

/// 连接句柄
///
/// 克隆代价低，多个调用方可以并发使用同一个连接。
#[async_trait]
pub trait ChannelHandle: Clone + Send + Sync + 'static {
    /// 实时读取连接状态
    fn state(&self) -> ChannelState;

    /// 关闭连接，之后 `state()` 返回 `Shutdown`
    async fn shutdown(&self);
}

/// 为一个节点建立连接
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Channel: ChannelHandle;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Channel>;
}

/// 基于 tonic 的连接器
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    connect_timeout: Duration,
    request_timeout: Duration,
    probe_interval: Duration,
}

impl GrpcConnector {
    pub fn new(settings: &PoolSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            request_timeout: settings.request_timeout(),
            probe_interval: settings.health_probe_interval(),
        }
    }
}

impl Default for GrpcConnector {
    fn default() -> Self {
        Self::new(&PoolSettings::default())
    }
}

#[async_trait]
impl Connector for GrpcConnector {
    type Channel = GrpcChannel;

    async fn connect(&self, endpoint: &Endpoint) -> Result<GrpcChannel> {
        let uri = endpoint.to_grpc_uri();
        let builder = TonicEndpoint::from_shared(uri.clone())
            .map_err(|e| GrpcExtError::connect(&uri, e))?
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout);

        // 连接失败时仍然返回一个惰性连接，状态为 TransientFailure，由负载均衡器淘汰
        let (channel, initial) = match builder.connect().await {
            Ok(channel) => (channel, ChannelState::Ready),
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Failed to connect to endpoint");
                (builder.connect_lazy(), ChannelState::TransientFailure)
            }
        };

        let state = Arc::new(AtomicU8::new(initial as u8));
        let probe = CancellationToken::new();
        tokio::spawn(probe_reachability(
            endpoint.authority(),
            Arc::downgrade(&state),
            self.probe_interval,
            self.connect_timeout,
            probe.clone(),
        ));

        debug!(endpoint = %endpoint, state = ?initial, "Channel opened");
        Ok(GrpcChannel {
            channel,
            state,
            probe,
        })
    }
}

/// tonic 连接及其健康状态
#[derive(Debug, Clone)]
pub struct GrpcChannel {
    channel: Channel,
    state: Arc<AtomicU8>,
    probe: CancellationToken,
}

impl GrpcChannel {
    /// 用于构造 tonic 生成的客户端
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }
}

#[async_trait]
impl ChannelHandle for GrpcChannel {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    async fn shutdown(&self) {
        self.state.store(ChannelState::Shutdown as u8, Ordering::Release);
        self.probe.cancel();
    }
}

/// 周期性 TCP 探测，在 Ready 和 TransientFailure 之间切换
///
/// 所有句柄都被释放或连接被关闭后退出。
async fn probe_reachability(
    authority: String,
    state: Weak<AtomicU8>,
    period: Duration,
    connect_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }

        let reachable = matches!(
            timeout(connect_timeout, TcpStream::connect(authority.as_str())).await,
            Ok(Ok(_))
        );

        let Some(state) = state.upgrade() else {
            break;
        };
        let next = if reachable {
            ChannelState::Ready
        } else {
            ChannelState::TransientFailure
        };
        let previous = state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current != ChannelState::Shutdown as u8).then_some(next as u8)
        });

        match previous {
            Err(_) => break,
            Ok(prev) if prev != next as u8 => {
                debug!(
                    endpoint = %authority,
                    from = ?ChannelState::from_u8(prev),
                    to = ?next,
                    "Channel state changed"
                );
            }
            Ok(_) => {}
        }
    }
}
