//! 本实例的注册与 TTL 心跳
//!
//! 状态机：`Unregistered -> Active -> Stopped`，`Stopped` 为终态。
//!
//! - 启动时注册失败直接返回错误，调用方应当中止启动
//! - 心跳失败只记录日志，下一个周期继续
//! - 注册中心丢失 TTL 检查（例如注册中心重启）时，用同一条注册记录重新注册
//! - 停止时先取消心跳循环，再尽力注销一次

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{RegistrationRecord, RegistryClient, RegistryError};
use crate::error::{GrpcExtError, Result};

/// 默认心跳间隔
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// 注册器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrarState {
    Unregistered,
    Active,
    Stopped,
}

/// 单次心跳的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Passed,
    /// 检查已丢失，重新注册成功
    Reregistered,
    /// 检查已丢失，重新注册也失败了，等下一个周期
    ReregisterFailed,
    TransportFailure,
    Rejected,
}

struct RegistrarInner {
    state: RegistrarState,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// 心跳注册器
pub struct HeartbeatRegistrar {
    client: Arc<dyn RegistryClient>,
    record: RegistrationRecord,
    interval: Duration,
    inner: Mutex<RegistrarInner>,
}

impl HeartbeatRegistrar {
    pub fn new(
        client: Arc<dyn RegistryClient>,
        record: RegistrationRecord,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            record,
            interval,
            inner: Mutex::new(RegistrarInner {
                state: RegistrarState::Unregistered,
                cancel: CancellationToken::new(),
                task: None,
            }),
        }
    }

    pub fn record(&self) -> &RegistrationRecord {
        &self.record
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn state(&self) -> RegistrarState {
        self.inner.lock().await.state
    }

    /// 注册本实例并启动心跳循环
    ///
    /// 已经处于 `Active` 时什么也不做；停止后不能再次启动。
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            RegistrarState::Active => return Ok(()),
            RegistrarState::Stopped => return Err(GrpcExtError::RegistrarStopped),
            RegistrarState::Unregistered => {}
        }

        self.client
            .register(&self.record)
            .await
            .map_err(GrpcExtError::Registration)?;

        info!(
            service = %self.record.service_name,
            instance_id = %self.record.instance_id,
            address = %self.record.address,
            port = self.record.port,
            "✅ Service instance registered"
        );

        let task = tokio::spawn(run_heartbeat_loop(
            self.client.clone(),
            self.record.clone(),
            self.interval,
            inner.cancel.clone(),
        ));
        inner.task = Some(task);
        inner.state = RegistrarState::Active;
        Ok(())
    }

    /// 发送一次心跳（心跳循环之外的手动触发）
    pub async fn beat(&self) -> HeartbeatOutcome {
        send_heartbeat(self.client.as_ref(), &self.record).await
    }

    /// 停止心跳并注销，可重复调用
    ///
    /// 必须先等待心跳循环退出再注销，否则正在进行的心跳可能把刚注销的实例又注册回去。
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        let was_active = match inner.state {
            RegistrarState::Stopped => return,
            RegistrarState::Active => true,
            RegistrarState::Unregistered => false,
        };
        inner.state = RegistrarState::Stopped;
        inner.cancel.cancel();

        if let Some(task) = inner.task.take() {
            if let Err(e) = task.await {
                warn!(
                    instance_id = %self.record.instance_id,
                    error = %e,
                    "Heartbeat task ended abnormally"
                );
            }
        }

        if !was_active {
            return;
        }

        match self.client.deregister(&self.record.instance_id).await {
            Ok(()) => info!(
                instance_id = %self.record.instance_id,
                "✅ Service instance deregistered"
            ),
            Err(e) => warn!(
                instance_id = %self.record.instance_id,
                error = %e,
                "⚠️ Failed to deregister service instance"
            ),
        }
    }
}

impl Drop for HeartbeatRegistrar {
    fn drop(&mut self) {
        // 没有显式 stop 时尽量补一次注销（运行时可能已经在关闭）
        let inner = self.inner.get_mut();
        if inner.state != RegistrarState::Active {
            return;
        }
        inner.state = RegistrarState::Stopped;
        inner.cancel.cancel();
        let task = inner.task.take();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let client = self.client.clone();
            let instance_id = self.record.instance_id.clone();
            handle.spawn(async move {
                if let Some(task) = task {
                    let _ = task.await;
                }
                if let Err(e) = client.deregister(&instance_id).await {
                    warn!(
                        instance_id = %instance_id,
                        error = %e,
                        "⚠️ Failed to deregister service instance on drop"
                    );
                }
            });
        }
    }
}

async fn run_heartbeat_loop(
    client: Arc<dyn RegistryClient>,
    record: RegistrationRecord,
    period: Duration,
    cancel: CancellationToken,
) {
    // 第一次 tick 立即完成，相当于注册后马上发送一次心跳
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(instance_id = %record.instance_id, "🛑 Heartbeat task stopped");
                break;
            }
            _ = ticker.tick() => {
                send_heartbeat(client.as_ref(), &record).await;
            }
        }
    }
}

async fn send_heartbeat(client: &dyn RegistryClient, record: &RegistrationRecord) -> HeartbeatOutcome {
    let note = format!("timer:{}", Utc::now().to_rfc3339());

    match client.pass_check(&record.ttl_check_id, &note).await {
        Ok(()) => {
            debug!(instance_id = %record.instance_id, "💓 Heartbeat sent");
            HeartbeatOutcome::Passed
        }
        Err(RegistryError::CheckNotFound { check_id }) => {
            warn!(
                instance_id = %record.instance_id,
                check_id = %check_id,
                "TTL check lost by registry, re-registering"
            );
            match client.register(record).await {
                Ok(()) => {
                    info!(instance_id = %record.instance_id, "✅ Service instance re-registered");
                    HeartbeatOutcome::Reregistered
                }
                Err(e) => {
                    error!(
                        instance_id = %record.instance_id,
                        error = %e,
                        "❌ Failed to re-register service instance"
                    );
                    HeartbeatOutcome::ReregisterFailed
                }
            }
        }
        Err(e) if e.is_transport() => {
            warn!(
                instance_id = %record.instance_id,
                error = %e,
                "⚠️ Registry unreachable, heartbeat skipped"
            );
            HeartbeatOutcome::TransportFailure
        }
        Err(e) => {
            warn!(
                instance_id = %record.instance_id,
                error = %e,
                "⚠️ Heartbeat rejected by registry"
            );
            HeartbeatOutcome::Rejected
        }
    }
}
