//! 单元测试用的内存注册中心与可控连接

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{GrpcExtError, Result};
use crate::pool::{ChannelHandle, ChannelState, Connector};
use crate::registry::{RegistrationRecord, RegistryClient, RegistryError};
use crate::types::Endpoint;

/// 让后台关闭任务有机会执行
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    Register(String),
    Deregister(String),
    PassCheck(String),
}

#[derive(Default)]
pub struct FakeRegistry {
    endpoints: Mutex<HashMap<String, Vec<Endpoint>>>,
    query_failures: Mutex<VecDeque<RegistryError>>,
    register_failures: Mutex<VecDeque<RegistryError>>,
    pass_failures: Mutex<VecDeque<RegistryError>>,
    queries: AtomicUsize,
    calls: Mutex<Vec<RegistryCall>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_endpoints(&self, service: &str, endpoints: Vec<Endpoint>) {
        self.endpoints
            .lock()
            .unwrap()
            .insert(service.to_string(), endpoints);
    }

    pub fn fail_next_query(&self, err: RegistryError) {
        self.query_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_next_register(&self, err: RegistryError) {
        self.register_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_next_pass(&self, err: RegistryError) {
        self.pass_failures.lock().unwrap().push_back(err);
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RegistryCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn register_count(&self) -> usize {
        self.count(|c| matches!(c, RegistryCall::Register(_)))
    }

    pub fn deregister_count(&self) -> usize {
        self.count(|c| matches!(c, RegistryCall::Deregister(_)))
    }

    pub fn pass_count(&self, check_id: &str) -> usize {
        self.count(|c| matches!(c, RegistryCall::PassCheck(id) if id == check_id))
    }

    fn count(&self, pred: impl Fn(&RegistryCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn query_healthy(
        &self,
        service_name: &str,
        _registry_address: Option<&str>,
    ) -> std::result::Result<Vec<Endpoint>, RegistryError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.query_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self
            .endpoints
            .lock()
            .unwrap()
            .get(service_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn register(&self, record: &RegistrationRecord) -> std::result::Result<(), RegistryError> {
        self.calls
            .lock()
            .unwrap()
            .push(RegistryCall::Register(record.instance_id.clone()));
        match self.register_failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn deregister(&self, instance_id: &str) -> std::result::Result<(), RegistryError> {
        self.calls
            .lock()
            .unwrap()
            .push(RegistryCall::Deregister(instance_id.to_string()));
        Ok(())
    }

    async fn pass_check(&self, check_id: &str, _note: &str) -> std::result::Result<(), RegistryError> {
        self.calls
            .lock()
            .unwrap()
            .push(RegistryCall::PassCheck(check_id.to_string()));
        match self.pass_failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// 状态可由测试直接设置的连接
#[derive(Debug, Clone)]
pub struct FakeChannel {
    id: u64,
    state: Arc<AtomicU8>,
    shutdowns: Arc<AtomicUsize>,
}

impl FakeChannel {
    pub fn new(state: ChannelState) -> Self {
        Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(AtomicU8::new(state as u8)),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelHandle for FakeChannel {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn shutdown(&self) {
        self.set_state(ChannelState::Shutdown);
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeConnector {
    initial: Mutex<ChannelState>,
    refused: Mutex<HashSet<String>>,
    channels: Mutex<HashMap<String, FakeChannel>>,
    delays: Mutex<HashMap<String, Duration>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            initial: Mutex::new(ChannelState::Ready),
            refused: Mutex::new(HashSet::new()),
            channels: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn set_initial_state(&self, state: ChannelState) {
        *self.initial.lock().unwrap() = state;
    }

    /// 之后对该实例的连接请求直接失败
    pub fn refuse(&self, instance_id: &str) {
        self.refused.lock().unwrap().insert(instance_id.to_string());
    }

    /// 之后对该实例的连接请求先等待一段时间
    pub fn delay(&self, instance_id: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), delay);
    }

    /// 最近一次为该实例建立的连接
    pub fn channel_for(&self, instance_id: &str) -> Option<FakeChannel> {
        self.channels.lock().unwrap().get(instance_id).cloned()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Channel = FakeChannel;

    async fn connect(&self, endpoint: &Endpoint) -> Result<FakeChannel> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().unwrap().get(&endpoint.instance_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.refused.lock().unwrap().contains(&endpoint.instance_id) {
            return Err(GrpcExtError::connect(endpoint.authority(), "connection refused"));
        }
        let channel = FakeChannel::new(*self.initial.lock().unwrap());
        self.channels
            .lock()
            .unwrap()
            .insert(endpoint.instance_id.clone(), channel.clone());
        Ok(channel)
    }
}
