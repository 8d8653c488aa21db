//! 集成测试共用的内存注册中心与可控连接

#![allow(dead_code)]

use async_trait::async_trait;
use flare_grpc_ext::{
    ChannelHandle, ChannelState, Connector, Endpoint, RegistrationRecord, RegistryClient,
    RegistryError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn endpoint(service: &str, id: &str, port: u16) -> Endpoint {
    Endpoint::new(service, "127.0.0.1", port, id)
}

pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
pub struct MemoryRegistry {
    endpoints: Mutex<HashMap<String, Vec<Endpoint>>>,
    pass_failures: Mutex<VecDeque<RegistryError>>,
    query_delay: Mutex<Option<Duration>>,
    queries: AtomicUsize,
    registered: Mutex<Vec<String>>,
    deregistered: Mutex<Vec<String>>,
    passes: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_endpoints(&self, service: &str, endpoints: Vec<Endpoint>) {
        self.endpoints
            .lock()
            .unwrap()
            .insert(service.to_string(), endpoints);
    }

    pub fn set_query_delay(&self, delay: Duration) {
        *self.query_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_next_pass(&self, err: RegistryError) {
        self.pass_failures.lock().unwrap().push_back(err);
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn pass_count(&self) -> usize {
        self.passes.load(Ordering::SeqCst)
    }

    pub fn registered(&self) -> Vec<String> {
        self.registered.lock().unwrap().clone()
    }

    pub fn deregistered(&self) -> Vec<String> {
        self.deregistered.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    async fn query_healthy(
        &self,
        service_name: &str,
        _registry_address: Option<&str>,
    ) -> Result<Vec<Endpoint>, RegistryError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let delay = *self.query_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .endpoints
            .lock()
            .unwrap()
            .get(service_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn register(&self, record: &RegistrationRecord) -> Result<(), RegistryError> {
        self.registered
            .lock()
            .unwrap()
            .push(record.instance_id.clone());
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> Result<(), RegistryError> {
        self.deregistered
            .lock()
            .unwrap()
            .push(instance_id.to_string());
        Ok(())
    }

    async fn pass_check(&self, _check_id: &str, _note: &str) -> Result<(), RegistryError> {
        self.passes.fetch_add(1, Ordering::SeqCst);
        match self.pass_failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct StubChannel {
    pub id: u64,
    pub instance_id: String,
    state: Arc<AtomicU8>,
}

impl StubChannel {
    pub fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelHandle for StubChannel {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn shutdown(&self) {
        self.set_state(ChannelState::Shutdown);
    }
}

/// 记录每个实例最近一次建立的连接
#[derive(Default)]
pub struct StubConnector {
    channels: Mutex<HashMap<String, StubChannel>>,
}

impl StubConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn channel_for(&self, instance_id: &str) -> StubChannel {
        self.channels
            .lock()
            .unwrap()
            .get(instance_id)
            .cloned()
            .unwrap_or_else(|| panic!("no channel opened for {instance_id}"))
    }
}

#[async_trait]
impl Connector for StubConnector {
    type Channel = StubChannel;

    async fn connect(&self, endpoint: &Endpoint) -> flare_grpc_ext::Result<StubChannel> {
        let channel = StubChannel {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            instance_id: endpoint.instance_id.clone(),
            state: Arc::new(AtomicU8::new(ChannelState::Ready as u8)),
        };
        self.channels
            .lock()
            .unwrap()
            .insert(endpoint.instance_id.clone(), channel.clone());
        Ok(channel)
    }
}
