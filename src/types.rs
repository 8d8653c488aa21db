use serde::{Deserialize, Serialize};
use std::fmt;

/// 远端服务的一个可寻址实例
///
/// 身份由注册中心分配的 `instance_id` 决定，而不是 `address:port`：
/// 同一个地址可能先后被不同的实例复用。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub service_name: String,
    pub address: String,
    pub port: u16,
    pub instance_id: String,
}

impl Endpoint {
    pub fn new(
        service_name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            address: address.into(),
            port,
            instance_id: instance_id.into(),
        }
    }

    /// 直连模式下的节点，实例 ID 由地址派生
    pub fn direct(service_name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        let mut endpoint = Self::new(service_name, address, port, String::new());
        endpoint.instance_id = format!("direct:{}", endpoint.authority());
        endpoint
    }

    /// `host:port`，IPv6 地址加方括号
    pub fn authority(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// 转换为 gRPC URI
    pub fn to_grpc_uri(&self) -> String {
        format!("http://{}", self.authority())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.service_name, self.instance_id, self.authority())
    }
}
