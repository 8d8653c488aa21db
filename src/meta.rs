//! 服务元数据
//!
//! 处理器显式声明自己暴露的方法，供诊断接口或日志输出一份快照。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    #[default]
    Unary,
    ServerStreaming,
    ClientStreaming,
    DuplexStreaming,
}

/// 一个 RPC 方法的描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub package: Option<String>,
    pub service: String,
    pub method: String,
    pub kind: MethodKind,
    pub request_type: String,
    pub response_type: String,
}

impl MethodDescriptor {
    /// 以请求、响应的 Rust 类型名构造描述
    pub fn of<Req, Resp>(service: impl Into<String>, method: impl Into<String>, kind: MethodKind) -> Self {
        Self {
            package: None,
            service: service.into(),
            method: method.into(),
            kind,
            request_type: std::any::type_name::<Req>().to_string(),
            response_type: std::any::type_name::<Resp>().to_string(),
        }
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        let package = package.into();
        self.package = (!package.trim().is_empty()).then_some(package);
        self
    }

    /// `pkg.Service`，没有包名时就是 `Service`
    pub fn qualified_service(&self) -> String {
        match &self.package {
            Some(pkg) => format!("{}.{}", pkg, self.service),
            None => self.service.clone(),
        }
    }

    /// gRPC 路径：`/pkg.Service/Method`
    pub fn full_name(&self) -> String {
        format!("/{}/{}", self.qualified_service(), self.method)
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.full_name(), self.kind)
    }
}

/// 本实例的元数据快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMeta {
    pub service_name: String,
    pub address: Option<String>,
    pub started_at: DateTime<Utc>,
    methods: Vec<MethodDescriptor>,
}

impl ServiceMeta {
    pub fn new(service_name: impl Into<String>, address: Option<String>) -> Self {
        Self {
            service_name: service_name.into(),
            address,
            started_at: Utc::now(),
            methods: Vec::new(),
        }
    }

    /// 登记方法；同一路径重复登记时返回 `false`
    pub fn register(&mut self, method: MethodDescriptor) -> bool {
        let full_name = method.full_name();
        if self.methods.iter().any(|m| m.full_name() == full_name) {
            return false;
        }
        self.methods.push(method);
        true
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    pub fn find(&self, full_name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.full_name() == full_name)
    }

    /// 供诊断接口输出的 JSON 快照
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
