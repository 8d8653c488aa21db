//! 配置模块
//!
//! 本地实例（注册到 Consul）与远端依赖（直连或注册中心发现）的配置，
//! 从 TOML 加载，启动时校验；任何校验失败都是致命错误。

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::registry::RegistrationRecord;
use crate::types::Endpoint;

/// 未配置时使用的注册中心地址
pub const DEFAULT_REGISTRY_ADDRESS: &str = "http://127.0.0.1:8500";

/// 覆盖本地实例注册中心地址的环境变量
pub const REGISTRY_ADDRESS_ENV: &str = "GRPC_EXT_CONSUL_ADDRESS";

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid address `{value}`: {reason}")]
    InvalidAddress { value: String, reason: String },

    #[error("invalid tags {value:?}: {reason}")]
    InvalidTags { value: Vec<String>, reason: String },

    #[error("invalid connection string `{value}`: {reason}")]
    InvalidConnectionString { value: String, reason: String },

    #[error("remote service alias `{0}` is configured more than once")]
    DuplicateAlias(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// 本地实例，缺省时不做注册
    #[serde(default)]
    pub local: Option<LocalServiceConfig>,
    #[serde(default)]
    pub remotes: Vec<RemoteServiceConfig>,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// 解析并校验
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let (Some(local), Ok(address)) = (self.local.as_mut(), std::env::var(REGISTRY_ADDRESS_ENV)) {
            if !address.trim().is_empty() {
                local.registry_address = address.trim().to_string();
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(local) = &self.local {
            local.validate()?;
        }
        let mut seen = std::collections::HashSet::new();
        for remote in &self.remotes {
            remote.validate()?;
            if !seen.insert(remote.name.as_str()) {
                return Err(ConfigError::DuplicateAlias(remote.name.clone()));
            }
        }
        Ok(())
    }

    pub fn remote(&self, alias: &str) -> Option<&RemoteServiceConfig> {
        self.remotes.iter().find(|r| r.name == alias.trim())
    }

    /// 默认注册中心地址：本地实例配置优先
    pub fn registry_address(&self) -> String {
        self.local
            .as_ref()
            .map(|l| l.registry_address.clone())
            .unwrap_or_else(|| DEFAULT_REGISTRY_ADDRESS.to_string())
    }
}

/// 本地实例配置（注册到注册中心的那一份）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalServiceConfig {
    pub service_name: String,
    pub registry_address: String,
    /// `host:port`，注册时对外公布的地址
    pub service_address: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// 心跳间隔（秒）
    #[serde(default = "default_ttl_interval_secs")]
    pub ttl_interval_secs: u64,
    /// 注册中心侧 TTL 检查的有效期（秒）
    #[serde(default = "default_check_ttl_secs")]
    pub check_ttl_secs: u64,
    #[serde(default = "default_deregister_critical_after_secs")]
    pub deregister_critical_after_secs: u64,
}

fn default_ttl_interval_secs() -> u64 {
    15
}

fn default_check_ttl_secs() -> u64 {
    15
}

fn default_deregister_critical_after_secs() -> u64 {
    60
}

impl LocalServiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::MissingField("local.service_name"));
        }
        if self.registry_address.trim().is_empty() {
            return Err(ConfigError::MissingField("local.registry_address"));
        }
        parse_host_port(&self.service_address)?;
        validate_tags(&self.tags)
    }

    pub fn ttl_interval(&self) -> Duration {
        Duration::from_secs(self.ttl_interval_secs.max(1))
    }

    /// 构建本进程的注册记录；实例 ID 在此生成，整个进程生命周期内不变
    pub fn registration_record(&self) -> Result<RegistrationRecord, ConfigError> {
        self.validate()?;
        let (host, port) = parse_host_port(&self.service_address)?;
        Ok(RegistrationRecord::new(&self.service_name, host, port, self.tags.clone())
            .with_check_ttl(Duration::from_secs(self.check_ttl_secs.max(1)))
            .with_deregister_after(Duration::from_secs(self.deregister_critical_after_secs)))
    }
}

/// 标签必须带一个 `v-*` 版本标签，go-micro 依赖它解析实例元数据
pub fn validate_tags(tags: &[String]) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidTags {
        value: tags.to_vec(),
        reason: reason.to_string(),
    };
    if tags.is_empty() {
        return Err(invalid("at least one tag is required"));
    }
    if tags.iter().any(|t| t.trim().is_empty()) {
        return Err(invalid("tags must not be blank"));
    }
    if !tags.iter().any(|t| t.trim().starts_with("v-")) {
        return Err(invalid("a `v-*` version tag is required"));
    }
    Ok(())
}

/// 远端服务的发现方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// 从注册中心拉取健康节点
    #[default]
    Registry,
    /// 静态地址列表
    Direct,
}

/// 远端依赖配置
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteServiceConfig {
    /// 调用方使用的别名
    pub name: String,
    /// 注册中心中的服务名
    pub service_name: String,
    #[serde(default)]
    pub discovery: DiscoveryMode,
    /// 直连模式：逗号分隔的 `host:port` 列表
    #[serde(default)]
    pub service_address: Option<String>,
    /// 覆盖默认的注册中心地址
    #[serde(default)]
    pub registry_address: Option<String>,
    /// 刷新间隔（毫秒）
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

fn default_refresh_interval_ms() -> u64 {
    10_000
}

impl RemoteServiceConfig {
    pub fn registry(name: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_name: service_name.into(),
            discovery: DiscoveryMode::Registry,
            service_address: None,
            registry_address: None,
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }

    pub fn direct(
        name: impl Into<String>,
        service_name: impl Into<String>,
        service_address: impl Into<String>,
    ) -> Self {
        Self {
            discovery: DiscoveryMode::Direct,
            service_address: Some(service_address.into()),
            ..Self::registry(name, service_name)
        }
    }

    pub fn with_registry_address(mut self, address: impl Into<String>) -> Self {
        self.registry_address = Some(address.into());
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField("remote.name"));
        }
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::MissingField("remote.service_name"));
        }
        if self.discovery == DiscoveryMode::Direct {
            self.direct_endpoints()?;
        }
        Ok(())
    }

    /// 解析直连地址列表，空白项会被忽略
    pub fn direct_endpoints(&self) -> Result<Vec<Endpoint>, ConfigError> {
        let list = self
            .service_address
            .as_deref()
            .ok_or(ConfigError::MissingField("remote.service_address"))?;
        let endpoints = list
            .split(',')
            .filter(|item| !item.trim().is_empty())
            .map(|item| {
                parse_host_port(item).map(|(host, port)| Endpoint::direct(&self.service_name, host, port))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if endpoints.is_empty() {
            return Err(ConfigError::InvalidAddress {
                value: list.to_string(),
                reason: "address list is empty".to_string(),
            });
        }
        Ok(endpoints)
    }
}

/// 解析 `Name=..;ServiceName=..;ConsulIntegration=true;...` 形式的连接串
impl FromStr for RemoteServiceConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidConnectionString {
            value: s.to_string(),
            reason,
        };

        let mut name = None;
        let mut service_name = None;
        let mut integration = None;
        let mut service_address = None;
        let mut registry_address = None;
        let mut refresh_interval_ms = default_refresh_interval_ms();

        for pair in s.split(';').filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid(format!("`{}` is not a key=value pair", pair.trim())))?;
            let value = value.trim().to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "name" => name = Some(value),
                "servicename" => service_name = Some(value),
                "serviceaddress" => service_address = Some(value),
                "consuladdress" => registry_address = Some(value),
                "consulintegration" => {
                    integration = Some(
                        value
                            .to_ascii_lowercase()
                            .parse::<bool>()
                            .map_err(|_| invalid(format!("ConsulIntegration=`{}`", value)))?,
                    )
                }
                "freshinterval" => {
                    refresh_interval_ms = value
                        .parse()
                        .map_err(|_| invalid(format!("FreshInterval=`{}`", value)))?
                }
                _ => {}
            }
        }

        let service_name = service_name.ok_or(ConfigError::MissingField("ServiceName"))?;
        // 未显式声明时：给了直连地址就直连
        let discovery = match integration {
            Some(true) => DiscoveryMode::Registry,
            Some(false) => DiscoveryMode::Direct,
            None if service_address.is_some() => DiscoveryMode::Direct,
            None => DiscoveryMode::Registry,
        };

        let config = RemoteServiceConfig {
            name: name.unwrap_or_else(|| service_name.clone()),
            service_name,
            discovery,
            service_address,
            registry_address,
            refresh_interval_ms,
        };
        config.validate()?;
        Ok(config)
    }
}

/// 连接池相关的超时与探活设置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolSettings {
    /// 选择锁的最长等待时间
    pub fetch_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// 每次注册中心调用的超时
    pub registry_timeout_ms: u64,
    pub health_probe_interval_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 100,
            connect_timeout_ms: 3_000,
            request_timeout_ms: 30_000,
            registry_timeout_ms: 5_000,
            health_probe_interval_ms: 10_000,
        }
    }
}

impl PoolSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_timeout_ms)
    }

    pub fn health_probe_interval(&self) -> Duration {
        Duration::from_millis(self.health_probe_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` 指令，`RUST_LOG` 优先
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// 解析 `host:port`
pub fn parse_host_port(value: &str) -> Result<(String, u16), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidAddress {
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let trimmed = value.trim();
    let (host, port) = trimmed
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid("host is empty"));
    }
    let port: u16 = port
        .trim()
        .parse()
        .map_err(|_| invalid("port is not a number in 1..=65535"))?;
    if port == 0 {
        return Err(invalid("port must not be 0"));
    }
    Ok((host.to_string(), port))
}
