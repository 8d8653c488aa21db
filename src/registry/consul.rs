//! Consul 注册中心客户端
//!
//! 只用到四个接口：
//! - `GET  /v1/health/service/:name?passing=true`
//! - `PUT  /v1/agent/service/register`
//! - `PUT  /v1/agent/check/pass/:check_id`
//! - `PUT  /v1/agent/service/deregister/:id`

use async_trait::async_trait;
use reqwest::{Client as HttpClient, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{RegistrationRecord, RegistryClient, RegistryError};
use crate::types::Endpoint;

/// Consul 在 TTL 检查丢失时返回的错误文本（旧版本返回 500 + 该文本）
const MISSING_TTL_MARKER: &str = "does not have associated TTL";
/// 新版本对未知检查返回 404 + 该文本
const UNKNOWN_CHECK_MARKER: &str = "unknown check";

/// Consul 注册中心客户端
pub struct ConsulRegistryClient {
    http_client: HttpClient,
    consul_url: String,
}

#[allow(non_snake_case)]
#[derive(Serialize)]
struct ConsulServiceRegistration<'a> {
    ID: &'a str,
    Name: &'a str,
    Tags: &'a [String],
    EnableTagOverride: bool,
    Address: &'a str,
    Port: u16,
    Check: ConsulTtlCheck<'a>,
}

#[allow(non_snake_case)]
#[derive(Serialize)]
struct ConsulTtlCheck<'a> {
    CheckID: &'a str,
    Name: &'a str,
    TTL: String,
    Status: &'a str,
    DeregisterCriticalServiceAfter: String,
}

#[allow(non_snake_case)]
#[derive(Deserialize)]
struct ConsulHealthEntry {
    #[serde(default)]
    Node: Option<ConsulNode>,
    Service: ConsulServiceEntry,
}

#[allow(non_snake_case)]
#[derive(Deserialize)]
struct ConsulNode {
    #[serde(default)]
    Address: String,
}

#[allow(non_snake_case)]
#[derive(Deserialize)]
struct ConsulServiceEntry {
    ID: String,
    Service: String,
    #[serde(default)]
    Address: String,
    Port: u16,
}

impl ConsulRegistryClient {
    /// 创建客户端，`timeout` 约束每一次 HTTP 调用
    pub fn new(consul_url: impl AsRef<str>, timeout: Duration) -> Result<Self, RegistryError> {
        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Transport(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            http_client,
            consul_url: normalize_url(consul_url.as_ref()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.consul_url
    }

    /// 拼接接口地址，路径参数逐段做百分号编码
    fn url(&self, registry_address: Option<&str>, segments: &[&str]) -> Result<Url, RegistryError> {
        let base = registry_address
            .filter(|address| !address.trim().is_empty())
            .map(normalize_url)
            .unwrap_or_else(|| self.consul_url.clone());
        let invalid = |reason: &str| {
            RegistryError::Transport(format!("invalid registry address `{}`: {}", base, reason))
        };

        let mut url = Url::parse(&base).map_err(|e| invalid(&e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("cannot be a base url"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// 非 2xx 响应转换为错误；对检查接口识别"检查已丢失"
    async fn check_status(
        resp: reqwest::Response,
        check_id: Option<&str>,
    ) -> Result<reqwest::Response, RegistryError> {
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();

        if let Some(check_id) = check_id {
            if is_missing_check(status, &body) {
                return Err(RegistryError::CheckNotFound {
                    check_id: check_id.to_string(),
                });
            }
        }

        Err(RegistryError::Rejected {
            status,
            message: body.trim().to_string(),
        })
    }
}

/// 优先使用状态码判断，文本匹配只作为旧版本的兜底
fn is_missing_check(status: u16, body: &str) -> bool {
    status == 404
        || body.contains(MISSING_TTL_MARKER)
        || body.to_ascii_lowercase().contains(UNKNOWN_CHECK_MARKER)
}

fn normalize_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

fn transport(e: reqwest::Error) -> RegistryError {
    RegistryError::Transport(e.to_string())
}

#[async_trait]
impl RegistryClient for ConsulRegistryClient {
    async fn query_healthy(
        &self,
        service_name: &str,
        registry_address: Option<&str>,
    ) -> Result<Vec<Endpoint>, RegistryError> {
        let url = self.url(registry_address, &["v1", "health", "service", service_name])?;
        let resp = self
            .http_client
            .get(url)
            .query(&[("passing", "true")])
            .send()
            .await
            .map_err(transport)?;
        let resp = Self::check_status(resp, None).await?;

        let entries: Vec<ConsulHealthEntry> = resp
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;

        let endpoints = entries
            .into_iter()
            .map(|entry| {
                let service = entry.Service;
                // 服务未声明地址时，Consul 约定使用节点地址
                let address = if service.Address.is_empty() {
                    entry.Node.map(|n| n.Address).unwrap_or_default()
                } else {
                    service.Address
                };
                Endpoint::new(service.Service, address, service.Port, service.ID)
            })
            .collect::<Vec<_>>();

        debug!(
            service = %service_name,
            count = endpoints.len(),
            "Fetched healthy instances from Consul"
        );
        Ok(endpoints)
    }

    async fn register(&self, record: &RegistrationRecord) -> Result<(), RegistryError> {
        let payload = ConsulServiceRegistration {
            ID: &record.instance_id,
            Name: &record.service_name,
            Tags: &record.tags,
            EnableTagOverride: true,
            Address: &record.address,
            Port: record.port,
            Check: ConsulTtlCheck {
                CheckID: &record.ttl_check_id,
                Name: "ttlcheck",
                TTL: format!("{}s", record.check_ttl.as_secs().max(1)),
                Status: "passing",
                DeregisterCriticalServiceAfter: format!(
                    "{}s",
                    record.deregister_critical_after.as_secs()
                ),
            },
        };

        let url = self.url(None, &["v1", "agent", "service", "register"])?;
        let resp = self
            .http_client
            .put(url)
            .json(&payload)
            .send()
            .await
            .map_err(transport)?;
        Self::check_status(resp, None).await?;
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> Result<(), RegistryError> {
        let url = self.url(None, &["v1", "agent", "service", "deregister", instance_id])?;
        let resp = self.http_client.put(url).send().await.map_err(transport)?;
        Self::check_status(resp, None).await?;
        Ok(())
    }

    async fn pass_check(&self, check_id: &str, note: &str) -> Result<(), RegistryError> {
        let url = self.url(None, &["v1", "agent", "check", "pass", check_id])?;
        let resp = self
            .http_client
            .put(url)
            .query(&[("note", note)])
            .send()
            .await
            .map_err(transport)?;
        Self::check_status(resp, Some(check_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ConsulRegistryClient {
        ConsulRegistryClient::new(server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn query_healthy_reads_passing_instances() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/srv.users"))
            .and(query_param("passing", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "Node": { "Address": "192.168.1.10" },
                    "Service": { "ID": "users-a", "Service": "srv.users", "Address": "10.0.0.1", "Port": 5000 }
                },
                {
                    "Node": { "Address": "192.168.1.11" },
                    "Service": { "ID": "users-b", "Service": "srv.users", "Address": "", "Port": 5001 }
                }
            ])))
            .mount(&server)
            .await;

        let endpoints = client(&server).query_healthy("srv.users", None).await.unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0], Endpoint::new("srv.users", "10.0.0.1", 5000, "users-a"));
        assert_eq!(endpoints[1].address, "192.168.1.11");
    }

    #[tokio::test]
    async fn query_honours_registry_address_override() {
        let default_server = MockServer::start().await;
        let override_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/srv.sms"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&override_server)
            .await;

        let endpoints = client(&default_server)
            .query_healthy("srv.sms", Some(&format!("{}/", override_server.uri())))
            .await
            .unwrap();
        assert!(endpoints.is_empty());
    }

    #[tokio::test]
    async fn register_sends_ttl_check_definition() {
        let server = MockServer::start().await;
        let record = RegistrationRecord::new("greeter", "10.0.0.5", 50051, vec!["v-1".into()]);
        Mock::given(method("PUT"))
            .and(path("/v1/agent/service/register"))
            .and(body_partial_json(serde_json::json!({
                "ID": record.instance_id,
                "Name": "greeter",
                "Tags": ["v-1"],
                "Port": 50051,
                "Check": {
                    "CheckID": record.ttl_check_id,
                    "TTL": "15s",
                    "Status": "passing",
                    "DeregisterCriticalServiceAfter": "60s"
                }
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).register(&record).await.unwrap();
    }

    #[tokio::test]
    async fn lost_check_is_reported_as_check_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/check/pass/service:legacy"))
            .respond_with(ResponseTemplate::new(500).set_body_string(
                "CheckID \"service:legacy\" does not have associated TTL",
            ))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/check/pass/service:modern"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Unknown check ID \"service:modern\""))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/check/pass/service:broken"))
            .respond_with(ResponseTemplate::new(500).set_body_string("rpc error: no leader"))
            .mount(&server)
            .await;

        let client = client(&server);
        assert_eq!(
            client.pass_check("service:legacy", "timer").await,
            Err(RegistryError::CheckNotFound {
                check_id: "service:legacy".into()
            })
        );
        assert!(matches!(
            client.pass_check("service:modern", "timer").await,
            Err(RegistryError::CheckNotFound { .. })
        ));
        assert_eq!(
            client.pass_check("service:broken", "timer").await,
            Err(RegistryError::Rejected {
                status: 500,
                message: "rpc error: no leader".into()
            })
        );
    }

    #[tokio::test]
    async fn path_parameters_are_percent_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/service/deregister/greeter%2F1%3Fa"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/srv%20users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        client.deregister("greeter/1?a").await.unwrap();
        assert!(client.query_healthy("srv users", None).await.unwrap().is_empty());
    }

    #[test]
    fn registry_address_with_a_path_prefix_is_kept() {
        let client = ConsulRegistryClient::new("http://consul:8500/proxy/", Duration::from_secs(1)).unwrap();
        let url = client.url(None, &["v1", "agent", "check", "pass", "service:a b"]).unwrap();
        assert_eq!(url.as_str(), "http://consul:8500/proxy/v1/agent/check/pass/service:a%20b");
    }

    #[tokio::test]
    async fn unreachable_registry_is_a_transport_error() {
        let client = ConsulRegistryClient::new("127.0.0.1:1", Duration::from_millis(500)).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:1");
        let err = client.deregister("greeter-1").await.unwrap_err();
        assert!(err.is_transport(), "unexpected error: {err:?}");
    }
}
