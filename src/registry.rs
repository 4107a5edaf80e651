//! Service registry client.
//!
//! Backends register themselves with Consul under their capability class;
//! the dispatcher only ever asks [`ServiceRegistry::resolve`] for a live
//! instance. Liveness is tracked by the registry through the HTTP health
//! check supplied at registration.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::capability::CapabilityClass;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no healthy instance registered for capability '{0}'")]
    NotFound(CapabilityClass),

    #[error("service registry unavailable: {0}")]
    Unavailable(String),
}

/// A registered, addressable backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
}

impl ServiceInstance {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn base_url(&self, scheme: &str) -> String {
        format!("{}://{}:{}", scheme, self.address, self.port)
    }
}

/// Health check the registry polls to keep an instance alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub url: String,
    pub interval: Duration,
    pub tls_skip_verify: bool,
}

/// Everything a backend announces about itself at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub instance: ServiceInstance,
    pub check: HealthCheck,
}

impl Registration {
    /// Builds the registration for a backend of `class` reachable at
    /// `address:port`, health-checked over `scheme`.
    pub fn for_backend(
        class: CapabilityClass,
        id: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        scheme: &str,
        interval: Duration,
    ) -> Self {
        let address = address.into();
        Self {
            check: HealthCheck {
                url: format!("{}://{}:{}/health", scheme, address, port),
                interval,
                tls_skip_verify: true,
            },
            instance: ServiceInstance {
                id: id.into(),
                name: class.service_name().to_string(),
                address,
                port,
                tags: class.registry_tags(),
            },
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// First healthy instance advertising `class`, in registry order.
    async fn resolve(&self, class: CapabilityClass) -> Result<ServiceInstance, RegistryError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    #[serde(default)]
    node: NodeEntry,
    service: ServiceEntry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeEntry {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl From<HealthEntry> for ServiceInstance {
    fn from(entry: HealthEntry) -> Self {
        let address = if entry.service.address.is_empty() {
            entry.node.address
        } else {
            entry.service.address
        };
        ServiceInstance {
            id: entry.service.id,
            name: entry.service.service,
            address,
            port: entry.service.port,
            tags: entry.service.tags.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterBody<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
    check: CheckBody<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckBody<'a> {
    #[serde(rename = "HTTP")]
    http: &'a str,
    interval: String,
    #[serde(rename = "TLSSkipVerify")]
    tls_skip_verify: bool,
    deregister_critical_service_after: &'static str,
}

/// Consul agent HTTP API client.
#[derive(Debug, Clone)]
pub struct ConsulRegistry {
    client: Client,
    base_url: String,
}

impl ConsulRegistry {
    /// `addr` is either `host:port` (as in `CONSUL_HTTP_ADDR`) or a full URL.
    pub fn new(addr: &str, timeout: Duration) -> Result<Self, RegistryError> {
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr.trim_end_matches('/'))
        };
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn register(&self, registration: &Registration) -> Result<(), RegistryError> {
        let instance = &registration.instance;
        let body = RegisterBody {
            id: &instance.id,
            name: &instance.name,
            address: &instance.address,
            port: instance.port,
            tags: &instance.tags,
            check: CheckBody {
                http: &registration.check.url,
                interval: format!("{}s", registration.check.interval.as_secs().max(1)),
                tls_skip_verify: registration.check.tls_skip_verify,
                deregister_critical_service_after: "1m",
            },
        };

        let url = format!("{}/v1/agent/service/register", self.base_url);
        let response = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RegistryError::Unavailable(format!(
                "register returned {}",
                response.status()
            )));
        }

        info!(
            service = %instance.name,
            id = %instance.id,
            address = %instance.address,
            port = instance.port,
            "Registered service"
        );
        Ok(())
    }

    pub async fn deregister(&self, service_id: &str) -> Result<(), RegistryError> {
        let url = format!("{}/v1/agent/service/deregister/{}", self.base_url, service_id);
        let response = self
            .client
            .put(&url)
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RegistryError::Unavailable(format!(
                "deregister returned {}",
                response.status()
            )));
        }
        info!(id = service_id, "Deregistered service");
        Ok(())
    }
}

#[async_trait]
impl ServiceRegistry for ConsulRegistry {
    async fn resolve(&self, class: CapabilityClass) -> Result<ServiceInstance, RegistryError> {
        let url = format!("{}/v1/health/service/{}", self.base_url, class.service_name());
        let response = self
            .client
            .get(&url)
            .query(&[("passing", "true")])
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RegistryError::Unavailable(format!(
                "health query returned {}",
                response.status()
            )));
        }
        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|e| RegistryError::Unavailable(format!("invalid health response: {}", e)))?;

        let instance = entries
            .into_iter()
            .map(ServiceInstance::from)
            .find(|instance| instance.has_tag(class.tag()))
            .ok_or(RegistryError::NotFound(class))?;

        debug!(
            capability = %class,
            id = %instance.id,
            address = %instance.address,
            port = instance.port,
            "Resolved backend"
        );
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::routing::{get, put};
    use axum::{Json, Router};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeConsul {
        services: Arc<Mutex<Vec<Value>>>,
        registered: Arc<Mutex<Vec<Value>>>,
        deregistered: Arc<Mutex<Vec<String>>>,
    }

    async fn health(State(consul): State<FakeConsul>, Path(name): Path<String>) -> Json<Value> {
        let services = consul.services.lock().unwrap();
        let matching: Vec<Value> = services
            .iter()
            .filter(|s| s["Service"]["Service"] == name.as_str())
            .cloned()
            .collect();
        Json(Value::Array(matching))
    }

    async fn register(State(consul): State<FakeConsul>, Json(body): Json<Value>) {
        consul.registered.lock().unwrap().push(body);
    }

    async fn deregister(State(consul): State<FakeConsul>, Path(id): Path<String>) {
        consul.deregistered.lock().unwrap().push(id);
    }

    async fn spawn_consul(consul: FakeConsul) -> String {
        let app = Router::new()
            .route("/v1/health/service/{name}", get(health))
            .route("/v1/agent/service/register", put(register))
            .route("/v1/agent/service/deregister/{id}", put(deregister))
            .with_state(consul);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    fn entry(id: &str, service: &str, address: &str, port: u16, tags: &[&str]) -> Value {
        json!({
            "Node": { "Address": "10.0.0.9" },
            "Service": {
                "ID": id,
                "Service": service,
                "Address": address,
                "Port": port,
                "Tags": tags,
            }
        })
    }

    #[tokio::test]
    async fn test_resolve_returns_first_tagged_instance() {
        let consul = FakeConsul::default();
        consul.services.lock().unwrap().extend([
            entry("doc-untagged", "convert-document", "10.0.0.1", 5001, &["pdf"]),
            entry("doc-1", "convert-document", "10.0.0.2", 5001, &["document", "docx"]),
            entry("doc-2", "convert-document", "10.0.0.3", 5001, &["document", "docx"]),
        ]);
        let addr = spawn_consul(consul).await;

        let registry = ConsulRegistry::new(&addr, Duration::from_secs(2)).unwrap();
        let instance = registry.resolve(CapabilityClass::Document).await.unwrap();

        assert_eq!(instance.id, "doc-1");
        assert_eq!(instance.address, "10.0.0.2");
        assert_eq!(instance.port, 5001);
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_node_address() {
        let consul = FakeConsul::default();
        consul
            .services
            .lock()
            .unwrap()
            .push(entry("img-1", "convert-image", "", 5002, &["image"]));
        let addr = spawn_consul(consul).await;

        let registry = ConsulRegistry::new(&addr, Duration::from_secs(2)).unwrap();
        let instance = registry.resolve(CapabilityClass::Image).await.unwrap();
        assert_eq!(instance.address, "10.0.0.9");
    }

    #[tokio::test]
    async fn test_resolve_not_found_when_no_match() {
        let addr = spawn_consul(FakeConsul::default()).await;
        let registry = ConsulRegistry::new(&addr, Duration::from_secs(2)).unwrap();

        let err = registry.resolve(CapabilityClass::Image).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(CapabilityClass::Image)));
    }

    #[tokio::test]
    async fn test_resolve_unavailable_when_unreachable() {
        // bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let registry = ConsulRegistry::new(&addr, Duration::from_secs(2)).unwrap();
        let err = registry.resolve(CapabilityClass::Document).await.unwrap_err();
        assert!(matches!(err, RegistryError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let consul = FakeConsul::default();
        let addr = spawn_consul(consul.clone()).await;
        let registry = ConsulRegistry::new(&format!("http://{}/", addr), Duration::from_secs(2))
            .unwrap();

        let registration = Registration::for_backend(
            CapabilityClass::Image,
            "convert-image-1",
            "service-image",
            5002,
            "http",
            Duration::from_secs(10),
        );
        registry.register(&registration).await.unwrap();
        registry.deregister("convert-image-1").await.unwrap();

        let registered = consul.registered.lock().unwrap();
        assert_eq!(registered.len(), 1);
        let body = &registered[0];
        assert_eq!(body["Name"], "convert-image");
        assert_eq!(body["ID"], "convert-image-1");
        assert_eq!(body["Port"], 5002);
        assert_eq!(body["Tags"], json!(["image", "jpg", "png", "gif"]));
        assert_eq!(body["Check"]["HTTP"], "http://service-image:5002/health");
        assert_eq!(body["Check"]["Interval"], "10s");
        assert_eq!(
            *consul.deregistered.lock().unwrap(),
            vec!["convert-image-1".to_string()]
        );
    }
}
