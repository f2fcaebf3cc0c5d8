//! Consul HTTP API v1 client.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::model::{
    CatalogSnapshot, Endpoint, HealthStatus, KvEntry, ServiceNode, ServiceRegistration,
    normalize_key, service_instance_id,
};
use crate::store::{BackingStore, KvStore, ServiceCatalog, StoreConnector};

const HEADER_INDEX: &str = "X-Consul-Index";
const HEADER_KNOWN_LEADER: &str = "X-Consul-KnownLeader";
const HEADER_LAST_CONTACT: &str = "X-Consul-LastContact";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvPair {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    modify_index: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    name: String,
    #[serde(rename = "TTL")]
    ttl: String,
    status: &'static str,
    deregister_critical_service_after: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: String,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
    check: AgentCheck,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    #[serde(default)]
    node: Option<HealthNode>,
    service: HealthService,
    #[serde(default)]
    checks: Vec<HealthCheck>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    address: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthCheck {
    status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckUpdate {
    status: &'static str,
    output: String,
}

/// Keeps one TTL check alive at the last status reported for it. The task
/// stops when the heartbeat is dropped.
#[derive(Debug)]
struct Heartbeat {
    status: Arc<Mutex<HealthStatus>>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    fn spawn(http: reqwest::Client, url: String, status: HealthStatus, every: Duration) -> Self {
        let status = Arc::new(Mutex::new(status));
        let task = tokio::spawn(beat(http, url, Arc::clone(&status), every));
        Self { status, task }
    }

    fn set(&self, status: HealthStatus) {
        *self.status.lock() = status;
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn beat(
    http: reqwest::Client,
    url: String,
    status: Arc<Mutex<HealthStatus>>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let current = *status.lock();
        let body = CheckUpdate {
            status: current.as_str(),
            output: format!("{current} (heartbeat)"),
        };
        match http
            .put(&url)
            .json(&body)
            .send()
            .await
            .and_then(Response::error_for_status)
        {
            Ok(_) => tracing::trace!(%url, status = %current, "refreshed TTL check"),
            // The next tick retries; the check only lapses after a full TTL.
            Err(e) => tracing::debug!(%url, error = %e, "TTL heartbeat failed"),
        }
    }
}

fn go_duration(d: Duration) -> String {
    format!("{}ms", d.as_millis())
}

fn check_id(instance_id: &str) -> String {
    format!("service:{instance_id}")
}

fn encode_path(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn validate_key(key: &str) -> Result<&str, ClientError> {
    let key = normalize_key(key);
    if key.is_empty() {
        return Err(ClientError::InvalidKey {
            key: key.to_owned(),
            reason: "key must not be empty".to_owned(),
        });
    }
    Ok(key)
}

fn validate_service(name: &str) -> Result<(), ClientError> {
    if name.is_empty() || name.contains('/') {
        return Err(ClientError::InvalidService {
            name: name.to_owned(),
            reason: "service names must be non-empty and must not contain '/'".to_owned(),
        });
    }
    Ok(())
}

/// Consul agent client.
///
/// Cheap to clone; clones share the underlying connection pool and the TTL
/// heartbeats of the endpoints registered through them. Heartbeats stop on
/// deregistration or when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    endpoint: Endpoint,
    base_url: String,
    config: ClientConfig,
    heartbeats: Arc<DashMap<String, Heartbeat>>,
}

impl ConsulClient {
    /// # Errors
    /// Returns [`ClientError::Connect`] if the HTTP client cannot be built.
    pub fn new(endpoint: Endpoint, config: ClientConfig) -> Result<Self, ClientError> {
        let base_url = endpoint.http_url();
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ClientError::Connect {
                url: base_url.clone(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            endpoint,
            base_url,
            config,
            heartbeats: Arc::new(DashMap::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn check_update_url(&self, instance_id: &str) -> String {
        self.url(&format!("/v1/agent/check/update/{}", check_id(instance_id)))
    }

    /// Starts refreshing `instance_id`'s TTL check, or re-points a running
    /// heartbeat at `status`.
    fn keep_alive(&self, instance_id: &str, status: HealthStatus) {
        if let Some(heartbeat) = self.heartbeats.get(instance_id) {
            heartbeat.set(status);
            return;
        }
        let heartbeat = Heartbeat::spawn(
            self.http.clone(),
            self.check_update_url(instance_id),
            status,
            self.config.heartbeat_interval(),
        );
        self.heartbeats.insert(instance_id.to_owned(), heartbeat);
    }

    /// Number of endpoints whose TTL check this client keeps refreshed.
    #[must_use]
    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.len()
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        customize: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<Response, ClientError> {
        let request = customize(self.http.request(method, url));
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout {
                    url: url.to_owned(),
                    timeout: self.config.request_timeout,
                }
            } else {
                ClientError::Connect {
                    url: url.to_owned(),
                    message: e.to_string(),
                }
            }
        })
    }

    /// Turns non-success statuses into [`ClientError::Status`]. 404 passes
    /// through when `allow_not_found` is set.
    async fn check_status(
        method: &Method,
        url: &str,
        response: Response,
        allow_not_found: bool,
    ) -> Result<Response, ClientError> {
        let status = response.status();
        if status.is_success() || (allow_not_found && status == StatusCode::NOT_FOUND) {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Status {
            method: method.to_string(),
            url: url.to_owned(),
            status: status.as_u16(),
            body: body.trim().to_owned(),
        })
    }

    async fn json<T: serde::de::DeserializeOwned>(
        url: &str,
        response: Response,
    ) -> Result<T, ClientError> {
        response
            .json::<T>()
            .await
            .map_err(|e| ClientError::InvalidResponse {
                url: url.to_owned(),
                message: e.to_string(),
            })
    }

    /// Ids of the agent's local instances of `name`.
    async fn agent_instance_ids(&self, name: &str) -> Result<BTreeSet<String>, ClientError> {
        let url = self.url("/v1/agent/services");
        let filter = format!("Service == \"{name}\"");
        let response = self
            .send(Method::GET, &url, |r| r.query(&[("filter", filter.as_str())]))
            .await?;
        let response = Self::check_status(&Method::GET, &url, response, false).await?;
        let services: HashMap<String, AgentService> = Self::json(&url, response).await?;
        Ok(services.into_values().map(|s| s.id).collect())
    }

    async fn deregister_instance(&self, instance_id: &str) -> Result<(), ClientError> {
        self.heartbeats.remove(instance_id);
        let url = self.url(&format!("/v1/agent/service/deregister/{instance_id}"));
        let response = self.send(Method::PUT, &url, |r| r).await?;
        // Already gone is fine.
        Self::check_status(&Method::PUT, &url, response, true).await?;
        Ok(())
    }
}

fn header_u64(response: &Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[async_trait]
impl KvStore for ConsulClient {
    async fn read_key(&self, key: &str) -> Result<Option<KvEntry>, ClientError> {
        let key = validate_key(key)?;
        let url = self.url(&format!("/v1/kv/{}", encode_path(key)));
        let response = self.send(Method::GET, &url, |r| r).await?;
        let response = Self::check_status(&Method::GET, &url, response, true).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let pairs: Vec<KvPair> = Self::json(&url, response).await?;
        let Some(pair) = pairs.into_iter().find(|p| p.key == key) else {
            return Ok(None);
        };
        let value = match pair.value {
            Some(encoded) => {
                STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| ClientError::InvalidResponse {
                        url: url.clone(),
                        message: format!("value of '{key}' is not valid base64: {e}"),
                    })?
            }
            None => Vec::new(),
        };
        Ok(Some(KvEntry {
            key: pair.key,
            value,
            revision: pair.modify_index,
        }))
    }

    async fn write_key(&self, key: &str, value: &[u8]) -> Result<u64, ClientError> {
        let key = validate_key(key)?;
        let url = self.url(&format!("/v1/kv/{}", encode_path(key)));
        let body = value.to_vec();
        let response = self.send(Method::PUT, &url, |r| r.body(body)).await?;
        let response = Self::check_status(&Method::PUT, &url, response, false).await?;
        let accepted: bool = Self::json(&url, response).await?;
        if !accepted {
            return Err(ClientError::WriteRejected {
                key: key.to_owned(),
            });
        }

        // The PUT answer carries no index; read it back.
        let entry = self
            .read_key(key)
            .await?
            .ok_or_else(|| ClientError::InvalidResponse {
                url: url.clone(),
                message: format!("key '{key}' missing right after a successful write"),
            })?;
        Ok(entry.revision)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), ClientError> {
        let prefix = normalize_key(prefix);
        if prefix.is_empty() {
            return Err(ClientError::InvalidKey {
                key: String::new(),
                reason: "refusing to delete the whole keyspace".to_owned(),
            });
        }
        let url = self.url(&format!("/v1/kv/{}", encode_path(prefix)));
        let response = self
            .send(Method::DELETE, &url, |r| r.query(&[("recurse", "true")]))
            .await?;
        Self::check_status(&Method::DELETE, &url, response, true).await?;
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ClientError> {
        let prefix = normalize_key(prefix);
        let url = self.url(&format!("/v1/kv/{}", encode_path(prefix)));
        let response = self
            .send(Method::GET, &url, |r| r.query(&[("keys", "true")]))
            .await?;
        let response = Self::check_status(&Method::GET, &url, response, true).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let mut keys: Vec<String> = Self::json(&url, response).await?;
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl ServiceCatalog for ConsulClient {
    async fn register_service(
        &self,
        registration: &ServiceRegistration,
    ) -> Result<(), ClientError> {
        validate_service(&registration.name)?;
        let url = self.url("/v1/agent/service/register");

        let mut current = BTreeSet::new();
        for endpoint in &registration.endpoints {
            let id = service_instance_id(&registration.name, endpoint);
            let body = AgentServiceRegistration {
                id: id.clone(),
                name: &registration.name,
                address: &endpoint.host,
                port: endpoint.port,
                tags: &registration.tags,
                check: AgentCheck {
                    check_id: check_id(&id),
                    name: format!("{} TTL", registration.name),
                    ttl: go_duration(self.config.check_ttl),
                    status: registration.health.as_str(),
                    deregister_critical_service_after: go_duration(
                        self.config.deregister_critical_after,
                    ),
                },
            };
            let response = self.send(Method::PUT, &url, |r| r.json(&body)).await?;
            Self::check_status(&Method::PUT, &url, response, false).await?;
            self.keep_alive(&id, registration.health);
            current.insert(id);
        }

        // New endpoints are live before old ones disappear.
        let stale: Vec<String> = self
            .agent_instance_ids(&registration.name)
            .await?
            .into_iter()
            .filter(|id| !current.contains(id))
            .collect();
        for id in &stale {
            self.deregister_instance(id).await?;
        }

        tracing::debug!(
            service = %registration.name,
            endpoints = current.len(),
            replaced = stale.len(),
            "registered service"
        );
        Ok(())
    }

    async fn deregister_service(&self, name: &str) -> Result<usize, ClientError> {
        validate_service(name)?;
        let ids = self.agent_instance_ids(name).await?;
        for id in &ids {
            self.deregister_instance(id).await?;
        }
        Ok(ids.len())
    }

    async fn query_service(&self, name: &str) -> Result<CatalogSnapshot, ClientError> {
        validate_service(name)?;
        let mut url = self.url(&format!("/v1/health/service/{}", urlencoding::encode(name)));
        if self.config.allow_stale {
            url.push_str("?stale");
        }
        let response = self.send(Method::GET, &url, |r| r).await?;
        let response = Self::check_status(&Method::GET, &url, response, false).await?;

        let index = header_u64(&response, HEADER_INDEX).unwrap_or(0);
        let last_contact =
            Duration::from_millis(header_u64(&response, HEADER_LAST_CONTACT).unwrap_or(0));
        let known_leader = response
            .headers()
            .get(HEADER_KNOWN_LEADER)
            .and_then(|v| v.to_str().ok())
            .is_none_or(|v| v.eq_ignore_ascii_case("true"));

        let entries: Vec<HealthEntry> = Self::json(&url, response).await?;
        let nodes = entries
            .into_iter()
            .map(|entry| {
                let health = entry
                    .checks
                    .iter()
                    .map(|c| c.status.parse().unwrap_or(HealthStatus::Critical))
                    .fold(HealthStatus::Passing, HealthStatus::worst);
                let host = if entry.service.address.is_empty() {
                    entry.node.map(|n| n.address).unwrap_or_default()
                } else {
                    entry.service.address
                };
                ServiceNode {
                    service_id: entry.service.id,
                    endpoint: Endpoint::new(host, entry.service.port),
                    health,
                }
            })
            .collect();

        Ok(CatalogSnapshot {
            nodes,
            index,
            last_contact,
            known_leader,
        })
    }

    async fn update_health(
        &self,
        name: &str,
        endpoint: &Endpoint,
        status: HealthStatus,
    ) -> Result<(), ClientError> {
        validate_service(name)?;
        let id = service_instance_id(name, endpoint);
        let url = self.check_update_url(&id);
        let body = CheckUpdate {
            status: status.as_str(),
            output: format!("set to {status} by dev services"),
        };
        let response = self.send(Method::PUT, &url, |r| r.json(&body)).await?;
        Self::check_status(&Method::PUT, &url, response, false).await?;
        if let Some(heartbeat) = self.heartbeats.get(&id) {
            heartbeat.set(status);
        }
        Ok(())
    }
}

#[async_trait]
impl BackingStore for ConsulClient {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn leader(&self) -> Result<Option<String>, ClientError> {
        let url = self.url("/v1/status/leader");
        let response = self.send(Method::GET, &url, |r| r).await?;
        let response = Self::check_status(&Method::GET, &url, response, false).await?;
        let leader: String = Self::json(&url, response).await?;
        Ok(Some(leader).filter(|l| !l.is_empty()))
    }
}

/// Connects [`ConsulClient`]s with a shared configuration.
#[derive(Debug, Clone, Default)]
pub struct ConsulConnector {
    config: ClientConfig,
}

impl ConsulConnector {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

impl StoreConnector for ConsulConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn BackingStore>, ClientError> {
        Ok(Arc::new(ConsulClient::new(
            endpoint.clone(),
            self.config.clone(),
        )?))
    }
}
