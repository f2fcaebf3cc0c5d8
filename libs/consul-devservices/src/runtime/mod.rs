//! Container runtime abstraction.
//!
//! A runtime starts one Consul agent per [`ContainerSpec`] and reports where
//! it listens. Readiness is not the runtime's concern; the lifecycle manager
//! probes the returned endpoint.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use consul_client::Endpoint;

use crate::config::{CONSUL_HTTP_PORT, DevServicesConfig};
use crate::instance::{InstanceId, ScopeKey};

/// Label marking containers owned by dev services.
pub const LABEL_MANAGED: &str = "consul-devservices";
pub const LABEL_SCOPE: &str = "consul-devservices.scope";
pub const LABEL_INSTANCE: &str = "consul-devservices.instance-id";

/// What to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Unique name, also used as the Consul node name.
    pub name: String,
    pub scope: ScopeKey,
    pub instance_id: InstanceId,
    pub image: String,
    pub tag: String,
    pub container_port: u16,
    /// Fixed host port, or `None` for a free one.
    pub host_port: Option<u16>,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub log_level: String,
    pub startup_timeout: Duration,
    pub stop_timeout: Duration,
    /// Agent binary for process-based runtimes.
    pub binary: PathBuf,
}

impl ContainerSpec {
    /// Single-node dev-mode agent for `scope`.
    #[must_use]
    pub fn consul(cfg: &DevServicesConfig, scope: &ScopeKey, instance_id: InstanceId) -> Self {
        let log_level = cfg.log_level.to_ascii_lowercase();
        let labels = BTreeMap::from([
            (LABEL_MANAGED.to_owned(), "true".to_owned()),
            (LABEL_SCOPE.to_owned(), scope.to_string()),
            (LABEL_INSTANCE.to_owned(), instance_id.to_string()),
        ]);
        let simple = instance_id.as_uuid().simple().to_string();

        Self {
            name: format!("consul-dev-{}", &simple[simple.len() - 12..]),
            scope: scope.clone(),
            instance_id,
            image: cfg.image_name.clone(),
            tag: cfg.image_tag.clone(),
            container_port: CONSUL_HTTP_PORT,
            host_port: cfg.port,
            command: vec![
                "agent".to_owned(),
                "-dev".to_owned(),
                "-client=0.0.0.0".to_owned(),
                format!("-log-level={log_level}"),
            ],
            env: BTreeMap::from([("CONSUL_BIND_INTERFACE".to_owned(), "eth0".to_owned())]),
            labels,
            log_level,
            startup_timeout: cfg.startup_timeout,
            stop_timeout: cfg.stop_timeout,
            binary: cfg.consul_binary.clone(),
        }
    }
}

/// A started container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub scope: ScopeKey,
    pub instance_id: InstanceId,
    pub endpoint: Endpoint,
    pub runtime: &'static str,
    pub started_at: Instant,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts the container and returns once its port is mapped.
    ///
    /// Must give up on its own within [`ContainerSpec::startup_timeout`]. The
    /// caller may still drop the future later; a container created by a
    /// dropped `start` has to be removed by the runtime itself.
    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    /// Stops and removes the container. Unknown handles are ignored.
    async fn stop(&self, handle: &ContainerHandle) -> Result<()>;

    /// Every container this runtime started and has not stopped.
    async fn running(&self) -> Result<Vec<ContainerHandle>>;
}

#[cfg(feature = "docker")]
pub mod docker;
pub mod local;
pub mod log_forwarder;

#[cfg(feature = "docker")]
pub use docker::DockerRuntime;
pub use local::LocalProcessRuntime;
