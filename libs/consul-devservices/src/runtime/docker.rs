//! Docker runtime backed by testcontainers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use consul_client::Endpoint;
use parking_lot::Mutex;
use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

use super::{ContainerHandle, ContainerRuntime, ContainerSpec};

struct DockerContainer {
    handle: ContainerHandle,
    container: ContainerAsync<GenericImage>,
}

/// Set when the caller of `start` goes away before the container is handed
/// over.
struct AbandonOnDrop {
    abandoned: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.abandoned.store(true, Ordering::SeqCst);
        }
    }
}

/// Starts the `hashicorp/consul` image as a generic container.
///
/// Containers are removed on [`ContainerRuntime::stop`]. Anything still held
/// when the runtime is dropped is removed by testcontainers' drop hook. The
/// container is created on a spawned task, so a dropped `start` still gets
/// to remove what it created.
#[derive(Default)]
pub struct DockerRuntime {
    containers: Arc<Mutex<HashMap<String, DockerContainer>>>,
}

impl DockerRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let image = GenericImage::new(spec.image.as_str(), spec.tag.as_str())
            .with_exposed_port(spec.container_port.tcp());

        let mut request = image
            .with_cmd(spec.command.clone())
            .with_container_name(spec.name.as_str())
            .with_labels(spec.labels.clone())
            .with_startup_timeout(spec.startup_timeout);
        for (key, value) in &spec.env {
            request = request.with_env_var(key.as_str(), value.as_str());
        }
        if let Some(host_port) = spec.host_port {
            request = request.with_mapped_port(host_port, spec.container_port.tcp());
        }

        let abandoned = Arc::new(AtomicBool::new(false));
        let mut on_drop = AbandonOnDrop {
            abandoned: Arc::clone(&abandoned),
            armed: true,
        };
        let image_ref = format!("{}:{}", spec.image, spec.tag);
        let name = spec.name.clone();
        let task = tokio::spawn(async move {
            let container = request
                .start()
                .await
                .with_context(|| format!("failed to start container {image_ref}"))?;
            if abandoned.load(Ordering::SeqCst) {
                tracing::info!(container = %name, "start abandoned, removing container");
                container
                    .rm()
                    .await
                    .with_context(|| format!("failed to remove abandoned container {name}"))?;
                bail!("start of container {name} was abandoned");
            }
            Ok(container)
        });
        // Past this point a dropped future drops `container`, and with it the
        // container through testcontainers' drop hook.
        let container = task.await.context("container start task panicked")??;
        on_drop.armed = false;

        let host = container
            .get_host()
            .await
            .context("failed to resolve container host")?;
        let port = container
            .get_host_port_ipv4(spec.container_port)
            .await
            .context("container port is not mapped")?;

        let handle = ContainerHandle {
            id: container.id().to_owned(),
            scope: spec.scope.clone(),
            instance_id: spec.instance_id,
            endpoint: Endpoint::new(host.to_string(), port),
            runtime: self.name(),
            started_at: Instant::now(),
        };

        tracing::info!(
            scope = %spec.scope,
            container_id = %handle.id,
            endpoint = %handle.endpoint,
            image = %format!("{}:{}", spec.image, spec.tag),
            "Started consul container"
        );

        self.containers.lock().insert(
            handle.id.clone(),
            DockerContainer {
                handle: handle.clone(),
                container,
            },
        );
        Ok(handle)
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        let entry = self.containers.lock().remove(&handle.id);
        let Some(entry) = entry else {
            tracing::debug!(container_id = %handle.id, "stop called for unknown container, ignoring");
            return Ok(());
        };

        entry
            .container
            .rm()
            .await
            .with_context(|| format!("failed to remove container {}", entry.handle.id))?;
        tracing::info!(scope = %handle.scope, container_id = %handle.id, "Removed consul container");
        Ok(())
    }

    async fn running(&self) -> Result<Vec<ContainerHandle>> {
        Ok(self
            .containers
            .lock()
            .values()
            .map(|c| c.handle.clone())
            .collect())
    }
}
