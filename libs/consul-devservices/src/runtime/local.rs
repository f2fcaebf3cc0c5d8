//! Runtime that runs `consul agent -dev` as a local child process.

use std::collections::HashMap;
use std::net::TcpListener;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use consul_client::Endpoint;
use parking_lot::RwLock;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::log_forwarder::{StreamKind, spawn_stream_forwarder};
use super::{ContainerHandle, ContainerRuntime, ContainerSpec};

/// Timeout for waiting on forwarder tasks during shutdown
const FORWARDER_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

const LOCALHOST: &str = "127.0.0.1";

/// Send SIGTERM to a child process. Returns `false` if the process already
/// exited or the signal could not be delivered.
#[cfg(unix)]
fn send_terminate_signal(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };

    let Ok(pid_i32) = i32::try_from(pid) else {
        tracing::warn!(pid, "PID exceeds i32::MAX, cannot send SIGTERM");
        return false;
    };

    kill(Pid::from_raw(pid_i32), Signal::SIGTERM).is_ok()
}

/// No graceful termination for console processes on Windows; the caller
/// falls through to a force kill.
#[cfg(windows)]
fn send_terminate_signal(_child: &Child) -> bool {
    false
}

/// SIGTERM, wait up to `grace`, then force kill.
async fn stop_child_with_grace(
    child: &mut Child,
    handle: &ContainerHandle,
    grace: Duration,
    context: &str,
) {
    let pid = child.id();
    let sent = send_terminate_signal(child);

    tracing::debug!(
        scope = %handle.scope,
        container_id = %handle.id,
        pid = ?pid,
        graceful = sent,
        "{context}: sent termination signal"
    );

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(
                scope = %handle.scope,
                container_id = %handle.id,
                status = ?status,
                "{context}: agent exited"
            );
        }
        Ok(Err(e)) => {
            tracing::warn!(
                scope = %handle.scope,
                container_id = %handle.id,
                error = %e,
                "{context}: failed to wait for agent"
            );
        }
        Err(_) => {
            tracing::debug!(
                scope = %handle.scope,
                container_id = %handle.id,
                "{context}: grace period expired, force killing"
            );
            if let Err(e) = child.kill().await {
                tracing::warn!(
                    scope = %handle.scope,
                    container_id = %handle.id,
                    error = %e,
                    "{context}: failed to force kill"
                );
            }
        }
    }
}

async fn wait_forwarder(handle: Option<JoinHandle<()>>) {
    if let Some(h) = handle {
        let _ = tokio::time::timeout(FORWARDER_DRAIN_TIMEOUT, h).await;
    }
}

/// Asks the OS for a currently free TCP port on localhost.
fn free_port() -> Result<u16> {
    let listener =
        TcpListener::bind((LOCALHOST, 0)).context("failed to reserve a free local port")?;
    Ok(listener.local_addr()?.port())
}

fn agent_args(spec: &ContainerSpec, http_port: u16) -> Result<Vec<String>> {
    Ok(vec![
        "agent".to_owned(),
        "-dev".to_owned(),
        format!("-bind={LOCALHOST}"),
        format!("-client={LOCALHOST}"),
        format!("-node={}", spec.name),
        format!("-http-port={http_port}"),
        "-dns-port=-1".to_owned(),
        "-grpc-port=-1".to_owned(),
        "-grpc-tls-port=-1".to_owned(),
        format!("-serf-lan-port={}", free_port()?),
        format!("-serf-wan-port={}", free_port()?),
        format!("-server-port={}", free_port()?),
        format!("-log-level={}", spec.log_level),
    ])
}

struct LocalAgent {
    handle: ContainerHandle,
    child: Child,
    grace: Duration,
    stdout_forwarder: Option<JoinHandle<()>>,
    stderr_forwarder: Option<JoinHandle<()>>,
}

/// Runs each "container" as a `consul agent -dev` child on random local ports.
///
/// Children are spawned with `kill_on_drop`, so dropping the runtime never
/// leaves an agent behind. [`Self::shutdown`] stops them gracefully.
pub struct LocalProcessRuntime {
    agents: Arc<RwLock<HashMap<String, LocalAgent>>>,
    cancel: CancellationToken,
}

impl Default for LocalProcessRuntime {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl LocalProcessRuntime {
    /// `cancel` stops the log forwarders of every agent.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            cancel,
        }
    }

    /// Gracefully stops every agent still running.
    pub async fn shutdown(&self) {
        let mut all: Vec<LocalAgent> = {
            let mut guard = self.agents.write();
            guard.drain().map(|(_, agent)| agent).collect()
        };
        if all.is_empty() {
            return;
        }

        tracing::info!(count = all.len(), "Stopping local consul agents");
        for agent in &mut all {
            stop_child_with_grace(&mut agent.child, &agent.handle, agent.grace, "shutdown").await;
        }
        self.cancel.cancel();
        for agent in all {
            wait_forwarder(agent.stdout_forwarder).await;
            wait_forwarder(agent.stderr_forwarder).await;
        }
        tracing::info!("All local consul agents stopped");
    }
}

#[async_trait]
impl ContainerRuntime for LocalProcessRuntime {
    fn name(&self) -> &'static str {
        "local_process"
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let http_port = match spec.host_port {
            Some(port) => port,
            None => free_port()?,
        };

        let mut cmd = Command::new(&spec.binary);
        cmd.args(agent_args(spec, http_port)?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", spec.binary.display()))?;
        let pid = child.id();

        let id = spec.name.clone();
        let scope = spec.scope.to_string();
        let stdout_forwarder = child.stdout.take().map(|stdout| {
            spawn_stream_forwarder(
                stdout,
                scope.clone(),
                id.clone(),
                self.cancel.child_token(),
                StreamKind::Stdout,
            )
        });
        let stderr_forwarder = child.stderr.take().map(|stderr| {
            spawn_stream_forwarder(
                stderr,
                scope.clone(),
                id.clone(),
                self.cancel.child_token(),
                StreamKind::Stderr,
            )
        });

        let handle = ContainerHandle {
            id,
            scope: spec.scope.clone(),
            instance_id: spec.instance_id,
            endpoint: Endpoint::new(LOCALHOST, http_port),
            runtime: self.name(),
            started_at: Instant::now(),
        };

        tracing::info!(
            scope = %spec.scope,
            container_id = %handle.id,
            endpoint = %handle.endpoint,
            pid = ?pid,
            "Spawned local consul agent with log forwarding"
        );

        self.agents.write().insert(
            handle.id.clone(),
            LocalAgent {
                handle: handle.clone(),
                child,
                grace: spec.stop_timeout,
                stdout_forwarder,
                stderr_forwarder,
            },
        );
        Ok(handle)
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        let agent = self.agents.write().remove(&handle.id);

        if let Some(mut agent) = agent {
            stop_child_with_grace(&mut agent.child, &agent.handle, agent.grace, "stop").await;
            // Forwarders end on their own once the pipes close.
        } else {
            tracing::debug!(
                scope = %handle.scope,
                container_id = %handle.id,
                "stop called for unknown agent, ignoring"
            );
        }
        Ok(())
    }

    async fn running(&self) -> Result<Vec<ContainerHandle>> {
        Ok(self
            .agents
            .read()
            .values()
            .map(|agent| agent.handle.clone())
            .collect())
    }
}
