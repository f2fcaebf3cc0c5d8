#![allow(clippy::unwrap_used, clippy::expect_used)]
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use async_trait::async_trait;
use consul_client::{Endpoint, MemoryConnector};
use consul_devservices::{
    Clock, ContainerHandle, ContainerRuntime, ContainerSpec, DevServices, DevServicesConfig,
    LifecycleManager, ManualClock, ReadinessConfig, ReadinessProbe,
};
use parking_lot::Mutex;

/// Container runtime that only books containers in memory.
#[derive(Default)]
pub struct FakeRuntime {
    starts: AtomicU32,
    stops: AtomicU32,
    next_port: AtomicU16,
    running: Mutex<HashMap<String, ContainerHandle>>,
    start_delay: Option<Duration>,
    stop_delay: Option<Duration>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            next_port: AtomicU16::new(20000),
            ..Self::default()
        }
    }

    /// Every `start` takes `delay` of real time, long enough for concurrent
    /// callers to pile up.
    pub fn with_start_delay(delay: Duration) -> Self {
        Self {
            start_delay: Some(delay),
            ..Self::new()
        }
    }

    /// Every `stop` takes `delay` of real time before the container goes away.
    pub fn with_stop_delay(delay: Duration) -> Self {
        Self {
            stop_delay: Some(delay),
            ..Self::new()
        }
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let handle = ContainerHandle {
            id: spec.name.clone(),
            scope: spec.scope.clone(),
            instance_id: spec.instance_id,
            endpoint: Endpoint::new("127.0.0.1", port),
            runtime: "fake",
            started_at: Instant::now(),
        };
        self.running.lock().insert(handle.id.clone(), handle.clone());
        Ok(handle)
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        if let Some(delay) = self.stop_delay {
            tokio::time::sleep(delay).await;
        }
        if self.running.lock().remove(&handle.id).is_some() {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn running(&self) -> Result<Vec<ContainerHandle>> {
        Ok(self.running.lock().values().cloned().collect())
    }
}

/// Fails the first `failures` probes, then succeeds. `None` never succeeds.
pub struct ScriptedProbe {
    failures: Option<u32>,
    calls: AtomicU32,
}

impl ScriptedProbe {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures: Some(failures),
            calls: AtomicU32::new(0),
        }
    }

    pub fn never_ready() -> Self {
        Self {
            failures: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessProbe for ScriptedProbe {
    async fn probe(&self, endpoint: &Endpoint) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.failures {
            Some(failures) if call > failures => Ok(()),
            _ => bail!("connection refused by {endpoint}"),
        }
    }
}

/// Blocks its worker thread for `delay`, then reports ready. Cancellation
/// cannot interrupt a readiness check that is already running.
pub struct BlockingReadiness {
    delay: Duration,
    calls: AtomicU32,
}

impl BlockingReadiness {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessProbe for BlockingReadiness {
    async fn probe(&self, _endpoint: &Endpoint) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Ok(())
    }
}

/// Polls `check` every 10 ms for up to two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn test_config(max_attempts: u32) -> DevServicesConfig {
    DevServicesConfig {
        readiness: ReadinessConfig {
            max_attempts,
            ..ReadinessConfig::default()
        },
        ..DevServicesConfig::default()
    }
}

pub fn manager(
    runtime: Arc<FakeRuntime>,
    probe: Arc<dyn ReadinessProbe>,
    clock: Arc<dyn Clock>,
    config: DevServicesConfig,
) -> LifecycleManager {
    LifecycleManager::new(runtime, probe, clock, config)
}

pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub probe: Arc<ScriptedProbe>,
    pub connector: Arc<MemoryConnector>,
    pub services: DevServices,
}

pub fn harness(config: DevServicesConfig, probe: ScriptedProbe) -> Harness {
    harness_with(FakeRuntime::new(), config, probe)
}

pub fn harness_with(
    runtime: FakeRuntime,
    config: DevServicesConfig,
    probe: ScriptedProbe,
) -> Harness {
    let runtime = Arc::new(runtime);
    let probe = Arc::new(probe);
    let connector = Arc::new(MemoryConnector::new());
    let services = DevServices::builder(config)
        .runtime(runtime.clone())
        .probe(probe.clone())
        .connector(connector.clone())
        .clock(Arc::new(ManualClock::new()))
        .build()
        .expect("valid test configuration");
    Harness {
        runtime,
        probe,
        connector,
        services,
    }
}
