//! Entry point for tests and dev runs.
//!
//! [`DevServices`] wires the lifecycle manager, seeder and config bridge
//! together. [`DevServices::with_backing_store`] hands a body a ready,
//! seeded store and always releases it afterwards, whether the body returns,
//! fails, panics or is dropped.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use consul_client::{
    BackingStore, ClientError, ConsulConnector, DiscoveryClient, Endpoint, KvEntry, KvStore,
    ServiceCatalog, StoreConnector,
};
use dashmap::DashMap;
use futures::FutureExt;

use crate::bridge::{ConfigBridge, RuntimeConfig};
use crate::clock::{Clock, TokioClock};
use crate::config::{DevServicesConfig, RuntimeKind};
use crate::error::DevServicesError;
use crate::instance::{BackingStoreInstance, ScopeKey};
use crate::lifecycle::LifecycleManager;
use crate::readiness::{ConsulReadinessProbe, ReadinessProbe};
use crate::runtime::{ContainerRuntime, LocalProcessRuntime};
use crate::seeder::{KvSeeder, SeedReport};

/// What a body gets to work with: the store, its config and a private
/// KV namespace.
#[derive(Clone)]
pub struct StoreHandle {
    instance: Arc<BackingStoreInstance>,
    store: Arc<dyn BackingStore>,
    config: RuntimeConfig,
    namespace: String,
    discovery: Arc<DiscoveryClient>,
    seed_report: SeedReport,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("scope", self.instance.scope())
            .field("instance_id", &self.instance.id())
            .field("endpoint", self.store.endpoint())
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl StoreHandle {
    #[must_use]
    pub fn instance(&self) -> &Arc<BackingStoreInstance> {
        &self.instance
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        self.store.endpoint()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    #[must_use]
    pub fn kv(&self) -> &dyn KvStore {
        self.store.as_ref()
    }

    #[must_use]
    pub fn catalog(&self) -> &dyn ServiceCatalog {
        self.store.as_ref()
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn discovery(&self) -> &DiscoveryClient {
        &self.discovery
    }

    /// Result of seeding this instance, shared by every handle to it.
    #[must_use]
    pub fn seed_report(&self) -> &SeedReport {
        &self.seed_report
    }

    /// Unique per handle; keys written through [`Self::put`] live under it.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn namespaced_key(&self, key: &str) -> String {
        format!("{}/{}", self.namespace, key.trim_start_matches('/'))
    }

    /// Writes `key` inside this handle's namespace.
    ///
    /// # Errors
    /// Any [`ClientError`] from the store.
    pub async fn put(&self, key: &str, value: impl AsRef<[u8]>) -> Result<u64, ClientError> {
        self.store
            .write_key(&self.namespaced_key(key), value.as_ref())
            .await
    }

    /// Reads `key` from this handle's namespace.
    ///
    /// # Errors
    /// Any [`ClientError`] from the store.
    pub async fn get(&self, key: &str) -> Result<Option<KvEntry>, ClientError> {
        self.store.read_key(&self.namespaced_key(key)).await
    }
}

/// Builder for [`DevServices`]; every collaborator defaults to the one the
/// configuration asks for.
pub struct DevServicesBuilder {
    config: DevServicesConfig,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    probe: Option<Arc<dyn ReadinessProbe>>,
    connector: Option<Arc<dyn StoreConnector>>,
    clock: Option<Arc<dyn Clock>>,
    seed: Option<Vec<KvEntry>>,
}

impl DevServicesBuilder {
    #[must_use]
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    #[must_use]
    pub fn probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn StoreConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces the configured `seed_data`.
    #[must_use]
    pub fn seed(mut self, entries: Vec<KvEntry>) -> Self {
        self.seed = Some(entries);
        self
    }

    /// # Errors
    /// [`DevServicesError::Disabled`] when the configuration disables dev
    /// services, [`DevServicesError::Config`] for invalid configuration.
    pub fn build(self) -> Result<DevServices, DevServicesError> {
        if !self.config.enabled {
            return Err(DevServicesError::Disabled);
        }
        self.config.validate()?;

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(ConsulConnector::new(self.config.client.clone())));
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => default_runtime(self.config.runtime)?,
        };
        let probe = self.probe.unwrap_or_else(|| {
            Arc::new(ConsulReadinessProbe::new(
                Arc::clone(&connector),
                self.config.readiness.probe_timeout,
            ))
        });
        let clock = self.clock.unwrap_or_else(|| Arc::new(TokioClock));
        let seed = self.seed.unwrap_or_else(|| self.config.seed_entries());

        tracing::debug!(
            runtime = runtime.name(),
            image = %self.config.image(),
            seed_entries = seed.len(),
            "dev services configured"
        );

        Ok(DevServices {
            bridge: ConfigBridge::from_config(&self.config),
            seeder: KvSeeder::new(Arc::clone(&connector)),
            manager: Arc::new(LifecycleManager::new(
                runtime,
                probe,
                clock,
                self.config.clone(),
            )),
            connector,
            config: self.config,
            seed,
            active: DashMap::new(),
            namespace_seq: AtomicU64::new(0),
        })
    }
}

fn default_runtime(kind: RuntimeKind) -> Result<Arc<dyn ContainerRuntime>, DevServicesError> {
    match kind {
        #[cfg(feature = "docker")]
        RuntimeKind::Docker => Ok(Arc::new(crate::runtime::DockerRuntime::new())),
        #[cfg(not(feature = "docker"))]
        RuntimeKind::Docker => Err(DevServicesError::Config(
            "the docker runtime needs the `docker` feature".to_owned(),
        )),
        RuntimeKind::LocalProcess => Ok(Arc::new(LocalProcessRuntime::default())),
    }
}

/// Per-scope count of bodies running inside [`DevServices::with_backing_store`].
type ActiveCount = Arc<tokio::sync::Mutex<usize>>;

/// Leaves the active set of a scope; the last one out releases it. Dropping
/// an unfinished guard does the same on a spawned task.
struct ScopeGuard {
    manager: Arc<LifecycleManager>,
    scope: ScopeKey,
    active: ActiveCount,
    armed: bool,
}

impl ScopeGuard {
    async fn leave(
        manager: &LifecycleManager,
        scope: &ScopeKey,
        active: &ActiveCount,
    ) -> Result<(), DevServicesError> {
        let mut count = active.lock().await;
        *count = count.saturating_sub(1);
        if *count == 0 {
            manager.release(scope).await
        } else {
            tracing::debug!(scope = %scope, still_active = *count, "scope kept for other bodies");
            Ok(())
        }
    }

    /// Leaves on a spawned task, so a caller dropped halfway through still
    /// completes the release.
    async fn finish(mut self) -> Result<(), DevServicesError> {
        self.armed = false;
        let manager = Arc::clone(&self.manager);
        let scope = self.scope.clone();
        let active = Arc::clone(&self.active);
        let leave = tokio::spawn(async move { Self::leave(&manager, &scope, &active).await });
        leave.await.unwrap_or_else(|e| {
            Err(DevServicesError::Runtime {
                scope: self.scope.clone(),
                message: format!("release task failed: {e}"),
            })
        })
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let manager = Arc::clone(&self.manager);
        let scope = self.scope.clone();
        let active = Arc::clone(&self.active);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                tracing::debug!(scope = %scope, "body dropped, releasing in background");
                rt.spawn(async move {
                    if let Err(e) = Self::leave(&manager, &scope, &active).await {
                        tracing::warn!(scope = %scope, error = %e, "background release failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(scope = %scope, "body dropped outside a runtime, scope not released");
            }
        }
    }
}

/// Assembled dev services engine.
pub struct DevServices {
    manager: Arc<LifecycleManager>,
    connector: Arc<dyn StoreConnector>,
    seeder: KvSeeder,
    bridge: ConfigBridge,
    config: DevServicesConfig,
    seed: Vec<KvEntry>,
    active: DashMap<ScopeKey, ActiveCount>,
    namespace_seq: AtomicU64,
}

impl DevServices {
    #[must_use]
    pub fn builder(config: DevServicesConfig) -> DevServicesBuilder {
        DevServicesBuilder {
            config,
            runtime: None,
            probe: None,
            connector: None,
            clock: None,
            seed: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &DevServicesConfig {
        &self.config
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<LifecycleManager> {
        &self.manager
    }

    /// Acquires `scope`, seeds it once per instance and builds a handle.
    ///
    /// The scope stays up until [`Self::release`]; prefer
    /// [`Self::with_backing_store`] in tests.
    ///
    /// # Errors
    /// Provisioning, seeding and connection errors.
    pub async fn open(
        &self,
        scope: impl Into<ScopeKey>,
        name: &str,
    ) -> Result<StoreHandle, DevServicesError> {
        let instance = self.manager.acquire(scope).await?;

        let seed_report = instance
            .seeded
            .get_or_init(|| self.seeder.seed(&instance, &self.seed))
            .await
            .clone()?;

        let config = self.bridge.materialize(&instance)?;
        let store = self.connector.connect(&instance.ready_endpoint()?)?;
        let catalog: Arc<dyn ServiceCatalog> = store.clone();
        let discovery = DiscoveryClient::new(catalog, self.config.discovery.clone());

        Ok(StoreHandle {
            namespace: self.next_namespace(name),
            instance,
            store,
            config,
            discovery: Arc::new(discovery),
            seed_report,
        })
    }

    /// # Errors
    /// See [`LifecycleManager::release`].
    pub async fn release(&self, scope: &ScopeKey) -> Result<(), DevServicesError> {
        self.manager.release(scope).await
    }

    /// Runs `body` against a ready, seeded store of `scope`, named after the
    /// current test thread.
    ///
    /// # Errors
    /// Whatever `body` returns, or the provisioning error converted into `E`.
    pub async fn with_backing_store<F, Fut, T, E>(
        &self,
        scope: impl Into<ScopeKey>,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(StoreHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DevServicesError>,
    {
        let name = std::thread::current()
            .name()
            .and_then(|n| n.rsplit("::").next())
            .unwrap_or("test")
            .to_owned();
        self.with_backing_store_named(scope, &name, body).await
    }

    /// Like [`Self::with_backing_store`] with an explicit name for the
    /// per-handle KV namespace.
    ///
    /// Bodies running concurrently on one scope share its instance; the scope
    /// is released when the last of them finishes. A panicking body is
    /// resumed after release.
    ///
    /// # Errors
    /// Whatever `body` returns, or a provisioning or release error converted
    /// into `E`.
    pub async fn with_backing_store_named<F, Fut, T, E>(
        &self,
        scope: impl Into<ScopeKey>,
        name: &str,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(StoreHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DevServicesError>,
    {
        let scope = scope.into();
        let active = Arc::clone(&*self.active.entry(scope.clone()).or_default());
        *active.lock().await += 1;
        let guard = ScopeGuard {
            manager: Arc::clone(&self.manager),
            scope: scope.clone(),
            active,
            armed: true,
        };

        let handle = match self.open(scope.clone(), name).await {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(release) = guard.finish().await {
                    tracing::warn!(scope = %scope, error = %release, "release after failed start failed");
                }
                return Err(e.into());
            }
        };

        let body_handle = handle.clone();
        let outcome = AssertUnwindSafe(async move { body(body_handle).await })
            .catch_unwind()
            .await;

        self.cleanup_namespace(&handle).await;
        drop(handle);
        let released = guard.finish().await;

        match outcome {
            Err(panic) => std::panic::resume_unwind(panic),
            Ok(Ok(value)) => released.map(|()| value).map_err(E::from),
            Ok(Err(e)) => {
                if let Err(release) = released {
                    tracing::warn!(scope = %scope, error = %release, "release after failed body failed");
                }
                Err(e)
            }
        }
    }

    /// Releases every scope.
    ///
    /// # Errors
    /// The first release error.
    pub async fn shutdown(&self) -> Result<(), DevServicesError> {
        self.manager.release_all().await
    }

    async fn cleanup_namespace(&self, handle: &StoreHandle) {
        if !self.config.namespace_cleanup {
            return;
        }
        let prefix = format!("{}/", handle.namespace());
        if let Err(e) = handle.store.delete_prefix(&prefix).await {
            tracing::warn!(namespace = %handle.namespace(), error = %e, "namespace cleanup failed");
        }
    }

    fn next_namespace(&self, name: &str) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let seq = self.namespace_seq.fetch_add(1, Ordering::Relaxed);
        let name: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        format!("{}-{name}-{millis}-{seq}", self.config.namespace_prefix)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use anyhow::Result;
    use async_trait::async_trait;
    use consul_client::MemoryConnector;
    use parking_lot::Mutex;
    use std::time::Instant;

    use crate::runtime::{ContainerHandle, ContainerSpec};

    #[derive(Default)]
    struct Runtime {
        running: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ContainerRuntime for Runtime {
        fn name(&self) -> &'static str {
            "facade-test"
        }

        async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
            self.running.lock().push(spec.name.clone());
            Ok(ContainerHandle {
                id: spec.name.clone(),
                scope: spec.scope.clone(),
                instance_id: spec.instance_id,
                endpoint: Endpoint::new("127.0.0.1", 18500),
                runtime: "facade-test",
                started_at: Instant::now(),
            })
        }

        async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
            self.running.lock().retain(|id| id != &handle.id);
            Ok(())
        }

        async fn running(&self) -> Result<Vec<ContainerHandle>> {
            Ok(Vec::new())
        }
    }

    struct AlwaysReady;

    #[async_trait]
    impl ReadinessProbe for AlwaysReady {
        async fn probe(&self, _endpoint: &Endpoint) -> Result<()> {
            Ok(())
        }
    }

    fn services_with(
        config: DevServicesConfig,
        connector: Arc<MemoryConnector>,
    ) -> (Arc<Runtime>, DevServices) {
        let runtime = Arc::new(Runtime::default());
        let services = DevServices::builder(config)
            .runtime(runtime.clone())
            .probe(Arc::new(AlwaysReady))
            .connector(connector)
            .clock(Arc::new(ManualClock::new()))
            .seed(vec![KvEntry::new("config/application", "greeting=hi")])
            .build()
            .unwrap();
        (runtime, services)
    }

    fn services(config: DevServicesConfig) -> (Arc<Runtime>, DevServices) {
        services_with(config, Arc::new(MemoryConnector::new()))
    }

    #[test]
    fn test_disabled_config_refuses_to_build() {
        let cfg = DevServicesConfig {
            enabled: false,
            ..DevServicesConfig::default()
        };
        assert!(matches!(
            DevServices::builder(cfg).build(),
            Err(DevServicesError::Disabled)
        ));
    }

    #[tokio::test]
    async fn test_body_sees_seeded_store_and_scope_is_released() {
        let (runtime, services) = services(DevServicesConfig::default());

        let port = services
            .with_backing_store_named("facade", "seeded", |handle| async move {
                let seeded = handle.kv().read_key("config/application").await?.unwrap();
                assert_eq!(seeded.value_str(), Some("greeting=hi"));
                assert_eq!(handle.seed_report().written, 1);
                assert!(handle.namespace().starts_with("tests-seeded-"));
                Ok::<_, anyhow::Error>(handle.config().get_parsed::<u16>("consul.port"))
            })
            .await
            .unwrap();

        assert_eq!(port, Some(18500));
        assert!(runtime.running.lock().is_empty());
        assert!(services.manager().scopes().is_empty());
    }

    #[tokio::test]
    async fn test_namespace_is_cleaned_up() {
        let connector = Arc::new(MemoryConnector::new());
        let store = connector.store_for(&Endpoint::new("127.0.0.1", 18500));
        let (_, services) = services_with(DevServicesConfig::default(), connector);

        let key = services
            .with_backing_store_named("facade", "ns", |handle| async move {
                handle.put("k", "v").await?;
                assert_eq!(handle.get("k").await?.unwrap().value_str(), Some("v"));
                Ok::<_, anyhow::Error>(handle.namespaced_key("k"))
            })
            .await
            .unwrap();

        assert!(store.read_key(&key).await.unwrap().is_none());
        assert!(store.read_key("config/application").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_namespace_kept_when_cleanup_disabled() {
        let connector = Arc::new(MemoryConnector::new());
        let store = connector.store_for(&Endpoint::new("127.0.0.1", 18500));
        let cfg = DevServicesConfig {
            namespace_cleanup: false,
            ..DevServicesConfig::default()
        };
        let (_, services) = services_with(cfg, connector);

        let key = services
            .with_backing_store_named("facade", "keep", |handle| async move {
                handle.put("k", "v").await?;
                Ok::<_, anyhow::Error>(handle.namespaced_key("k"))
            })
            .await
            .unwrap();

        assert!(store.read_key(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_body_error_is_returned_after_release() {
        let (runtime, services) = services(DevServicesConfig::default());
        let err = services
            .with_backing_store_named("facade", "err", |_handle| async move {
                Err::<(), _>(anyhow::anyhow!("body failed"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "body failed");
        assert!(runtime.running.lock().is_empty());
    }

    #[test]
    fn test_namespaces_are_unique() {
        let (_, services) = services(DevServicesConfig::default());
        let a = services.next_namespace("my test");
        let b = services.next_namespace("my test");
        assert_ne!(a, b);
        assert!(a.starts_with("tests-my-test-"));
    }
}
