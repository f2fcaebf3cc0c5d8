//! Per-scope lifecycle of backing store containers.
//!
//! Every scope has at most one live instance. The first `acquire` of a scope
//! spawns a provisioning task; later callers wait on the same watch channel
//! and receive the same outcome. When every waiter of a still-starting
//! instance goes away, provisioning is cancelled and whatever container it
//! already started is removed.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::clock::Clock;
use crate::config::DevServicesConfig;
use crate::error::DevServicesError;
use crate::instance::{BackingStoreInstance, LifecycleState, ScopeKey};
use crate::readiness::{BackoffPolicy, ReadinessFailure, ReadinessProbe, wait_until_ready};
use crate::runtime::{ContainerHandle, ContainerRuntime, ContainerSpec};

type Outcome = Option<Result<(), DevServicesError>>;
type SlotMap = HashMap<ScopeKey, Slot>;

/// Slack over `startup_timeout` before a runtime's `start` is abandoned; the
/// runtime is expected to time out on its own first.
const START_GRACE: Duration = Duration::from_secs(5);

struct Slot {
    instance: Arc<BackingStoreInstance>,
    outcome: watch::Receiver<Outcome>,
    cancel: CancellationToken,
    waiters: Arc<AtomicUsize>,
    task: Option<JoinHandle<()>>,
    container: Arc<Mutex<Option<ContainerHandle>>>,
}

impl Slot {
    fn is_reusable(&self) -> bool {
        !self.instance.state().is_terminal() && !self.cancel.is_cancelled()
    }
}

/// Counts a caller waiting in `acquire`; the last one to leave while the
/// instance is still starting cancels provisioning.
struct WaiterGuard {
    slots: Arc<Mutex<SlotMap>>,
    waiters: Arc<AtomicUsize>,
    cancel: CancellationToken,
    instance: Arc<BackingStoreInstance>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let _slots = self.slots.lock();
        if self.waiters.fetch_sub(1, Ordering::SeqCst) == 1
            && self.instance.state() == LifecycleState::Starting
        {
            tracing::info!(
                scope = %self.instance.scope(),
                instance_id = %self.instance.id(),
                "all waiters gone, cancelling provisioning"
            );
            self.cancel.cancel();
        }
    }
}

/// Everything the provisioning task owns.
struct Provisioning {
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn ReadinessProbe>,
    clock: Arc<dyn Clock>,
    config: Arc<DevServicesConfig>,
    instance: Arc<BackingStoreInstance>,
    cancel: CancellationToken,
    container: Arc<Mutex<Option<ContainerHandle>>>,
}

impl Provisioning {
    async fn run(self, outcome: watch::Sender<Outcome>) {
        let result = match self.provision().await {
            Ok(()) if self.cancel.is_cancelled() => Err(DevServicesError::Cancelled {
                scope: self.instance.scope().clone(),
            }),
            other => other,
        };

        match &result {
            Ok(()) => {
                if !self.instance.transition(LifecycleState::Ready) {
                    tracing::warn!(
                        scope = %self.instance.scope(),
                        state = %self.instance.state(),
                        "instance left Starting before it became ready"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(scope = %self.instance.scope(), error = %e, "provisioning failed");
                teardown(
                    self.runtime.as_ref(),
                    &self.container,
                    &self.config,
                    self.instance.scope(),
                )
                .await;
                self.instance.transition(LifecycleState::Failed);
            }
        }

        // Nobody listening is fine: every waiter may have left.
        let _ = outcome.send(Some(result));
    }

    async fn provision(&self) -> Result<(), DevServicesError> {
        let scope = self.instance.scope();
        let spec = ContainerSpec::consul(&self.config, scope, self.instance.id());
        let started = self.clock.now();

        // Not raced against cancellation so a container that is mid-start
        // is recorded and torn down. Past the grace period the runtime owns
        // cleanup of whatever its dropped `start` created.
        let handle = match tokio::time::timeout(
            self.config.startup_timeout + START_GRACE,
            self.runtime.start(&spec),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(DevServicesError::runtime(scope, &e)),
            Err(_) => {
                return Err(DevServicesError::ProvisioningTimeout {
                    scope: scope.clone(),
                    attempts: 0,
                    elapsed: self.clock.now().saturating_duration_since(started),
                    last_error: format!("{} did not start the container", self.runtime.name()),
                });
            }
        };

        tracing::info!(
            scope = %scope,
            container_id = %handle.id,
            endpoint = %handle.endpoint,
            runtime = handle.runtime,
            "container started, waiting for readiness"
        );
        self.instance
            .attach_container(handle.id.clone(), handle.endpoint.clone());
        let endpoint = handle.endpoint.clone();
        *self.container.lock() = Some(handle);

        if self.cancel.is_cancelled() {
            return Err(DevServicesError::Cancelled {
                scope: scope.clone(),
            });
        }

        wait_until_ready(
            self.probe.as_ref(),
            &endpoint,
            BackoffPolicy::from_config(&self.config),
            self.clock.as_ref(),
            &self.cancel,
        )
        .await
        .map(|_attempts| ())
        .map_err(|failure| match failure {
            ReadinessFailure::GaveUp {
                attempts,
                elapsed,
                last_error,
            } => DevServicesError::ProvisioningTimeout {
                scope: scope.clone(),
                attempts,
                elapsed,
                last_error,
            },
            ReadinessFailure::Cancelled => DevServicesError::Cancelled {
                scope: scope.clone(),
            },
        })
    }
}

/// Stops the recorded container, if any. Errors are logged; a container the
/// runtime cannot stop is left to its drop hook.
async fn teardown(
    runtime: &dyn ContainerRuntime,
    container: &Mutex<Option<ContainerHandle>>,
    config: &DevServicesConfig,
    scope: &ScopeKey,
) -> Option<anyhow::Error> {
    let handle = container.lock().take()?;
    let err = match tokio::time::timeout(config.stop_timeout, runtime.stop(&handle)).await {
        Ok(Ok(())) => return None,
        Ok(Err(e)) => e,
        Err(_) => anyhow::anyhow!(
            "stopping container {} timed out after {:?}",
            handle.id,
            config.stop_timeout
        ),
    };
    tracing::warn!(scope = %scope, container_id = %handle.id, error = %format!("{err:#}"), "container teardown failed");
    Some(err)
}

/// Registry of live backing store instances, one per scope.
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn ReadinessProbe>,
    clock: Arc<dyn Clock>,
    config: Arc<DevServicesConfig>,
    slots: Arc<Mutex<SlotMap>>,
    generations: Mutex<HashMap<ScopeKey, u64>>,
    draining: Mutex<Vec<JoinHandle<()>>>,
}

impl LifecycleManager {
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn ReadinessProbe>,
        clock: Arc<dyn Clock>,
        config: DevServicesConfig,
    ) -> Self {
        Self {
            runtime,
            probe,
            clock,
            config: Arc::new(config),
            slots: Arc::new(Mutex::new(HashMap::new())),
            generations: Mutex::new(HashMap::new()),
            draining: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DevServicesConfig {
        &self.config
    }

    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Returns the Ready instance of `scope`, starting one if needed.
    ///
    /// Concurrent calls for the same scope share one provisioning run and all
    /// get the same instance or the same error. A scope whose last instance
    /// failed or was cancelled gets a fresh instance with the next
    /// generation number.
    ///
    /// # Errors
    /// [`DevServicesError::ProvisioningTimeout`] when readiness never comes,
    /// [`DevServicesError::Runtime`] when the container cannot be started,
    /// [`DevServicesError::Cancelled`] when provisioning was cancelled.
    pub async fn acquire(
        &self,
        scope: impl Into<ScopeKey>,
    ) -> Result<Arc<BackingStoreInstance>, DevServicesError> {
        let scope = scope.into();

        let (instance, mut outcome, guard) = {
            let mut slots = self.slots.lock();
            let slot = match slots.entry(scope.clone()) {
                Entry::Occupied(mut entry) => {
                    if !entry.get().is_reusable() {
                        let old = entry.insert(self.provision(&scope));
                        self.retire(old);
                    }
                    entry.into_mut()
                }
                Entry::Vacant(entry) => entry.insert(self.provision(&scope)),
            };
            slot.waiters.fetch_add(1, Ordering::SeqCst);
            let guard = WaiterGuard {
                slots: Arc::clone(&self.slots),
                waiters: Arc::clone(&slot.waiters),
                cancel: slot.cancel.clone(),
                instance: Arc::clone(&slot.instance),
            };
            (Arc::clone(&slot.instance), slot.outcome.clone(), guard)
        };

        let result = match outcome.wait_for(Option::is_some).await {
            Ok(done) => (*done).clone(),
            Err(_) => None,
        };
        drop(guard);

        match result {
            Some(Ok(())) => Ok(instance),
            Some(Err(e)) => Err(e),
            None => Err(DevServicesError::Cancelled { scope }),
        }
    }

    /// Tears down the instance of `scope` and marks it Stopped. Releasing an
    /// unknown or already released scope does nothing.
    ///
    /// Teardown runs on its own task: dropping the returned future does not
    /// stop it, and [`Self::release_all`] waits for it.
    ///
    /// # Errors
    /// [`DevServicesError::Runtime`] if the container could not be stopped.
    /// The scope is forgotten either way.
    pub async fn release(&self, scope: &ScopeKey) -> Result<(), DevServicesError> {
        let slot = self.slots.lock().remove(scope);
        let Some(slot) = slot else {
            tracing::debug!(scope = %scope, "release of unknown scope, ignoring");
            return Ok(());
        };

        match self.spawn_teardown(slot).await {
            Ok(None) => Ok(()),
            Ok(Some(e)) => Err(DevServicesError::runtime(scope, &e)),
            Err(_) => Err(DevServicesError::Runtime {
                scope: scope.clone(),
                message: "teardown task did not report back".to_owned(),
            }),
        }
    }

    /// Releases every scope and waits for every pending teardown, including
    /// those of replaced instances and of abandoned releases.
    ///
    /// # Errors
    /// The first release error; all scopes are released regardless.
    pub async fn release_all(&self) -> Result<(), DevServicesError> {
        let mut first_error = None;
        for scope in self.scopes() {
            if let Err(e) = self.release(&scope).await {
                first_error.get_or_insert(e);
            }
        }

        let draining: Vec<_> = self.draining.lock().drain(..).collect();
        for task in draining {
            let _ = task.await;
        }

        first_error.map_or(Ok(()), Err)
    }

    /// State of the current instance of `scope`, `Unstarted` if there is none.
    #[must_use]
    pub fn state(&self, scope: &ScopeKey) -> LifecycleState {
        self.slots
            .lock()
            .get(scope)
            .map_or(LifecycleState::Unstarted, |slot| slot.instance.state())
    }

    #[must_use]
    pub fn instance(&self, scope: &ScopeKey) -> Option<Arc<BackingStoreInstance>> {
        self.slots
            .lock()
            .get(scope)
            .map(|slot| Arc::clone(&slot.instance))
    }

    /// Scopes with an instance that has not been released, sorted.
    #[must_use]
    pub fn scopes(&self) -> Vec<ScopeKey> {
        let mut scopes: Vec<_> = self.slots.lock().keys().cloned().collect();
        scopes.sort();
        scopes
    }

    fn next_generation(&self, scope: &ScopeKey) -> u64 {
        let mut generations = self.generations.lock();
        let generation = generations.entry(scope.clone()).or_insert(0);
        *generation += 1;
        *generation
    }

    fn provision(&self, scope: &ScopeKey) -> Slot {
        let generation = self.next_generation(scope);
        let instance = Arc::new(BackingStoreInstance::starting(scope.clone(), generation));
        let cancel = CancellationToken::new();
        let container = Arc::new(Mutex::new(None));
        let (tx, rx) = watch::channel(None);

        let span = tracing::info_span!(
            "provision",
            scope = %scope,
            instance_id = %instance.id(),
            generation
        );
        let task = Provisioning {
            runtime: Arc::clone(&self.runtime),
            probe: Arc::clone(&self.probe),
            clock: Arc::clone(&self.clock),
            config: Arc::clone(&self.config),
            instance: Arc::clone(&instance),
            cancel: cancel.clone(),
            container: Arc::clone(&container),
        };
        let started_at = Instant::now();
        let task = tokio::spawn(
            async move {
                tracing::info!("provisioning backing store");
                task.run(tx).await;
                tracing::debug!(
                    elapsed_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "provisioning finished"
                );
            }
            .instrument(span),
        );

        Slot {
            instance,
            outcome: rx,
            cancel,
            waiters: Arc::new(AtomicUsize::new(0)),
            task: Some(task),
            container,
        }
    }

    fn retire(&self, old: Slot) {
        tracing::debug!(
            scope = %old.instance.scope(),
            instance_id = %old.instance.id(),
            state = %old.instance.state(),
            "replacing instance"
        );
        // Outcome is logged by the teardown task itself.
        drop(self.spawn_teardown(old));
    }

    /// Cancels `slot`, waits for its provisioning task, stops its container
    /// and marks it Stopped, all on a task tracked in `draining`.
    fn spawn_teardown(&self, mut slot: Slot) -> oneshot::Receiver<Option<anyhow::Error>> {
        let (tx, rx) = oneshot::channel();
        let runtime = Arc::clone(&self.runtime);
        let config = Arc::clone(&self.config);
        slot.cancel.cancel();

        let task = tokio::spawn(async move {
            let scope = slot.instance.scope().clone();
            if let Some(task) = slot.task.take()
                && let Err(e) = task.await
            {
                tracing::warn!(scope = %scope, error = %e, "provisioning task did not finish cleanly");
            }

            let failure = teardown(runtime.as_ref(), &slot.container, &config, &scope).await;
            slot.instance.transition(LifecycleState::Stopped);
            tracing::info!(
                scope = %scope,
                instance_id = %slot.instance.id(),
                state = %slot.instance.state(),
                "released backing store"
            );
            let _ = tx.send(failure);
        });

        let mut draining = self.draining.lock();
        draining.retain(|t| !t.is_finished());
        draining.push(task);
        rx
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        for slot in self.slots.lock().values() {
            slot.cancel.cancel();
        }
    }
}
