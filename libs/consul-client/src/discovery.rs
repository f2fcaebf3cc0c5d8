//! Service registration and resolution on top of the catalog.
//!
//! Consistency is eventual: a `resolve` issued right after a `register` from
//! another process may see the previous endpoint list. Reads report how far
//! behind the leader they are; anything older than `staleness_threshold` is
//! re-read with backoff and surfaces as [`DiscoveryError::ResolutionStale`]
//! only once the attempt budget is spent.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::error::ClientError;
use crate::model::{Endpoint, HealthStatus, ServiceRegistration};
use crate::retry::{RetryConfig, call_with_retry};
use crate::store::ServiceCatalog;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Oldest acceptable `last_contact` of a catalog read.
    #[serde(with = "humantime_serde")]
    pub staleness_threshold: Duration,
    /// Attempts for stale reads and for endpoint calls that fail to connect.
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(5),
            max_attempts: 3,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl DiscoveryConfig {
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_attempts.saturating_sub(1))
            .with_base_backoff(self.base_backoff)
            .with_max_backoff(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error(
        "catalog data for '{service}' stayed stale ({last_contact:?} behind the leader) after {attempts} attempts"
    )]
    ResolutionStale {
        service: String,
        last_contact: Duration,
        attempts: u32,
    },

    #[error("every endpoint of '{service}' disappeared before it could be used ({attempts} attempts)")]
    DeregistrationRace { service: String, attempts: u32 },

    #[error("no healthy endpoints registered for '{service}'")]
    NotFound { service: String },

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Outcome of the caller's closure in [`DiscoveryClient::with_endpoint`].
#[derive(Debug)]
pub enum CallError<E> {
    /// The endpoint could not be reached; it is dropped and the name
    /// re-resolved.
    Connect(String),
    /// The call reached the endpoint and failed; returned as is.
    Failed(E),
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointCallError<E> {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("call failed: {0}")]
    Call(E),
}

/// Discovery client over any [`ServiceCatalog`].
pub struct DiscoveryClient {
    catalog: Arc<dyn ServiceCatalog>,
    config: DiscoveryConfig,
    cursors: DashMap<String, usize>,
}

impl std::fmt::Debug for DiscoveryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DiscoveryClient {
    #[must_use]
    pub fn new(catalog: Arc<dyn ServiceCatalog>, config: DiscoveryConfig) -> Self {
        Self {
            catalog,
            config,
            cursors: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Publishes `endpoints` as the complete endpoint list of `name`.
    ///
    /// # Errors
    /// Returns [`DiscoveryError::Client`] if the catalog rejects the write.
    pub async fn register(
        &self,
        name: &str,
        endpoints: Vec<Endpoint>,
    ) -> Result<(), DiscoveryError> {
        self.register_with(ServiceRegistration::new(name, endpoints))
            .await
    }

    /// Like [`Self::register`], with explicit health and tags.
    ///
    /// # Errors
    /// Returns [`DiscoveryError::Client`] if the catalog rejects the write.
    pub async fn register_with(
        &self,
        mut registration: ServiceRegistration,
    ) -> Result<(), DiscoveryError> {
        registration.endpoints.sort();
        registration.endpoints.dedup();
        if registration.endpoints.is_empty() {
            return self.deregister(&registration.name).await;
        }

        let registration = &registration;
        call_with_retry(&self.config.retry_config(), "discovery.register", |_| {
            self.catalog.register_service(registration)
        })
        .await?;
        tracing::info!(
            service = %registration.name,
            endpoints = registration.endpoints.len(),
            "service registered"
        );
        Ok(())
    }

    /// Removes every endpoint of `name`. Removing an unknown name is a no-op.
    ///
    /// # Errors
    /// Returns [`DiscoveryError::Client`] if the catalog rejects the request.
    pub async fn deregister(&self, name: &str) -> Result<(), DiscoveryError> {
        let removed = call_with_retry(&self.config.retry_config(), "discovery.deregister", |_| {
            self.catalog.deregister_service(name)
        })
        .await?;
        self.cursors.remove(name);
        tracing::info!(service = %name, removed, "service deregistered");
        Ok(())
    }

    /// Healthy endpoints of `name`, sorted by host then port. An unknown
    /// name resolves to an empty list.
    ///
    /// # Errors
    /// - [`DiscoveryError::ResolutionStale`] when every read was too old
    /// - [`DiscoveryError::Client`] when the catalog cannot be queried
    pub async fn resolve(&self, name: &str) -> Result<Vec<Endpoint>, DiscoveryError> {
        let retry = self.config.retry_config();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let snapshot = call_with_retry(&retry, "discovery.resolve", |_| {
                self.catalog.query_service(name)
            })
            .await?;

            if !snapshot.is_stale(self.config.staleness_threshold) {
                let endpoints: BTreeSet<Endpoint> = snapshot
                    .nodes
                    .into_iter()
                    .filter(|n| n.health.is_serving())
                    .map(|n| n.endpoint)
                    .collect();
                return Ok(endpoints.into_iter().collect());
            }

            if attempt >= self.config.max_attempts {
                return Err(DiscoveryError::ResolutionStale {
                    service: name.to_owned(),
                    last_contact: snapshot.last_contact,
                    attempts: attempt,
                });
            }

            let backoff = retry.delay_for(attempt);
            tracing::debug!(
                service = %name,
                attempt,
                last_contact_ms = u64::try_from(snapshot.last_contact.as_millis()).unwrap_or(u64::MAX),
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                "stale catalog read, retrying"
            );
            sleep(backoff).await;
        }
    }

    /// Marks one endpoint of `name` with `status`. Critical endpoints drop
    /// out of [`Self::resolve`].
    ///
    /// # Errors
    /// Returns [`DiscoveryError::Client`] if the instance is unknown or the
    /// catalog rejects the update.
    pub async fn set_health(
        &self,
        name: &str,
        endpoint: &Endpoint,
        status: HealthStatus,
    ) -> Result<(), DiscoveryError> {
        call_with_retry(&self.config.retry_config(), "discovery.set_health", |_| {
            self.catalog.update_health(name, endpoint, status)
        })
        .await?;
        Ok(())
    }

    /// Resolves `name` and runs `call` against one of its endpoints, picked
    /// round-robin.
    ///
    /// When `call` reports [`CallError::Connect`], that endpoint is skipped
    /// and the name is re-resolved, up to `max_attempts` times.
    ///
    /// # Errors
    /// - [`DiscoveryError::NotFound`] if nothing is registered under `name`
    /// - [`DiscoveryError::DeregistrationRace`] if every endpoint tried was
    ///   gone by the time it was called
    /// - [`EndpointCallError::Call`] with the error of a call that connected
    pub async fn with_endpoint<T, E, F, Fut>(
        &self,
        name: &str,
        mut call: F,
    ) -> Result<T, EndpointCallError<E>>
    where
        F: FnMut(Endpoint) -> Fut,
        Fut: Future<Output = Result<T, CallError<E>>>,
    {
        let retry = self.config.retry_config();
        let mut failed: BTreeSet<Endpoint> = BTreeSet::new();
        let mut attempt: u32 = 0;

        while attempt < self.config.max_attempts {
            attempt += 1;

            let candidates: Vec<Endpoint> = self
                .resolve(name)
                .await?
                .into_iter()
                .filter(|ep| !failed.contains(ep))
                .collect();
            if candidates.is_empty() {
                if failed.is_empty() {
                    return Err(DiscoveryError::NotFound {
                        service: name.to_owned(),
                    }
                    .into());
                }
                break;
            }

            let endpoint = self.pick(name, &candidates);
            match call(endpoint.clone()).await {
                Ok(value) => return Ok(value),
                Err(CallError::Failed(err)) => return Err(EndpointCallError::Call(err)),
                Err(CallError::Connect(reason)) => {
                    tracing::warn!(
                        service = %name,
                        endpoint = %endpoint,
                        attempt,
                        reason = %reason,
                        "endpoint unreachable, re-resolving"
                    );
                    failed.insert(endpoint);
                    if attempt < self.config.max_attempts {
                        sleep(retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        Err(DiscoveryError::DeregistrationRace {
            service: name.to_owned(),
            attempts: attempt,
        }
        .into())
    }

    fn pick(&self, name: &str, candidates: &[Endpoint]) -> Endpoint {
        let mut cursor = self.cursors.entry(name.to_owned()).or_insert(0);
        let idx = *cursor % candidates.len();
        *cursor = cursor.wrapping_add(1);
        candidates[idx].clone()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;

    fn client(store: &Arc<InMemoryStore>) -> DiscoveryClient {
        DiscoveryClient::new(store.clone(), DiscoveryConfig::default())
    }

    #[tokio::test]
    async fn test_register_then_resolve_is_order_normalized() {
        let store = Arc::new(InMemoryStore::default());
        let discovery = client(&store);
        let endpoints = vec![
            Endpoint::new("10.0.0.2", 9000),
            Endpoint::new("10.0.0.1", 9001),
            Endpoint::new("10.0.0.1", 9000),
        ];
        discovery.register("echo", endpoints.clone()).await.unwrap();

        let mut expected = endpoints;
        expected.sort();
        assert_eq!(discovery.resolve("echo").await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_register_empty_list_deregisters() {
        let store = Arc::new(InMemoryStore::default());
        let discovery = client(&store);
        discovery
            .register("echo", vec![Endpoint::new("a", 1)])
            .await
            .unwrap();
        discovery.register("echo", Vec::new()).await.unwrap();
        assert!(discovery.resolve("echo").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_critical_endpoints_excluded() {
        let store = Arc::new(InMemoryStore::default());
        let discovery = client(&store);
        let a = Endpoint::new("a", 1);
        let b = Endpoint::new("b", 1);
        discovery
            .register("echo", vec![a.clone(), b.clone()])
            .await
            .unwrap();
        discovery
            .set_health("echo", &a, HealthStatus::Critical)
            .await
            .unwrap();
        assert_eq!(discovery.resolve("echo").await.unwrap(), vec![b.clone()]);

        discovery
            .set_health("echo", &a, HealthStatus::Warning)
            .await
            .unwrap();
        assert_eq!(discovery.resolve("echo").await.unwrap(), vec![a, b]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_reads_retried_transparently() {
        let store = Arc::new(InMemoryStore::default());
        let discovery = client(&store);
        discovery
            .register("echo", vec![Endpoint::new("a", 1)])
            .await
            .unwrap();
        store.set_staleness(Duration::from_secs(30), true, 2);
        assert_eq!(discovery.resolve("echo").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_staleness_surfaces() {
        let store = Arc::new(InMemoryStore::default());
        let discovery = client(&store);
        store.set_staleness(Duration::ZERO, false, 10);
        let err = discovery.resolve("echo").await.unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::ResolutionStale { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_with_endpoint_round_robin() {
        let store = Arc::new(InMemoryStore::default());
        let discovery = client(&store);
        discovery
            .register("echo", vec![Endpoint::new("a", 1), Endpoint::new("b", 1)])
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            let ep = discovery
                .with_endpoint("echo", |ep| async move { Ok::<_, CallError<()>>(ep) })
                .await
                .unwrap();
            seen.push(ep.host);
        }
        assert_eq!(seen, vec!["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn test_with_endpoint_unknown_service() {
        let store = Arc::new(InMemoryStore::default());
        let discovery = client(&store);
        let res = discovery
            .with_endpoint("ghost", |_| async { Ok::<_, CallError<()>>(()) })
            .await;
        assert!(matches!(
            res,
            Err(EndpointCallError::Discovery(DiscoveryError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_with_endpoint_passes_call_errors_through() {
        let store = Arc::new(InMemoryStore::default());
        let discovery = client(&store);
        discovery
            .register("echo", vec![Endpoint::new("a", 1)])
            .await
            .unwrap();
        let res: Result<(), _> = discovery
            .with_endpoint("echo", |_| async { Err(CallError::Failed("boom")) })
            .await;
        assert!(matches!(res, Err(EndpointCallError::Call("boom"))));
    }
}
