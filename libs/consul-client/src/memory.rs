//! In-process backing store.
//!
//! Same observable semantics as the Consul client: monotonically increasing
//! revisions, last-write-wins registration, health reported per instance.
//! Fault knobs let tests reproduce stale reads, lagging deregistration,
//! rejected writes and an unreachable store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::ClientError;
use crate::model::{
    CatalogSnapshot, Endpoint, HealthStatus, KvEntry, ServiceNode, ServiceRegistration,
    normalize_key, service_instance_id,
};
use crate::store::{BackingStore, KvStore, ServiceCatalog, StoreConnector};

#[derive(Debug, Clone, Copy)]
struct Staleness {
    last_contact: Duration,
    known_leader: bool,
    remaining: usize,
}

#[derive(Debug)]
pub struct InMemoryStore {
    endpoint: Endpoint,
    index: AtomicU64,
    kv: DashMap<String, (Vec<u8>, u64)>,
    services: RwLock<BTreeMap<String, BTreeMap<String, ServiceNode>>>,
    leader: RwLock<Option<String>>,
    unavailable: AtomicBool,
    staleness: Mutex<Option<Staleness>>,
    // Instances that keep showing up in queries after deregistration.
    lagging: Mutex<HashMap<String, (Vec<ServiceNode>, usize)>>,
    deregistration_lag: Mutex<usize>,
    write_failures: Mutex<HashMap<String, ClientError>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(Endpoint::new("127.0.0.1", 8500))
    }
}

impl InMemoryStore {
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            index: AtomicU64::new(0),
            kv: DashMap::new(),
            services: RwLock::new(BTreeMap::new()),
            leader: RwLock::new(Some("127.0.0.1:8300".to_owned())),
            unavailable: AtomicBool::new(false),
            staleness: Mutex::new(None),
            lagging: Mutex::new(HashMap::new()),
            deregistration_lag: Mutex::new(0),
            write_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Makes every call fail with a connection error until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_leader(&self, leader: Option<String>) {
        *self.leader.write() = leader;
    }

    /// The next `queries` catalog reads report `last_contact` (and, with
    /// `known_leader == false`, a missing leader).
    pub fn set_staleness(&self, last_contact: Duration, known_leader: bool, queries: usize) {
        *self.staleness.lock() = Some(Staleness {
            last_contact,
            known_leader,
            remaining: queries,
        });
    }

    /// After each deregistration, the removed instances stay visible for the
    /// next `queries` catalog reads of that service.
    pub fn set_deregistration_lag(&self, queries: usize) {
        *self.deregistration_lag.lock() = queries;
    }

    /// Writes to `key` fail with `error` until [`Self::clear_write_failures`].
    pub fn inject_write_failure(&self, key: &str, error: ClientError) {
        self.write_failures
            .lock()
            .insert(normalize_key(key).to_owned(), error);
    }

    pub fn clear_write_failures(&self) {
        self.write_failures.lock().clear();
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        self.kv.len()
    }

    fn next_index(&self) -> u64 {
        self.index.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn ensure_available(&self) -> Result<(), ClientError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ClientError::Connect {
                url: self.endpoint.http_url(),
                message: "store unavailable".to_owned(),
            });
        }
        Ok(())
    }
}

fn key_or_error(key: &str) -> Result<&str, ClientError> {
    let key = normalize_key(key);
    if key.is_empty() {
        return Err(ClientError::InvalidKey {
            key: key.to_owned(),
            reason: "key must not be empty".to_owned(),
        });
    }
    Ok(key)
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn read_key(&self, key: &str) -> Result<Option<KvEntry>, ClientError> {
        self.ensure_available()?;
        let key = key_or_error(key)?;
        Ok(self.kv.get(key).map(|e| KvEntry {
            key: key.to_owned(),
            value: e.0.clone(),
            revision: e.1,
        }))
    }

    async fn write_key(&self, key: &str, value: &[u8]) -> Result<u64, ClientError> {
        self.ensure_available()?;
        let key = key_or_error(key)?;
        if let Some(err) = self.write_failures.lock().get(key) {
            return Err(err.clone());
        }
        let revision = self.next_index();
        self.kv.insert(key.to_owned(), (value.to_vec(), revision));
        Ok(revision)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), ClientError> {
        self.ensure_available()?;
        let prefix = normalize_key(prefix);
        if prefix.is_empty() {
            return Err(ClientError::InvalidKey {
                key: String::new(),
                reason: "refusing to delete the whole keyspace".to_owned(),
            });
        }
        self.kv.retain(|k, _| !k.starts_with(prefix));
        self.next_index();
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ClientError> {
        self.ensure_available()?;
        let prefix = normalize_key(prefix);
        let mut keys: Vec<String> = self
            .kv
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl ServiceCatalog for InMemoryStore {
    async fn register_service(
        &self,
        registration: &ServiceRegistration,
    ) -> Result<(), ClientError> {
        self.ensure_available()?;
        if registration.name.is_empty() {
            return Err(ClientError::InvalidService {
                name: String::new(),
                reason: "service names must be non-empty".to_owned(),
            });
        }
        let instances = registration
            .endpoints
            .iter()
            .map(|endpoint| {
                let id = service_instance_id(&registration.name, endpoint);
                let node = ServiceNode {
                    service_id: id.clone(),
                    endpoint: endpoint.clone(),
                    health: registration.health,
                };
                (id, node)
            })
            .collect();
        self.services
            .write()
            .insert(registration.name.clone(), instances);
        self.lagging.lock().remove(&registration.name);
        self.next_index();
        Ok(())
    }

    async fn deregister_service(&self, name: &str) -> Result<usize, ClientError> {
        self.ensure_available()?;
        let removed = self.services.write().remove(name).unwrap_or_default();
        let lag = *self.deregistration_lag.lock();
        if lag > 0 && !removed.is_empty() {
            self.lagging
                .lock()
                .insert(name.to_owned(), (removed.values().cloned().collect(), lag));
        }
        self.next_index();
        Ok(removed.len())
    }

    async fn query_service(&self, name: &str) -> Result<CatalogSnapshot, ClientError> {
        self.ensure_available()?;

        let mut nodes: Vec<ServiceNode> = self
            .services
            .read()
            .get(name)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();

        {
            let mut lagging = self.lagging.lock();
            if let Some((ghosts, remaining)) = lagging.get_mut(name) {
                nodes.extend(ghosts.iter().cloned());
                *remaining -= 1;
                if *remaining == 0 {
                    lagging.remove(name);
                }
            }
        }

        let mut snapshot = CatalogSnapshot::fresh(nodes, self.index.load(Ordering::SeqCst));
        let mut staleness = self.staleness.lock();
        if let Some(stale) = staleness.as_mut() {
            snapshot.last_contact = stale.last_contact;
            snapshot.known_leader = stale.known_leader;
            stale.remaining = stale.remaining.saturating_sub(1);
            if stale.remaining == 0 {
                *staleness = None;
            }
        }
        Ok(snapshot)
    }

    async fn update_health(
        &self,
        name: &str,
        endpoint: &Endpoint,
        status: HealthStatus,
    ) -> Result<(), ClientError> {
        self.ensure_available()?;
        let id = service_instance_id(name, endpoint);
        let mut services = self.services.write();
        let node = services
            .get_mut(name)
            .and_then(|m| m.get_mut(&id))
            .ok_or_else(|| ClientError::Status {
                method: "PUT".to_owned(),
                url: format!("memory://check/service:{id}"),
                status: 404,
                body: format!("unknown check 'service:{id}'"),
            })?;
        node.health = status;
        drop(services);
        self.next_index();
        Ok(())
    }
}

#[async_trait]
impl BackingStore for InMemoryStore {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn leader(&self) -> Result<Option<String>, ClientError> {
        self.ensure_available()?;
        Ok(self.leader.read().clone())
    }
}

/// Hands out one shared [`InMemoryStore`] per endpoint.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    stores: DashMap<Endpoint, Arc<InMemoryStore>>,
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The store behind `endpoint`, created on first use.
    #[must_use]
    pub fn store_for(&self, endpoint: &Endpoint) -> Arc<InMemoryStore> {
        self.stores
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(InMemoryStore::new(endpoint.clone())))
            .clone()
    }

    /// Forgets the store behind `endpoint`, as if its container was removed.
    pub fn drop_store(&self, endpoint: &Endpoint) {
        self.stores.remove(endpoint);
    }
}

impl StoreConnector for MemoryConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn BackingStore>, ClientError> {
        Ok(self.store_for(endpoint))
    }
}
