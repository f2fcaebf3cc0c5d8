//! Seams between the bootstrap engine and the backing store.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::model::{CatalogSnapshot, Endpoint, HealthStatus, KvEntry, ServiceRegistration};

/// Key/value half of the backing store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Reads one key. A missing key is `Ok(None)`, not an error.
    async fn read_key(&self, key: &str) -> Result<Option<KvEntry>, ClientError>;

    /// Upserts one key and returns the revision it was written at.
    async fn write_key(&self, key: &str, value: &[u8]) -> Result<u64, ClientError>;

    /// Deletes every key under `prefix`. Deleting nothing is not an error.
    async fn delete_prefix(&self, prefix: &str) -> Result<(), ClientError>;

    /// Keys under `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ClientError>;
}

/// Service catalog half of the backing store.
#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    /// Publishes all endpoints of `registration`, replacing whatever the
    /// catalog held for that name.
    async fn register_service(&self, registration: &ServiceRegistration)
    -> Result<(), ClientError>;

    /// Removes every instance of `name`; returns how many were removed.
    async fn deregister_service(&self, name: &str) -> Result<usize, ClientError>;

    /// All instances of `name`, healthy or not, with consistency metadata.
    async fn query_service(&self, name: &str) -> Result<CatalogSnapshot, ClientError>;

    /// Sets the health of one registered instance.
    async fn update_health(
        &self,
        name: &str,
        endpoint: &Endpoint,
        status: HealthStatus,
    ) -> Result<(), ClientError>;
}

/// A connected backing store: both halves plus liveness.
#[async_trait]
pub trait BackingStore: KvStore + ServiceCatalog {
    fn endpoint(&self) -> &Endpoint;

    /// Address of the current cluster leader, `None` while no leader is
    /// elected yet.
    async fn leader(&self) -> Result<Option<String>, ClientError>;
}

/// Builds store clients for endpoints that become known at runtime.
pub trait StoreConnector: Send + Sync {
    /// # Errors
    /// Returns an error if the client cannot be constructed.
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn BackingStore>, ClientError>;
}
