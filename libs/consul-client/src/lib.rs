#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Consul client for dev services.
//!
//! The crate exposes the four operation categories the bootstrap engine needs
//! from the backing store (read-key, write-key, register-service,
//! query-service) behind the [`KvStore`] and [`ServiceCatalog`] traits, with
//! two implementations:
//!
//! - [`ConsulClient`]: the Consul HTTP API v1 over `reqwest`
//! - [`InMemoryStore`]: an in-process store with the same semantics, used by
//!   unit tests and by runs that do not need a real container
//!
//! On top of the catalog sits the [`DiscoveryClient`], which resolves service
//! names to healthy endpoints and hides stale reads behind a bounded retry.

pub mod config;
pub mod discovery;
pub mod error;
pub mod http;
pub mod memory;
pub mod model;
pub mod retry;
pub mod store;

pub use config::ClientConfig;
pub use discovery::{CallError, DiscoveryClient, DiscoveryConfig, DiscoveryError, EndpointCallError};
pub use error::ClientError;
pub use http::{ConsulClient, ConsulConnector};
pub use memory::{InMemoryStore, MemoryConnector};
pub use model::{
    CatalogSnapshot, Endpoint, HealthStatus, KvEntry, ParseEndpointError, ServiceNode,
    ServiceRegistration,
};
pub use retry::{RetryClass, RetryConfig, call_with_retry};
pub use store::{BackingStore, KvStore, ServiceCatalog, StoreConnector};
