#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! On-demand Consul backing store for tests and dev runs.
//!
//! The pieces, leaf first:
//!
//! - [`runtime`]: starts a Consul agent in Docker (testcontainers) or as a
//!   local child process
//! - [`lifecycle::LifecycleManager`]: one instance per [`ScopeKey`],
//!   single-flight provisioning, readiness polling, teardown
//! - [`seeder::KvSeeder`]: writes bootstrap key/value data
//! - [`bridge::ConfigBridge`]: turns a ready instance into [`RuntimeConfig`]
//! - [`facade::DevServices`]: `with_backing_store` for test bodies
//!
//! ```no_run
//! use consul_devservices::{DevServices, DevServicesConfig};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let services = DevServices::builder(DevServicesConfig::load(None)?).build()?;
//! services
//!     .with_backing_store("integration", |store| async move {
//!         store.put("feature/enabled", "true").await?;
//!         Ok::<_, anyhow::Error>(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod clock;
pub mod config;
pub mod error;
pub mod facade;
pub mod instance;
pub mod lifecycle;
pub mod mode;
pub mod readiness;
pub mod runtime;
pub mod seeder;

pub use bridge::{ConfigBridge, RuntimeConfig};
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{DevServicesConfig, ReadinessConfig, RuntimeKind};
pub use error::DevServicesError;
pub use facade::{DevServices, DevServicesBuilder, StoreHandle};
pub use instance::{BackingStoreInstance, InstanceId, LifecycleState, ScopeKey};
pub use lifecycle::LifecycleManager;
pub use mode::DevMode;
pub use readiness::{BackoffPolicy, ConsulReadinessProbe, ReadinessProbe};
pub use runtime::{ContainerHandle, ContainerRuntime, ContainerSpec, LocalProcessRuntime};
#[cfg(feature = "docker")]
pub use runtime::DockerRuntime;
pub use seeder::{KvSeeder, SeedReport, parse_seed_lines};
