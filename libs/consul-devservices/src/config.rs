//! Dev services configuration.
//!
//! Layered with figment: defaults, then an optional YAML file, then
//! `CONSUL_DEVSERVICES__*` environment variables (`__` separates nesting
//! levels, e.g. `CONSUL_DEVSERVICES__READINESS__MAX_ATTEMPTS=10`). CLI
//! overrides are applied by the caller on the loaded value.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use consul_client::{ClientConfig, DiscoveryConfig, KvEntry};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

use crate::error::DevServicesError;

pub const ENV_PREFIX: &str = "CONSUL_DEVSERVICES__";

/// Port Consul listens on inside the container.
pub const CONSUL_HTTP_PORT: u16 = 8500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Generic `hashicorp/consul` container through testcontainers.
    #[default]
    Docker,
    /// A local `consul agent -dev` child process.
    LocalProcess,
}

/// Readiness polling budget. The overall deadline is
/// [`DevServicesConfig::startup_timeout`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessConfig {
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    pub max_attempts: u32,
    /// Bound on a single probe (TCP connect plus leader query).
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            max_attempts: 60,
            probe_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DevServicesConfig {
    pub enabled: bool,
    pub image_name: String,
    pub image_tag: String,
    /// Fixed host port; a free one is picked when unset.
    pub port: Option<u16>,
    /// Consul agent log level (`TRACE`, `DEBUG`, `INFO`, `WARN`, `ERROR`).
    pub log_level: String,
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
    pub runtime: RuntimeKind,
    /// Binary used by [`RuntimeKind::LocalProcess`].
    pub consul_binary: PathBuf,
    pub readiness: ReadinessConfig,
    pub client: ClientConfig,
    pub discovery: DiscoveryConfig,
    /// Written into every fresh instance, in key order.
    pub seed_data: BTreeMap<String, String>,
    /// Static runtime config values; instance-derived keys override them.
    pub defaults: BTreeMap<String, String>,
    /// Per-test KV namespaces are named `<namespace_prefix>-<test>-<millis>-<n>`.
    pub namespace_prefix: String,
    /// Delete a test's KV namespace when its body exits.
    pub namespace_cleanup: bool,
}

impl Default for DevServicesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image_name: "hashicorp/consul".to_owned(),
            image_tag: "1.21".to_owned(),
            port: None,
            log_level: "INFO".to_owned(),
            startup_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            runtime: RuntimeKind::Docker,
            consul_binary: PathBuf::from("consul"),
            readiness: ReadinessConfig::default(),
            client: ClientConfig::default(),
            discovery: DiscoveryConfig::default(),
            seed_data: BTreeMap::new(),
            defaults: BTreeMap::new(),
            namespace_prefix: "tests".to_owned(),
            namespace_cleanup: true,
        }
    }
}

impl DevServicesConfig {
    /// Defaults, then `path` (if given), then the environment.
    #[must_use]
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// # Errors
    /// Returns [`DevServicesError::Config`] if the file is missing or any
    /// layer does not deserialize.
    pub fn load(path: Option<&Path>) -> Result<Self, DevServicesError> {
        if let Some(p) = path
            && !p.is_file()
        {
            return Err(DevServicesError::Config(format!(
                "config file does not exist: {}",
                p.display()
            )));
        }
        Self::from_figment(&Self::figment(path))
    }

    /// # Errors
    /// Returns [`DevServicesError::Config`] on invalid values.
    pub fn from_figment(figment: &Figment) -> Result<Self, DevServicesError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`DevServicesError::Config`] describing the first bad value.
    pub fn validate(&self) -> Result<(), DevServicesError> {
        if self.image_name.trim().is_empty() || self.image_tag.trim().is_empty() {
            return Err(DevServicesError::Config(
                "image_name and image_tag must not be empty".to_owned(),
            ));
        }
        if self.readiness.max_attempts == 0 {
            return Err(DevServicesError::Config(
                "readiness.max_attempts must be at least 1".to_owned(),
            ));
        }
        if self.startup_timeout.is_zero() {
            return Err(DevServicesError::Config(
                "startup_timeout must be greater than zero".to_owned(),
            ));
        }
        if self.discovery.max_attempts == 0 {
            return Err(DevServicesError::Config(
                "discovery.max_attempts must be at least 1".to_owned(),
            ));
        }
        if !matches!(
            self.log_level.to_ascii_uppercase().as_str(),
            "TRACE" | "DEBUG" | "INFO" | "WARN" | "ERROR"
        ) {
            return Err(DevServicesError::Config(format!(
                "unsupported log_level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }

    /// `image_name:image_tag`
    #[must_use]
    pub fn image(&self) -> String {
        format!("{}:{}", self.image_name, self.image_tag)
    }

    /// Seed data as KV entries, in key order.
    #[must_use]
    pub fn seed_entries(&self) -> Vec<KvEntry> {
        self.seed_data
            .iter()
            .map(|(k, v)| KvEntry::new(k.as_str(), v.as_bytes()))
            .collect()
    }
}
