//! Turns a ready instance into the configuration the application reads.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::str::FromStr;

use consul_client::Endpoint;

use crate::config::DevServicesConfig;
use crate::error::DevServicesError;
use crate::instance::{BackingStoreInstance, InstanceId};

pub const CONSUL_HOST: &str = "consul.host";
pub const CONSUL_PORT: &str = "consul.port";
pub const PIPELINE_CONSUL_HOST: &str = "pipeline.consul.host";
pub const PIPELINE_CONSUL_PORT: &str = "pipeline.consul.port";
pub const AGENT_HOST_PORT: &str = "consul-config.agent.host-port";
pub const CONFIG_ENABLED: &str = "consul-config.enabled";
pub const PROPERTIES_VALUE_KEYS: &str = "consul-config.properties-value-keys";
pub const FAIL_ON_MISSING_KEY: &str = "consul-config.fail-on-missing-key";
pub const DEVSERVICES_ENABLED: &str = "devservices.consul.enabled";
pub const DEVSERVICES_LOG_LEVEL: &str = "devservices.consul.log-level";
pub const DEVSERVICES_SCOPE: &str = "devservices.consul.scope";
pub const DEVSERVICES_INSTANCE_ID: &str = "devservices.consul.instance-id";
pub const DEVSERVICES_GENERATION: &str = "devservices.consul.generation";

/// KV key the application loads its properties from.
pub const APPLICATION_CONFIG_KEY: &str = "config/application";

/// Immutable snapshot of runtime configuration built from one instance.
///
/// A restarted scope yields a new value with a higher generation; existing
/// snapshots never change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    values: BTreeMap<String, String>,
    generation: u64,
    instance_id: InstanceId,
}

impl RuntimeConfig {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Parses the value of `key`; `None` if it is missing or does not parse.
    #[must_use]
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key)?.parse().ok()
    }

    /// The store endpoint the snapshot points at.
    #[must_use]
    pub fn endpoint(&self) -> Option<Endpoint> {
        Some(Endpoint::new(
            self.get(CONSUL_HOST)?,
            self.get_parsed(CONSUL_PORT)?,
        ))
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `KEY=value` pairs for child processes: `consul-config.agent.host-port`
    /// becomes `CONSUL_CONFIG_AGENT_HOST_PORT`.
    #[must_use]
    pub fn to_env(&self) -> Vec<(String, String)> {
        self.iter()
            .map(|(k, v)| (env_key(k), v.to_owned()))
            .collect()
    }
}

impl<'a> IntoIterator for &'a RuntimeConfig {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '.' | '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

/// Builds [`RuntimeConfig`] snapshots from ready instances.
#[derive(Debug, Clone, Default)]
pub struct ConfigBridge {
    defaults: BTreeMap<String, String>,
    log_level: String,
}

impl ConfigBridge {
    #[must_use]
    pub fn new(defaults: BTreeMap<String, String>, log_level: impl Into<String>) -> Self {
        Self {
            defaults,
            log_level: log_level.into(),
        }
    }

    #[must_use]
    pub fn from_config(cfg: &DevServicesConfig) -> Self {
        Self::new(cfg.defaults.clone(), cfg.log_level.clone())
    }

    /// Does not touch the network.
    ///
    /// # Errors
    /// [`DevServicesError::NotReady`] unless `instance` is Ready.
    pub fn materialize(
        &self,
        instance: &BackingStoreInstance,
    ) -> Result<RuntimeConfig, DevServicesError> {
        let endpoint = instance.ready_endpoint()?;
        let port = endpoint.port.to_string();

        let mut values = self.defaults.clone();
        let derived = [
            (CONSUL_HOST, endpoint.host.clone()),
            (PIPELINE_CONSUL_HOST, endpoint.host.clone()),
            (CONSUL_PORT, port.clone()),
            (PIPELINE_CONSUL_PORT, port),
            (AGENT_HOST_PORT, endpoint.host_port()),
            (CONFIG_ENABLED, "true".to_owned()),
            (PROPERTIES_VALUE_KEYS, APPLICATION_CONFIG_KEY.to_owned()),
            (FAIL_ON_MISSING_KEY, "false".to_owned()),
            (DEVSERVICES_ENABLED, "true".to_owned()),
            (DEVSERVICES_LOG_LEVEL, self.log_level.clone()),
            (DEVSERVICES_SCOPE, instance.scope().to_string()),
            (DEVSERVICES_INSTANCE_ID, instance.id().to_string()),
            (DEVSERVICES_GENERATION, instance.generation().to_string()),
        ];
        values.extend(derived.map(|(k, v)| (k.to_owned(), v)));

        Ok(RuntimeConfig {
            values,
            generation: instance.generation(),
            instance_id: instance.id(),
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::instance::{LifecycleState, ScopeKey};

    fn ready(port: u16, generation: u64) -> BackingStoreInstance {
        let inst = BackingStoreInstance::starting(ScopeKey::new("bridge"), generation);
        inst.attach_container("c".to_owned(), Endpoint::new("localhost", port));
        inst.transition(LifecycleState::Ready);
        inst
    }

    #[test]
    fn test_materialize_exposes_endpoint() {
        let bridge = ConfigBridge::new(BTreeMap::new(), "INFO");
        let cfg = bridge.materialize(&ready(18500, 1)).unwrap();

        assert_eq!(cfg.get(CONSUL_HOST), Some("localhost"));
        assert_eq!(cfg.get_parsed::<u16>(CONSUL_PORT), Some(18500));
        assert_eq!(cfg.get(PIPELINE_CONSUL_PORT), Some("18500"));
        assert_eq!(cfg.get(AGENT_HOST_PORT), Some("localhost:18500"));
        assert_eq!(cfg.get(PROPERTIES_VALUE_KEYS), Some("config/application"));
        assert_eq!(cfg.get(DEVSERVICES_SCOPE), Some("bridge"));
        assert_eq!(cfg.endpoint(), Some(Endpoint::new("localhost", 18500)));
        assert_eq!(cfg.generation(), 1);
    }

    #[test]
    fn test_derived_keys_override_defaults() {
        let defaults = BTreeMap::from([
            (CONSUL_PORT.to_owned(), "1".to_owned()),
            ("app.name".to_owned(), "echo".to_owned()),
        ]);
        let cfg = ConfigBridge::new(defaults, "DEBUG")
            .materialize(&ready(18500, 1))
            .unwrap();
        assert_eq!(cfg.get(CONSUL_PORT), Some("18500"));
        assert_eq!(cfg.get("app.name"), Some("echo"));
        assert_eq!(cfg.get(DEVSERVICES_LOG_LEVEL), Some("DEBUG"));
    }

    #[test]
    fn test_restart_yields_new_snapshot() {
        let bridge = ConfigBridge::default();
        let before = bridge.materialize(&ready(18500, 1)).unwrap();
        let after = bridge.materialize(&ready(18600, 2)).unwrap();
        assert_eq!(before.get(CONSUL_PORT), Some("18500"));
        assert_eq!(after.get(CONSUL_PORT), Some("18600"));
        assert!(after.generation() > before.generation());
    }

    #[test]
    fn test_not_ready_instance_is_rejected() {
        let inst = BackingStoreInstance::starting(ScopeKey::new("bridge"), 1);
        let err = ConfigBridge::default().materialize(&inst).unwrap_err();
        assert!(matches!(err, DevServicesError::NotReady { .. }));
    }

    #[test]
    fn test_env_rendering() {
        let cfg = ConfigBridge::default().materialize(&ready(18500, 1)).unwrap();
        let env = cfg.to_env();
        assert!(env.contains(&("CONSUL_HOST".to_owned(), "localhost".to_owned())));
        assert!(env.contains(&(
            "CONSUL_CONFIG_AGENT_HOST_PORT".to_owned(),
            "localhost:18500".to_owned()
        )));
    }
}
