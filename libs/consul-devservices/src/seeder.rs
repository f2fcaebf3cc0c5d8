//! Bootstrap data writer.

use std::collections::BTreeMap;
use std::sync::Arc;

use consul_client::{KvEntry, KvStore, StoreConnector};

use crate::error::DevServicesError;
use crate::instance::BackingStoreInstance;

/// Outcome of a completed seed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub written: usize,
    /// Revision each key was written at.
    pub revisions: BTreeMap<String, u64>,
}

/// Writes bootstrap key/value entries into a ready backing store.
///
/// Entries are upserted one at a time in the order given; re-running the same
/// entries leaves the store in the same state. Each entry is written once and
/// the first failure, transient or not, stops the run.
pub struct KvSeeder {
    connector: Arc<dyn StoreConnector>,
}

impl KvSeeder {
    #[must_use]
    pub fn new(connector: Arc<dyn StoreConnector>) -> Self {
        Self { connector }
    }

    /// # Errors
    /// [`DevServicesError::NotReady`] if `instance` is not Ready,
    /// [`DevServicesError::SeedFailure`] on the first entry that cannot be
    /// written.
    pub async fn seed(
        &self,
        instance: &BackingStoreInstance,
        entries: &[KvEntry],
    ) -> Result<SeedReport, DevServicesError> {
        let endpoint = instance.ready_endpoint()?;
        let store = self.connector.connect(&endpoint)?;

        tracing::info!(
            scope = %instance.scope(),
            instance_id = %instance.id(),
            entries = entries.len(),
            "Seeding backing store"
        );
        self.seed_store(store.as_ref(), entries).await
    }

    /// Seeds an already connected store.
    ///
    /// # Errors
    /// [`DevServicesError::SeedFailure`] on the first entry that cannot be
    /// written.
    pub async fn seed_store(
        &self,
        store: &dyn KvStore,
        entries: &[KvEntry],
    ) -> Result<SeedReport, DevServicesError> {
        let mut report = SeedReport::default();

        for entry in entries {
            match store.write_key(&entry.key, &entry.value).await {
                Ok(revision) => {
                    tracing::debug!(key = %entry.key, revision, "seeded key");
                    report.written += 1;
                    report.revisions.insert(entry.key.clone(), revision);
                }
                Err(cause) => {
                    tracing::warn!(
                        key = %entry.key,
                        written = report.written,
                        error = %cause,
                        "seeding aborted"
                    );
                    return Err(DevServicesError::SeedFailure {
                        key: entry.key.clone(),
                        written: report.written,
                        cause,
                    });
                }
            }
        }

        Ok(report)
    }
}

/// Parses `key=value` lines. Blank lines and `#` comments are skipped; the
/// value is everything after the first `=`.
///
/// # Errors
/// Returns [`DevServicesError::Config`] naming the first malformed line.
pub fn parse_seed_lines(text: &str) -> Result<Vec<KvEntry>, DevServicesError> {
    let mut entries = Vec::new();
    for (n, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(DevServicesError::Config(format!(
                "seed line {} is not key=value: '{line}'",
                n + 1
            )));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(DevServicesError::Config(format!(
                "seed line {} has an empty key",
                n + 1
            )));
        }
        entries.push(KvEntry::new(key, value.trim().as_bytes()));
    }
    Ok(entries)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::instance::{LifecycleState, ScopeKey};
    use async_trait::async_trait;
    use consul_client::{ClientError, Endpoint, InMemoryStore, MemoryConnector};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first write with a connection error, then delegates.
    struct FlakyStore {
        inner: InMemoryStore,
        writes: AtomicU32,
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn read_key(&self, key: &str) -> Result<Option<KvEntry>, ClientError> {
            self.inner.read_key(key).await
        }

        async fn write_key(&self, key: &str, value: &[u8]) -> Result<u64, ClientError> {
            if self.writes.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ClientError::Connect {
                    url: "http://127.0.0.1:8500".to_owned(),
                    message: "connection reset".to_owned(),
                });
            }
            self.inner.write_key(key, value).await
        }

        async fn delete_prefix(&self, prefix: &str) -> Result<(), ClientError> {
            self.inner.delete_prefix(prefix).await
        }

        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ClientError> {
            self.inner.list_keys(prefix).await
        }
    }

    fn ready_instance(endpoint: &Endpoint) -> BackingStoreInstance {
        let inst = BackingStoreInstance::starting(ScopeKey::new("seed"), 1);
        inst.attach_container("c1".to_owned(), endpoint.clone());
        inst.transition(LifecycleState::Ready);
        inst
    }

    fn entries() -> Vec<KvEntry> {
        vec![
            KvEntry::new("svc/config", "v1"),
            KvEntry::new("svc/flag", "on"),
            KvEntry::new("svc/limits/max", "10"),
        ]
    }

    #[tokio::test]
    async fn test_seed_then_read_back() {
        let connector = Arc::new(MemoryConnector::new());
        let endpoint = Endpoint::new("127.0.0.1", 18500);
        let seeder = KvSeeder::new(connector.clone());

        let report = seeder.seed(&ready_instance(&endpoint), &entries()).await.unwrap();
        assert_eq!(report.written, 3);

        let store = connector.store_for(&endpoint);
        let entry = store.read_key("svc/flag").await.unwrap().unwrap();
        assert_eq!(entry.value_str(), Some("on"));
        assert_eq!(report.revisions["svc/flag"], entry.revision);
    }

    #[tokio::test]
    async fn test_reseed_is_idempotent() {
        let store = InMemoryStore::default();
        let seeder = KvSeeder::new(Arc::new(MemoryConnector::new()));

        seeder.seed_store(&store, &entries()).await.unwrap();
        seeder.seed_store(&store, &entries()).await.unwrap();
        assert_eq!(store.key_count(), 3);
        assert_eq!(
            store.read_key("svc/config").await.unwrap().unwrap().value_str(),
            Some("v1")
        );
    }

    #[tokio::test]
    async fn test_first_failure_aborts_with_progress() {
        let store = InMemoryStore::default();
        store.inject_write_failure(
            "svc/flag",
            ClientError::WriteRejected {
                key: "svc/flag".to_owned(),
            },
        );
        let seeder = KvSeeder::new(Arc::new(MemoryConnector::new()));

        let err = seeder.seed_store(&store, &entries()).await.unwrap_err();
        match err {
            DevServicesError::SeedFailure { key, written, .. } => {
                assert_eq!(key, "svc/flag");
                assert_eq!(written, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.read_key("svc/limits/max").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_write_error_is_not_retried() {
        let store = FlakyStore {
            inner: InMemoryStore::default(),
            writes: AtomicU32::new(0),
        };
        let seeder = KvSeeder::new(Arc::new(MemoryConnector::new()));

        let err = seeder.seed_store(&store, &entries()).await.unwrap_err();
        match err {
            DevServicesError::SeedFailure {
                key,
                written,
                cause,
            } => {
                assert_eq!(key, "svc/config");
                assert_eq!(written, 0);
                assert!(matches!(cause, ClientError::Connect { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.key_count(), 0);
    }

    #[tokio::test]
    async fn test_refuses_instance_that_is_not_ready() {
        let seeder = KvSeeder::new(Arc::new(MemoryConnector::new()));
        let inst = BackingStoreInstance::starting(ScopeKey::new("seed"), 1);
        let err = seeder.seed(&inst, &entries()).await.unwrap_err();
        assert!(matches!(err, DevServicesError::NotReady { .. }));
    }

    #[test]
    fn test_parse_seed_lines() {
        let parsed = parse_seed_lines(
            "# bootstrap\nconfig/application = a=1\n\nsvc/flag=on\n",
        )
        .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].key, "config/application");
        assert_eq!(parsed[0].value_str(), Some("a=1"));
        assert!(parse_seed_lines("no-separator").is_err());
        assert!(parse_seed_lines("=value").is_err());
    }
}
