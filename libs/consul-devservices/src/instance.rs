//! Identity and state of a provisioned backing store.

use std::fmt;

use consul_client::Endpoint;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::error::DevServicesError;
use crate::seeder::SeedReport;

/// Bounded lifetime across which one backing store instance is shared,
/// e.g. a test run or a single process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeKey(String);

impl ScopeKey {
    #[must_use]
    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScopeKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ScopeKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&ScopeKey> for ScopeKey {
    fn from(s: &ScopeKey) -> Self {
        s.clone()
    }
}

/// Unique, time-ordered id of one provisioned instance (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// `Unstarted → Starting → Ready → {Stopped | Failed}`; `Starting` may also
/// go straight to `Failed`. Nothing leaves `Stopped` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unstarted,
    Starting,
    Ready,
    Failed,
    Stopped,
}

impl LifecycleState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }

    const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unstarted, Self::Starting)
                | (Self::Starting, Self::Ready | Self::Failed)
                | (Self::Ready, Self::Stopped | Self::Failed)
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One backing store container as seen by everyone except its owner.
///
/// The lifecycle manager drives the state; all other holders only read the
/// endpoint and state.
#[derive(Debug)]
pub struct BackingStoreInstance {
    id: InstanceId,
    scope: ScopeKey,
    generation: u64,
    state: RwLock<LifecycleState>,
    endpoint: RwLock<Option<Endpoint>>,
    container_id: RwLock<Option<String>>,
    pub(crate) seeded: OnceCell<Result<SeedReport, DevServicesError>>,
}

impl BackingStoreInstance {
    pub(crate) fn starting(scope: ScopeKey, generation: u64) -> Self {
        Self {
            id: InstanceId::new(),
            scope,
            generation,
            state: RwLock::new(LifecycleState::Starting),
            endpoint: RwLock::new(None),
            container_id: RwLock::new(None),
            seeded: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> InstanceId {
        self.id
    }

    #[must_use]
    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    /// 1 for the first instance of a scope, incremented on every
    /// re-provisioning.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    /// Endpoint reported by the container runtime, known from container start
    /// on. Use [`Self::ready_endpoint`] to talk to the store.
    #[must_use]
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.read().clone()
    }

    #[must_use]
    pub fn container_id(&self) -> Option<String> {
        self.container_id.read().clone()
    }

    /// # Errors
    /// Returns [`DevServicesError::NotReady`] unless the instance is Ready.
    pub fn ready_endpoint(&self) -> Result<Endpoint, DevServicesError> {
        let state = self.state.read();
        match (*state, self.endpoint.read().as_ref()) {
            (LifecycleState::Ready, Some(endpoint)) => Ok(endpoint.clone()),
            (state, _) => Err(self.not_ready(state)),
        }
    }

    pub(crate) fn not_ready(&self, state: LifecycleState) -> DevServicesError {
        DevServicesError::NotReady {
            scope: self.scope.clone(),
            instance_id: self.id,
            state,
        }
    }

    pub(crate) fn attach_container(&self, container_id: String, endpoint: Endpoint) {
        *self.container_id.write() = Some(container_id);
        *self.endpoint.write() = Some(endpoint);
    }

    /// Applies `next` if the transition is legal; returns whether it was.
    pub(crate) fn transition(&self, next: LifecycleState) -> bool {
        let mut state = self.state.write();
        if state.can_become(next) {
            tracing::debug!(
                scope = %self.scope,
                instance_id = %self.id,
                from = %*state,
                to = %next,
                "instance state change"
            );
            *state = next;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        let inst = BackingStoreInstance::starting(ScopeKey::new("a"), 1);
        assert_eq!(inst.state(), LifecycleState::Starting);
        assert!(!inst.transition(LifecycleState::Stopped));
        assert!(inst.transition(LifecycleState::Ready));
        assert!(inst.transition(LifecycleState::Stopped));
        assert!(!inst.transition(LifecycleState::Ready));
        assert!(!inst.transition(LifecycleState::Failed));
        assert_eq!(inst.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_ready_endpoint_requires_ready() {
        let inst = BackingStoreInstance::starting(ScopeKey::new("a"), 1);
        inst.attach_container("c1".to_owned(), Endpoint::new("127.0.0.1", 8500));
        assert!(matches!(
            inst.ready_endpoint(),
            Err(DevServicesError::NotReady {
                state: LifecycleState::Starting,
                ..
            })
        ));
        inst.transition(LifecycleState::Ready);
        assert_eq!(
            inst.ready_endpoint().unwrap(),
            Endpoint::new("127.0.0.1", 8500)
        );
    }

    #[test]
    fn test_instance_ids_are_unique() {
        let a = InstanceId::new();
        let b = InstanceId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_uuid().get_version_num(), 7);
    }
}
