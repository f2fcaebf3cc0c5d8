use std::time::Duration;

use consul_client::ClientError;

use crate::instance::{InstanceId, LifecycleState, ScopeKey};

/// Failures of the dev services engine.
///
/// `Clone` because a single provisioning outcome is delivered to every
/// caller waiting on the same scope.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DevServicesError {
    /// The container never became ready within the readiness budget.
    #[error(
        "backing store for scope '{scope}' not ready after {attempts} probe attempts ({elapsed:?}): {last_error}"
    )]
    ProvisioningTimeout {
        scope: ScopeKey,
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },

    /// Bootstrap data is incomplete; `written` entries made it in before `key`
    /// failed.
    #[error("seeding key '{key}' failed after {written} entries were written: {cause}")]
    SeedFailure {
        key: String,
        written: usize,
        #[source]
        cause: ClientError,
    },

    /// The instance was used before it reached Ready.
    #[error("instance {instance_id} of scope '{scope}' is {state}, not ready")]
    NotReady {
        scope: ScopeKey,
        instance_id: InstanceId,
        state: LifecycleState,
    },

    #[error("provisioning of scope '{scope}' was cancelled")]
    Cancelled { scope: ScopeKey },

    #[error("container runtime failed for scope '{scope}': {message}")]
    Runtime { scope: ScopeKey, message: String },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("invalid dev services configuration: {0}")]
    Config(String),

    #[error("consul dev services are disabled")]
    Disabled,
}

impl DevServicesError {
    pub(crate) fn runtime(scope: &ScopeKey, err: &anyhow::Error) -> Self {
        Self::Runtime {
            scope: scope.clone(),
            message: format!("{err:#}"),
        }
    }
}

impl From<figment::Error> for DevServicesError {
    fn from(e: figment::Error) -> Self {
        Self::Config(e.to_string())
    }
}
