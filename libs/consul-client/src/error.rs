use std::time::Duration;

/// Failures talking to the backing store.
///
/// `Clone` so one failure can be handed to every waiter of a shared operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("connection to {url} failed: {message}")]
    Connect { url: String, message: String },

    #[error("{method} {url} returned HTTP {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("invalid response from {url}: {message}")]
    InvalidResponse { url: String, message: String },

    #[error("write of key '{key}' was rejected by the store")]
    WriteRejected { key: String },

    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("invalid service name '{name}': {reason}")]
    InvalidService { name: String, reason: String },
}

impl ClientError {
    /// Failures that may succeed when simply tried again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Connect { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// The store could not be reached at all.
    #[must_use]
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Connect { .. })
    }
}
