use serde::{Deserialize, Serialize};
use std::time::Duration;

const MIN_HEARTBEAT: Duration = Duration::from_millis(50);

/// Network settings for the Consul HTTP client.
///
/// Every request is bounded by `request_timeout`; there is no unbounded wait
/// on the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Let any server answer catalog reads (`?stale`); the answer carries
    /// `X-Consul-LastContact` so callers can judge its age.
    pub allow_stale: bool,

    /// TTL of the health check attached to every registered endpoint. The
    /// client re-sends the last reported status every half TTL while the
    /// endpoint stays registered.
    #[serde(with = "humantime_serde")]
    pub check_ttl: Duration,

    /// Consul removes an instance whose check stays critical this long.
    #[serde(with = "humantime_serde")]
    pub deregister_critical_after: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            allow_stale: true,
            check_ttl: Duration::from_secs(30),
            deregister_critical_after: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_check_ttl(mut self, ttl: Duration) -> Self {
        self.check_ttl = ttl;
        self
    }

    /// How often a registered endpoint's TTL check is refreshed.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        (self.check_ttl / 2).max(MIN_HEARTBEAT)
    }
}
