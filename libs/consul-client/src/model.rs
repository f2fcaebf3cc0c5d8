//! Data model shared by the KV store, the service catalog and discovery.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Network endpoint of a backing store or of a registered service instance.
///
/// Ordering is host first, then port; [`crate::DiscoveryClient::resolve`] relies
/// on it to return endpoint lists in a stable order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    #[must_use]
    pub fn host_port(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    #[must_use]
    pub fn http_url(&self) -> String {
        format!("http://{}", self.host_port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host_port())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseEndpointError {
    #[error("endpoint '{0}' must have the form host:port")]
    MissingPort(String),
    #[error("endpoint '{input}' has an invalid port: {reason}")]
    InvalidPort { input: String, reason: String },
    #[error("endpoint '{0}' has an empty host")]
    EmptyHost(String),
}

impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseEndpointError::MissingPort(s.to_owned()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ParseEndpointError::EmptyHost(s.to_owned()));
        }
        let port = port.parse::<u16>().map_err(|e| ParseEndpointError::InvalidPort {
            input: s.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(host, port))
    }
}

/// A key/value pair as stored in the KV store.
///
/// `revision` is the store's modify index for the key and only ever grows.
/// Entries built by callers for writing carry revision `0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub revision: u64,
}

impl KvEntry {
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            revision: 0,
        }
    }

    /// The value as UTF-8, if it is valid UTF-8.
    #[must_use]
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// Health of a registered service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Passing,
    Warning,
    Critical,
}

impl HealthStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passing => "passing",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    /// Whether instances with this status are handed out by discovery.
    #[must_use]
    pub const fn is_serving(self) -> bool {
        !matches!(self, Self::Critical)
    }

    /// The worse of two statuses.
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Critical, _) | (_, Self::Critical) => Self::Critical,
            (Self::Warning, _) | (_, Self::Warning) => Self::Warning,
            _ => Self::Passing,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "passing" => Ok(Self::Passing),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown health status '{other}'")),
        }
    }
}

/// A service published into the catalog: one name, all of its endpoints.
///
/// Registering a name again replaces its endpoint list (last write wins).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub name: String,
    pub endpoints: Vec<Endpoint>,
    pub health: HealthStatus,
    pub tags: Vec<String>,
}

impl ServiceRegistration {
    #[must_use]
    pub fn new(name: impl Into<String>, endpoints: Vec<Endpoint>) -> Self {
        Self {
            name: name.into(),
            endpoints,
            health: HealthStatus::Passing,
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// One instance of a service as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNode {
    pub service_id: String,
    pub endpoint: Endpoint,
    pub health: HealthStatus,
}

/// Catalog query result plus the consistency metadata the store reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogSnapshot {
    pub nodes: Vec<ServiceNode>,
    /// Raft index the answer was served at.
    pub index: u64,
    /// Time since the answering server last heard from the leader.
    pub last_contact: Duration,
    pub known_leader: bool,
}

impl CatalogSnapshot {
    /// A fresh, leader-backed snapshot.
    #[must_use]
    pub fn fresh(nodes: Vec<ServiceNode>, index: u64) -> Self {
        Self {
            nodes,
            index,
            last_contact: Duration::ZERO,
            known_leader: true,
        }
    }

    #[must_use]
    pub fn is_stale(&self, threshold: Duration) -> bool {
        !self.known_leader || self.last_contact > threshold
    }
}

/// Stable per-endpoint service instance id: `<name>:<host>:<port>`.
///
/// Host bytes outside `[A-Za-z0-9.-]` are written as `_xx` hex escapes, so
/// the host never contains `:` and the last two fields always split off
/// cleanly. Distinct endpoints never share an id.
#[must_use]
pub fn service_instance_id(name: &str, endpoint: &Endpoint) -> String {
    use fmt::Write as _;

    let mut id = String::with_capacity(name.len() + endpoint.host.len() + 8);
    id.push_str(name);
    id.push(':');
    for byte in endpoint.host.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'.' || byte == b'-' {
            id.push(char::from(byte));
        } else {
            let _ = write!(id, "_{byte:02x}");
        }
    }
    let _ = write!(id, ":{}", endpoint.port);
    id
}

/// Strips leading slashes; KV paths are stored without them.
#[must_use]
pub fn normalize_key(key: &str) -> &str {
    key.trim_start_matches('/')
}
