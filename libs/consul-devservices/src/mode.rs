//! Launch mode detection.

use std::fmt;
use std::str::FromStr;

/// Environment variable that forces a launch mode.
pub const MODE_ENV: &str = "CONSUL_DEVSERVICES_MODE";

/// How the process was launched; decides whether a backing store is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DevMode {
    /// Normal runtime, never starts containers.
    Production,
    /// Interactive dev run, one long-lived store on a well-known port.
    Development,
    /// Unit tests use in-process fakes instead of containers.
    UnitTest,
    /// Integration tests share a store per scope with per-test namespaces.
    IntegrationTest,
}

impl DevMode {
    /// Reads [`MODE_ENV`]; falls back to `default` when it is unset or
    /// unrecognized.
    #[must_use]
    pub fn detect_or(default: Self) -> Self {
        match std::env::var(MODE_ENV) {
            Ok(raw) => raw.parse().unwrap_or_else(|e: String| {
                tracing::warn!(value = %raw, error = %e, "ignoring invalid launch mode");
                default
            }),
            Err(_) => default,
        }
    }

    #[must_use]
    pub const fn starts_containers(self) -> bool {
        matches!(self, Self::Development | Self::IntegrationTest)
    }

    /// Host port used when none is configured. Development pins one so the
    /// store stays reachable across restarts of the app.
    #[must_use]
    pub const fn default_port(self) -> Option<u16> {
        match self {
            Self::Development => Some(8501),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Development => "development",
            Self::UnitTest => "unit_test",
            Self::IntegrationTest => "integration_test",
        }
    }
}

impl fmt::Display for DevMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DevMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            "unit_test" | "unit" => Ok(Self::UnitTest),
            "integration_test" | "integration" => Ok(Self::IntegrationTest),
            other => Err(format!("unknown launch mode '{other}'")),
        }
    }
}
