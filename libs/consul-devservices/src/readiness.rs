//! Readiness polling of a freshly started backing store.
//!
//! The loop is split into a pure state machine ([`ReadinessTracker`]) that
//! decides what to do after each probe, and a driver ([`wait_until_ready`])
//! that runs probes and sleeps on an injected [`Clock`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use async_trait::async_trait;
use consul_client::{Endpoint, StoreConnector};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::DevServicesConfig;

fn duration_to_u64_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Deterministic exponential backoff: `initial * 2^(attempt - 1)`, capped at
/// `max`, within `max_attempts` probes and `total` elapsed time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
    pub total: Duration,
}

impl BackoffPolicy {
    #[must_use]
    pub fn from_config(cfg: &DevServicesConfig) -> Self {
        Self {
            initial: cfg.readiness.initial_backoff,
            max: cfg.readiness.max_backoff,
            max_attempts: cfg.readiness.max_attempts,
            total: cfg.startup_timeout,
        }
    }

    /// Delay after failed probe number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&DevServicesConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeDecision {
    Ready { attempts: u32 },
    RetryAfter(Duration),
    GiveUp {
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },
}

/// Readiness state machine over probe outcomes.
#[derive(Debug)]
pub struct ReadinessTracker {
    policy: BackoffPolicy,
    started: Instant,
    attempts: u32,
}

impl ReadinessTracker {
    #[must_use]
    pub fn new(policy: BackoffPolicy, started: Instant) -> Self {
        Self {
            policy,
            started,
            attempts: 0,
        }
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_probe_result(&mut self, result: Result<(), String>, now: Instant) -> ProbeDecision {
        self.attempts += 1;
        let error = match result {
            Ok(()) => {
                return ProbeDecision::Ready {
                    attempts: self.attempts,
                };
            }
            Err(e) => e,
        };

        let elapsed = now.saturating_duration_since(self.started);
        if self.attempts >= self.policy.max_attempts || elapsed >= self.policy.total {
            return ProbeDecision::GiveUp {
                attempts: self.attempts,
                elapsed,
                last_error: error,
            };
        }

        let remaining = self.policy.total - elapsed;
        ProbeDecision::RetryAfter(self.policy.delay_for(self.attempts).min(remaining))
    }
}

/// One readiness check against a started store.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> anyhow::Result<()>;
}

/// Consul is ready once its HTTP port accepts connections and
/// `/v1/status/leader` names a leader.
pub struct ConsulReadinessProbe {
    connector: Arc<dyn StoreConnector>,
    timeout: Duration,
}

impl ConsulReadinessProbe {
    #[must_use]
    pub fn new(connector: Arc<dyn StoreConnector>, timeout: Duration) -> Self {
        Self { connector, timeout }
    }
}

#[async_trait]
impl ReadinessProbe for ConsulReadinessProbe {
    async fn probe(&self, endpoint: &Endpoint) -> anyhow::Result<()> {
        tokio::time::timeout(
            self.timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .with_context(|| format!("TCP connect to {endpoint} timed out"))?
        .with_context(|| format!("TCP connect to {endpoint} failed"))?;

        let store = self.connector.connect(endpoint)?;
        let leader = tokio::time::timeout(self.timeout, store.leader())
            .await
            .with_context(|| format!("leader query against {endpoint} timed out"))??;
        match leader {
            Some(_) => Ok(()),
            None => bail!("no cluster leader elected yet at {endpoint}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessFailure {
    GaveUp {
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },
    Cancelled,
}

/// Probes `endpoint` until it is ready, the budget runs out, or `cancel`
/// fires. Returns the number of probes it took.
///
/// # Errors
/// [`ReadinessFailure::GaveUp`] on budget exhaustion,
/// [`ReadinessFailure::Cancelled`] on cancellation.
pub async fn wait_until_ready(
    probe: &dyn ReadinessProbe,
    endpoint: &Endpoint,
    policy: BackoffPolicy,
    clock: &dyn Clock,
    cancel: &CancellationToken,
) -> Result<u32, ReadinessFailure> {
    let mut tracker = ReadinessTracker::new(policy, clock.now());

    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ReadinessFailure::Cancelled),
            r = probe.probe(endpoint) => r.map_err(|e| format!("{e:#}")),
        };

        if let Err(ref e) = result {
            tracing::debug!(
                endpoint = %endpoint,
                attempt = tracker.attempts() + 1,
                error = %e,
                "readiness probe failed"
            );
        }

        match tracker.on_probe_result(result, clock.now()) {
            ProbeDecision::Ready { attempts } => {
                tracing::info!(endpoint = %endpoint, attempts, "backing store is ready");
                return Ok(attempts);
            }
            ProbeDecision::GiveUp {
                attempts,
                elapsed,
                last_error,
            } => {
                tracing::warn!(
                    endpoint = %endpoint,
                    attempts,
                    elapsed_ms = duration_to_u64_ms(elapsed),
                    "backing store did not become ready"
                );
                return Err(ReadinessFailure::GaveUp {
                    attempts,
                    elapsed,
                    last_error,
                });
            }
            ProbeDecision::RetryAfter(backoff) => {
                tracing::debug!(
                    endpoint = %endpoint,
                    backoff_ms = duration_to_u64_ms(backoff),
                    "Retrying readiness probe after backoff"
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(ReadinessFailure::Cancelled),
                    () = clock.sleep(backoff) => {}
                }
            }
        }
    }
}
