//! Bounded retry with exponential backoff for store calls.
//!
//! [`call_with_retry`] retries only errors whose [`RetryClass`] says they are
//! transient. The operation must be idempotent: KV upserts, registration by
//! stable instance id and catalog reads all are.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::Instrument;

use crate::error::ClientError;

fn duration_to_u64_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Classifies an error as worth another attempt or not.
pub trait RetryClass {
    fn is_retryable(&self) -> bool;
}

impl RetryClass for ClientError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct RetryConfig {
    /// Maximum number of retries, not counting the first call.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_base_backoff(mut self, duration: Duration) -> Self {
        self.base_backoff = duration;
        self
    }

    #[must_use]
    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }

    /// Delay after failed attempt number `attempt` (1-based):
    /// `base_backoff * 2^(attempt - 1)`, capped at `max_backoff`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exp)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. `op` receives the 1-based attempt number.
///
/// # Errors
/// Returns the last error produced by `op`.
pub async fn call_with_retry<F, Fut, T, E>(
    cfg: &RetryConfig,
    op_name: &'static str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryClass + std::fmt::Display,
{
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let span = tracing::debug_span!("store_call", op = op_name, attempt);
        let result = async {
            let res = op(attempt).await;
            if let Err(ref err) = res {
                tracing::warn!(error = %err, attempt, op = op_name, "store call failed");
            }
            res
        }
        .instrument(span)
        .await;

        match result {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(op = op_name, attempt, "store call succeeded after retries");
                }
                return Ok(value);
            }
            Err(err) => {
                if !err.is_retryable() || attempt > cfg.max_retries {
                    tracing::debug!(op = op_name, attempt, "store call giving up");
                    return Err(err);
                }

                let backoff = cfg.delay_for(attempt);
                tracing::debug!(
                    op = op_name,
                    attempt,
                    backoff_ms = duration_to_u64_ms(backoff),
                    "Retrying store call after backoff"
                );
                sleep(backoff).await;
            }
        }
    }
}
