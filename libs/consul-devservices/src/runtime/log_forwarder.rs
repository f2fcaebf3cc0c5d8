//! Forwarding of Consul agent stdout/stderr into tracing.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;

#[derive(Debug, Clone, Copy)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// Detect the level of a Consul (hclog) log line.
///
/// Two formats are recognized:
///
/// 1. Plain text, the agent default:
/// ```text
/// 2025-06-02T10:11:12.345Z [INFO]  agent: Consul agent running!
/// 2025-06-02T10:11:12.345Z [WARN]  agent: bootstrap = true: do not enable unless necessary
/// ```
///
/// 2. JSON, with `-log-json`:
/// ```json
/// {"@level":"info","@message":"Consul agent running!","@module":"agent","@timestamp":"..."}
/// ```
///
/// Returns INFO for anything else.
fn detect_log_level(line: &str) -> Level {
    if let Some(level) = detect_json_level(line) {
        return level;
    }
    if let Some(level) = detect_plain_level(line) {
        return level;
    }
    Level::INFO
}

fn parse_level(raw: &str) -> Option<Level> {
    match raw.to_ascii_lowercase().as_str() {
        "error" | "err" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

fn detect_plain_level(line: &str) -> Option<Level> {
    let mut parts = line.split_whitespace();
    let _timestamp = parts.next()?;
    let tag = parts.next()?;
    parse_level(tag.strip_prefix('[')?.strip_suffix(']')?)
}

fn detect_json_level(line: &str) -> Option<Level> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('{') || !trimmed.contains("\"@level\"") {
        return None;
    }

    let v: Value = serde_json::from_str(trimmed).ok()?;
    parse_level(v.get("@level")?.as_str()?)
}

fn forward_line(scope: &str, container_id: &str, stream: StreamKind, line: &str) {
    match detect_log_level(line) {
        Level::ERROR => {
            tracing::error!(scope = %scope, container_id = %container_id, stream = %stream, "{line}");
        }
        Level::WARN => {
            tracing::warn!(scope = %scope, container_id = %container_id, stream = %stream, "{line}");
        }
        Level::INFO => {
            tracing::info!(scope = %scope, container_id = %container_id, stream = %stream, "{line}");
        }
        Level::DEBUG => {
            tracing::debug!(scope = %scope, container_id = %container_id, stream = %stream, "{line}");
        }
        Level::TRACE => {
            tracing::trace!(scope = %scope, container_id = %container_id, stream = %stream, "{line}");
        }
    }
}

/// Spawn a task that forwards every line of `stream` to tracing.
///
/// Runs until the stream closes (the agent exited) or `cancel` fires.
#[must_use]
pub fn spawn_stream_forwarder<S>(
    stream: S,
    scope: String,
    container_id: String,
    cancel: CancellationToken,
    kind: StreamKind,
) -> JoinHandle<()>
where
    S: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    tracing::debug!(scope = %scope, container_id = %container_id, stream = ?kind, "log forwarder cancelled");
                    break;
                }

                result = lines.next_line() => {
                    match result {
                        Ok(Some(line)) => forward_line(&scope, &container_id, kind, &line),
                        Ok(None) => {
                            tracing::debug!(scope = %scope, container_id = %container_id, stream = ?kind, "log stream closed");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(
                                scope = %scope,
                                container_id = %container_id,
                                stream = ?kind,
                                error = %e,
                                "log stream read error"
                            );
                            break;
                        }
                    }
                }
            }
        }
    })
}
