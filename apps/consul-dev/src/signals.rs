//! Termination signals that end a dev session.

use std::fmt;

use anyhow::{Context, Result};
use tokio::signal;

/// The signal that ended a dev session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Ctrl+C at the terminal.
    Interrupt,
    /// `kill` or a process supervisor.
    #[cfg(unix)]
    Terminate,
    /// The controlling terminal closed.
    #[cfg(unix)]
    Hangup,
}

impl ShutdownSignal {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            #[cfg(unix)]
            Self::Terminate => "SIGTERM",
            #[cfg(unix)]
            Self::Hangup => "SIGHUP",
        }
    }

    /// Shell convention: 128 plus the signal number.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Interrupt => 130,
            #[cfg(unix)]
            Self::Terminate => 143,
            #[cfg(unix)]
            Self::Hangup => 129,
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Waits for the first of SIGINT, SIGTERM or SIGHUP (only Ctrl+C off unix).
///
/// # Errors
/// Returns an error if a signal handler cannot be installed.
#[cfg(unix)]
pub async fn wait_for_shutdown() -> Result<ShutdownSignal> {
    use signal::unix::SignalKind;

    let mut terminate = listen(SignalKind::terminate(), "SIGTERM")?;
    let mut hangup = listen(SignalKind::hangup(), "SIGHUP")?;
    let received = tokio::select! {
        result = signal::ctrl_c() => {
            result.context("failed to listen for Ctrl+C")?;
            ShutdownSignal::Interrupt
        }
        _ = terminate.recv() => ShutdownSignal::Terminate,
        _ = hangup.recv() => ShutdownSignal::Hangup,
    };
    tracing::info!(signal = %received, "shutdown requested");
    Ok(received)
}

/// Waits for Ctrl+C.
///
/// # Errors
/// Returns an error if the Ctrl+C handler cannot be installed.
#[cfg(not(unix))]
pub async fn wait_for_shutdown() -> Result<ShutdownSignal> {
    signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    tracing::info!(signal = %ShutdownSignal::Interrupt, "shutdown requested");
    Ok(ShutdownSignal::Interrupt)
}

#[cfg(unix)]
fn listen(kind: signal::unix::SignalKind, name: &str) -> Result<signal::unix::Signal> {
    signal::unix::signal(kind).with_context(|| format!("failed to install {name} handler"))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn interrupt_follows_shell_exit_convention() {
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(ShutdownSignal::Interrupt.exit_code(), 130);
    }

    #[cfg(unix)]
    #[test]
    fn unix_signals_map_to_their_numbers() {
        assert_eq!(ShutdownSignal::Terminate.exit_code(), 128 + 15);
        assert_eq!(ShutdownSignal::Hangup.exit_code(), 128 + 1);
        assert_eq!(ShutdownSignal::Hangup.name(), "SIGHUP");
    }
}
