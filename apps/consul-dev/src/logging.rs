//! Subscriber setup for the launcher.

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Filter used when `RUST_LOG` is unset: `-v` info, `-vv` debug, `-vvv` trace.
#[must_use]
pub fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn,consul_dev=info,consul_devservices=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Installs the global subscriber and bridges `log` records into it.
///
/// # Errors
/// Fails if the filter does not parse or a subscriber is already installed.
pub fn init(verbose: u8, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(verbose)))
        .context("invalid log filter")?;

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_ansi(true)
            .boxed()
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;
    tracing_log::LogTracer::init().context("failed to bridge log records")?;
    Ok(())
}
