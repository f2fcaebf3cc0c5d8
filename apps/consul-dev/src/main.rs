mod logging;
mod signals;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use consul_devservices::{
    DevMode, DevServices, DevServicesConfig, RuntimeConfig, RuntimeKind, ScopeKey,
};
use signals::ShutdownSignal;

/// Scope the launcher keeps its instance under.
const DEV_SCOPE: &str = "dev";

/// Consul dev services launcher
#[derive(Parser)]
#[command(name = "consul-dev")]
#[command(about = "Starts a seeded Consul instance and prints the config that points at it")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host port override (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Where to run Consul (overrides config)
    #[arg(long, value_enum)]
    runtime: Option<RuntimeArg>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the instance and keep it up until a shutdown signal
    Up,
    /// Validate configuration and exit
    Check,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RuntimeArg {
    Docker,
    Local,
}

impl From<RuntimeArg> for RuntimeKind {
    fn from(arg: RuntimeArg) -> Self {
        match arg {
            RuntimeArg::Docker => Self::Docker,
            RuntimeArg::Local => Self::LocalProcess,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    logging::init(cli.verbose, cli.json_logs)?;

    if let Some(path) = &cli.config
        && !path.is_file()
    {
        anyhow::bail!("config file does not exist: {}", path.display());
    }

    let mode = DevMode::detect_or(DevMode::Development);
    let config = effective_config(&cli, mode)?;

    if cli.print_config {
        println!("Effective configuration:\n{}", to_yaml(&config)?);
        return Ok(ExitCode::SUCCESS);
    }

    match cli.command.unwrap_or(Commands::Up) {
        Commands::Up => up(config, mode).await,
        Commands::Check => check(&config).map(|()| ExitCode::SUCCESS),
    }
}

/// Defaults, file and environment, then CLI overrides and the launch mode's
/// default port.
fn effective_config(cli: &Cli, mode: DevMode) -> Result<DevServicesConfig> {
    let mut config = DevServicesConfig::load(cli.config.as_deref())
        .context("failed to load dev services configuration")?;
    apply_overrides(&mut config, cli.port, cli.runtime, mode);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(
    config: &mut DevServicesConfig,
    port: Option<u16>,
    runtime: Option<RuntimeArg>,
    mode: DevMode,
) {
    if let Some(port) = port {
        config.port = Some(port);
    }
    if config.port.is_none() {
        config.port = mode.default_port();
    }
    if let Some(runtime) = runtime {
        config.runtime = runtime.into();
    }
}

fn to_yaml(config: &DevServicesConfig) -> Result<String> {
    serde_saphyr::to_string(config).context("failed to render configuration")
}

fn check(config: &DevServicesConfig) -> Result<()> {
    tracing::info!("Checking configuration...");
    println!("Configuration is valid");
    println!("{}", to_yaml(config)?);
    Ok(())
}

/// Runs a dev session. The exit code reflects the signal that ended it.
async fn up(config: DevServicesConfig, mode: DevMode) -> Result<ExitCode> {
    if !mode.starts_containers() {
        tracing::info!(%mode, "launch mode does not start a backing store, nothing to do");
        return Ok(ExitCode::SUCCESS);
    }
    if !config.enabled {
        tracing::info!("dev services disabled by configuration");
        return Ok(ExitCode::SUCCESS);
    }

    let services = DevServices::builder(config).build()?;
    let scope = ScopeKey::new(DEV_SCOPE);
    tracing::info!(%mode, scope = %scope, "starting consul dev instance");

    let handle = tokio::select! {
        handle = services.open(scope.clone(), "launcher") => handle,
        signal = signals::wait_for_shutdown() => {
            let signal = signal?;
            services.shutdown().await?;
            tracing::info!(%signal, "dev session cancelled before the instance was ready");
            return Ok(session_exit(signal));
        }
    };
    let handle = match handle {
        Ok(handle) => handle,
        Err(e) => {
            services.shutdown().await?;
            return Err(e).context("consul dev instance failed to start");
        }
    };

    tracing::info!(
        endpoint = %handle.endpoint(),
        seeded = handle.seed_report().written,
        "consul dev instance ready"
    );
    print_runtime_config(handle.config());

    let waited = signals::wait_for_shutdown().await;
    let endpoint = handle.endpoint().clone();
    drop(handle);
    services.shutdown().await?;
    let signal = waited?;
    tracing::info!(%signal, %endpoint, "dev session ended, instance released");
    Ok(session_exit(signal))
}

fn session_exit(signal: ShutdownSignal) -> ExitCode {
    ExitCode::from(signal.exit_code())
}

fn print_runtime_config(config: &RuntimeConfig) {
    println!("# runtime configuration");
    for (key, value) in config {
        println!("{key}={value}");
    }
    println!();
    println!("# environment");
    for (key, value) in config.to_env() {
        println!("export {key}={value}");
    }
}
