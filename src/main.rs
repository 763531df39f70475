use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use memsniff::agent::Agent;
use memsniff::config::Config;

/// Passive memcached and Redis hot-key analyzer.
#[derive(Parser)]
#[command(name = "memsniff", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error). Overrides
    /// `log_level` from the configuration.
    #[arg(long)]
    log_level: Option<String>,

    /// Server ports, overriding the configuration (e.g. 11211,6379).
    #[arg(short, long, value_delimiter = ',')]
    ports: Option<Vec<u16>>,

    /// Only aggregate keys matching this regex.
    #[arg(short, long)]
    filter: Option<String>,

    /// Keep counting across reports instead of resetting each interval.
    #[arg(long)]
    cumulative: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("memsniff {}", version::full());
        return Ok(());
    }

    let cfg = load_config(&cli)?;

    let level = log_level(&cli, &cfg);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting memsniff",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

/// Loads the config file (or defaults) and applies command-line overrides.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(ports) = &cli.ports {
        cfg.ports = ports.clone();
    }
    if let Some(filter) = &cli.filter {
        cfg.analysis.filter = filter.clone();
    }
    if cli.cumulative {
        cfg.report.cumulative = true;
    }

    cfg.validate().context("validating configuration")?;

    Ok(cfg)
}

/// The `--log-level` flag wins over the configured level.
fn log_level<'a>(cli: &'a Cli, cfg: &'a Config) -> &'a str {
    cli.log_level.as_deref().unwrap_or(&cfg.log_level)
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    let _ = shutdown_rx.await;

    agent.stop().await?;

    tracing::info!("memsniff stopped");

    Ok(())
}
