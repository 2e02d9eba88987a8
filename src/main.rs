use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use watchoor::config::Config;
use watchoor::service::MonitorService;

/// Capture-file monitoring service.
#[derive(Parser)]
#[command(name = "watchoor", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitoring loop (the default).
    Run,

    /// Process a single capture file, persist its snapshot, and exit.
    Process {
        /// Capture file to process.
        file: PathBuf,
    },

    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via the build environment.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via the GIT_COMMIT env var).
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Target OS.
    pub fn target_os() -> &'static str {
        std::env::consts::OS
    }

    /// Target architecture.
    pub fn target_arch() -> &'static str {
        std::env::consts::ARCH
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            target_os(),
            target_arch(),
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("watchoor {}", version::full());
        return Ok(());
    }

    // Config is required for anything beyond `version`.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // Initialize tracing; the CLI flag wins over the config file.
    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting watchoor",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Process { file }) => rt.block_on(process(cfg, file)),
        _ => rt.block_on(run(cfg)),
    }
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the service and its ops server.
    let (service, handle) = MonitorService::new(cfg).await?;
    service.start_ops().await?;

    let mut worker = tokio::spawn(service.run());

    // Wait for a shutdown signal or for the loop to end on its own.
    tokio::select! {
        _ = shutdown_rx => {
            handle.cancel();
            worker.await.context("joining service task")??;
        }
        result = &mut worker => {
            result.context("joining service task")??;
        }
    }

    tracing::info!("watchoor stopped");

    Ok(())
}

async fn process(cfg: Config, file: PathBuf) -> Result<()> {
    let (mut service, _handle) = MonitorService::new(cfg).await?;

    service
        .process_file(&file)
        .await
        .with_context(|| format!("processing {}", file.display()))?;

    Ok(())
}
