//! auto-enhance daemon: loads configuration, probes the processing tools
//! and runs the scheduler until Ctrl-C.

use std::path::PathBuf;

use ae_core::config::Config;
use ae_daemon::daemon::Daemon;
use ae_telemetry::logging::{init_logging, LogFormat};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "ae-daemon", version, about = "auto-enhance task orchestration daemon")]
struct Cli {
    /// Configuration file (default: ~/.auto-enhance/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit JSON log lines regardless of configuration
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };

    init_logging(
        "ae-daemon",
        &config.general.log_level,
        LogFormat::from_json_flag(cli.json_logs || config.general.log_json),
    );
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "auto-enhance daemon starting"
    );

    let daemon = Daemon::new(config)
        .await
        .context("failed to initialise daemon")?;

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received ctrl-c"),
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c, shutting down"),
        }
        shutdown.cancel();
    });

    let drained = daemon.run().await?;
    if !drained {
        warn!("some tasks were still stopping at exit");
    }
    info!("auto-enhance daemon stopped");
    Ok(())
}
