//! Aquarium Gate daemon entry point.
//!
//! Runs the SSH proxy gate standalone with the in-memory stores. In the
//! full fleet daemon the stores are fed by the scheduler and the issuance
//! RPC is mounted on the daemon's transport; here they exist so the gate
//! can be operated and exercised on a single node.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

use aquarium_gate::config::GateConfig;
use aquarium_gate::gate::{GateDriver, SshGate};
use aquarium_gate::store::MemoryStore;

/// Aquarium Gate - SSH reverse-proxy access to allocated resources
#[derive(Parser, Debug)]
#[command(name = "aquarium-gate", version, about)]
struct Cli {
    /// Path to the gate configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Working directory for the host key and other gate state
    #[arg(short, long, default_value = ".")]
    workdir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config_text = match &cli.config {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?,
        None => String::new(),
    };
    let mut gate_config = GateConfig::apply(&config_text).context("invalid gate config")?;
    if let Some(listen) = cli.listen {
        gate_config.bind_address = listen;
    }
    let config = toml::to_string(&gate_config).context("unable to serialize gate config")?;

    let store = Arc::new(MemoryStore::new());
    let mut gate = SshGate::new(store.clone(), store);

    info!("starting aquarium-gate");
    gate.prepare(&cli.workdir, &config)
        .await
        .context("unable to prepare the SSH gate")?;
    info!(
        addr = %gate.bound_addr().expect("gate is prepared"),
        "gate is ready",
    );

    tokio::signal::ctrl_c()
        .await
        .context("unable to wait for shutdown signal")?;
    info!("shutting down");
    gate.shutdown().await?;

    Ok(())
}
