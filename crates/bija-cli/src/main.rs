use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bija_cli::cli::{run_server, CliConfig};
use bija_core::tracing_setup::init_tracing;
use bija_core::CoreRuntime;
use clap::Parser;
use tracing::info;

#[derive(Parser)]
#[command(name = "bija")]
#[command(about = "Nostr feed reader served as a local JSON API")]
struct Cli {
    /// Path to JSON config file (bindAddr, dataDir, relays)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(long)]
    bind: Option<String>,

    /// Data directory, overrides the config file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Relay url; repeat for several. Replaces the configured relays.
    #[arg(long = "relay")]
    relays: Vec<String>,

    /// Run without connecting to any relay
    #[arg(long, conflicts_with = "relays")]
    offline: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = match &cli.config {
        Some(path) => CliConfig::load(path)?,
        None => CliConfig::default(),
    };
    if cli.bind.is_some() {
        config.bind_addr = cli.bind;
    }
    if cli.data_dir.is_some() {
        config.data_dir = cli.data_dir;
    }
    if cli.offline {
        config.relays = Some(Vec::new());
    } else if !cli.relays.is_empty() {
        config.relays = Some(cli.relays);
    }

    let core_config = config.core_config();
    info!("Using data directory {}", core_config.data_dir.display());

    let core = Arc::new(CoreRuntime::new(core_config)?);
    let rt = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    let served = rt.block_on(run_server(&config.bind_addr(), core.clone()));

    core.shutdown();
    served
}
