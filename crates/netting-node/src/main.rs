//! netting-sim: builds an in-process netting network and measures transfer
//! throughput or latency.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use netting_node::{Network, NettingConfig, SimulationMode};

/// Netting network simulator
#[derive(Parser, Debug)]
#[command(name = "netting-sim", version, about = "Netting payment channel network simulator")]
struct Args {
    /// Path to the configuration file (TOML).
    #[arg(short, long, default_value = "netting.toml")]
    config: PathBuf,

    /// Override the number of nodes.
    #[arg(long)]
    nodes: Option<usize>,

    /// Override the number of assets.
    #[arg(long)]
    assets: Option<usize>,

    /// Override the channels each node opens.
    #[arg(long)]
    channels_per_node: Option<usize>,

    /// Override the transfers started per asset.
    #[arg(long)]
    transfers: Option<usize>,

    /// Override the workload mode.
    #[arg(long, value_enum)]
    mode: Option<SimulationMode>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long)]
    json: bool,

    /// Generate a default config file and exit.
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Handle --init flag
    if args.init {
        let config = NettingConfig::default();
        config.save(&args.config)?;
        println!("wrote default config to {}", args.config.display());
        return Ok(());
    }

    // Load configuration
    let mut config = NettingConfig::load(&args.config)?;

    // Apply CLI overrides
    if let Some(nodes) = args.nodes {
        config.simulation.nodes = nodes;
    }
    if let Some(assets) = args.assets {
        config.simulation.assets = assets;
    }
    if let Some(channels) = args.channels_per_node {
        config.simulation.channels_per_node = channels;
    }
    if let Some(transfers) = args.transfers {
        config.simulation.transfers = transfers;
    }
    if let Some(mode) = args.mode {
        config.simulation.mode = mode;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.json {
        config.logging.format = "json".into();
    }

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    if config.simulation.nodes < 3 {
        anyhow::bail!("a mediated workload needs at least 3 nodes");
    }

    tracing::info!("netting-sim v{}", env!("CARGO_PKG_VERSION"));
    let network = Network::from_config(&config).await?;
    let blocks = network
        .start_block_production(Duration::from_millis(config.simulation.block_time_ms.max(1)));

    let result = network.run_workload(&config.simulation).await;
    blocks.abort();
    network.shutdown().await;

    let report = result?;
    println!(
        "{} transfers ({} ok, {} failed) in {:.3}s = {:.1} transfers/s",
        report.transfers,
        report.succeeded,
        report.failed,
        report.elapsed_ms as f64 / 1000.0,
        report.transfers_per_second
    );
    if let Some(latency) = report.mean_latency_ms {
        println!("mean latency {:.3}ms", latency);
    }
    if config.logging.format == "json" {
        println!("{}", serde_json::to_string(&report)?);
    }
    Ok(())
}
