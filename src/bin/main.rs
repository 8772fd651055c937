//! dnsmesh binary entry point.

use clap::Parser;
use dnsmesh::{telemetry, Config, DnsNode, Shutdown};
use std::path::PathBuf;
use tracing::info;

/// Cluster DNS controller with a gossip-replicated DNS zone.
#[derive(Parser, Debug)]
#[command(name = "dnsmesh")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "dnsmesh.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()))
        .add_source(
            config::Environment::with_prefix("DNSMESH")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        controller = config.controller.enabled,
        backends = ?config.controller.backends,
        gossip_addr = ?config.gossip.as_ref().map(|g| g.listen_addr),
        hosts_file = ?config.hosts.as_ref().map(|h| h.path.display().to_string()),
        "Starting dnsmesh"
    );

    // Setup graceful shutdown
    let (shutdown, shutdown_worker) = Shutdown::new_signals();
    tokio::spawn(shutdown_worker);

    let node = DnsNode::start(config, shutdown).await?;
    node.wait().await;

    info!("dnsmesh shutdown complete");
    Ok(())
}
