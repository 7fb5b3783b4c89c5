//! Nexus - gossip-synchronized peer directory node
//!
//! Keeps a local directory of known peers and exchanges it with the rest
//! of the network.

use nexus_core::{run_node, Config};
use std::error::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse CLI arguments and build config
    let config = Config::from_cli()?;

    // Initialize logging
    init_logging(&config.logging.level);

    tracing::info!("Starting Nexus node...");

    run_node(config).await?;

    Ok(())
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
