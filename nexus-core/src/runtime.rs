//! Node lifecycle
//!
//! Starts the nexus listener, runs bootstrap once, then keeps tap-sync
//! going until Ctrl+C.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::signal;
use tracing::{info, warn};

use crate::bootstrap::{bootstrap, BootstrapOptions};
use crate::config::{Config, ConfigError};
use crate::context::NodeContext;
use crate::identity::{IdentityError, NodeIdentity};
use crate::nexus::NexusListener;
use crate::public_addr::PublicAddressResolver;
use crate::store::PeerStore;
use crate::tapsync::run_tap_sync_loop;

/// How often the active peer count is logged
const STATUS_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to start listener on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Build the shared node state from configuration
pub fn build_context(config: &Config) -> Result<NodeContext, NodeError> {
    let role = config.identity.role;
    let identity = match &config.identity.node_id {
        Some(id) => NodeIdentity::new(id.clone(), role),
        None => NodeIdentity::load_or_create(&config.storage.data_dir, role)?,
    };

    let public = PublicAddressResolver::http(
        config.network.ipv4_echo_url.clone(),
        config.network.ipv6_echo_url.clone(),
        config.public_ip_ttl(),
    )?;

    Ok(NodeContext::new(
        identity,
        config.listen_port(),
        PeerStore::new(config.storage.peer_cache_file.clone()),
        public,
    ))
}

fn listen_addr(config: &Config) -> Result<SocketAddr, NodeError> {
    let ip: IpAddr = config.network.bind_address.parse().map_err(|_| {
        ConfigError::Invalid(format!(
            "network.bind_address is not an IP address: {}",
            config.network.bind_address
        ))
    })?;
    Ok(SocketAddr::new(ip, config.listen_port()))
}

/// Run the node with the given configuration
pub async fn run_node(config: Config) -> Result<(), NodeError> {
    let ctx = Arc::new(build_context(&config)?);
    info!(node_id = %ctx.node_id(), role = %ctx.identity.role, "Node starting");

    let addr = listen_addr(&config)?;
    let listener = NexusListener::bind(addr, ctx.clone())
        .await
        .map_err(|source| NodeError::Listen { addr, source })?;
    let listener_task = listener.spawn();

    let opts = BootstrapOptions {
        enable_upnp: config.network.enable_upnp,
        ..Default::default()
    };
    tokio::select! {
        outcome = bootstrap(&ctx, &opts, BufReader::new(tokio::io::stdin()), tokio::io::stdout()) => {
            info!(target: "bootstrap", ?outcome, "Bootstrap finished");
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C during bootstrap, shutting down...");
            listener_task.abort();
            return Ok(());
        }
    }

    let tapsync_task = tokio::spawn(run_tap_sync_loop(ctx.clone(), config.sync_interval()));
    info!(
        interval_secs = config.network.peer_discovery_interval,
        "Tap-sync scheduled"
    );

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = status.tick() => {
                info!(active_peers = ctx.active_peer_count().await, "Peer status");
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }

        if listener_task.is_finished() {
            warn!(target: "nexus", "Listener stopped unexpectedly");
        }
    }

    tapsync_task.abort();
    listener_task.abort();
    info!("Node stopped");
    Ok(())
}
