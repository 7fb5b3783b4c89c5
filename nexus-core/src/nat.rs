//! NAT traversal helpers
//!
//! Local address discovery and best-effort UPnP port mapping. Nothing here
//! is allowed to stop the node from starting: a missing gateway or a refused
//! mapping only means the node is not reachable from outside its LAN.

use igd_next::aio::tokio::search_gateway;
use igd_next::{PortMappingProtocol, SearchOptions};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

/// Connected to, never sent to
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

const GATEWAY_SEARCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Description attached to the mapping on the gateway
pub const MAPPING_DESCRIPTION: &str = "Nexus Listener";

#[derive(Debug, thiserror::Error)]
pub enum NatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No UPnP gateway found: {0}")]
    NoGateway(#[from] igd_next::SearchError),

    #[error("Port mapping failed: {0}")]
    Mapping(#[from] igd_next::AddPortError),
}

/// Address of the interface the OS would route public traffic through
///
/// Connecting a UDP socket only selects a route; no datagram leaves the host.
pub async fn discover_local_address() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(ROUTE_PROBE_ADDR).await?;
    Ok(socket.local_addr()?.ip())
}

/// Ask the LAN gateway to forward TCP `port` to `local_addr:port`
pub async fn request_port_mapping(port: u16, local_addr: IpAddr) -> Result<(), NatError> {
    let gateway = search_gateway(SearchOptions {
        timeout: Some(GATEWAY_SEARCH_TIMEOUT),
        ..Default::default()
    })
    .await?;

    gateway
        .add_port(
            PortMappingProtocol::TCP,
            port,
            SocketAddr::new(local_addr, port),
            0,
            MAPPING_DESCRIPTION,
        )
        .await?;
    Ok(())
}

/// Forward `port` through UPnP if a gateway is around, logging the outcome
pub async fn try_port_forward(port: u16) {
    let local = match discover_local_address().await {
        Ok(ip) => ip,
        Err(e) => {
            warn!(target: "upnp", error = %e, "Failed to get local IP");
            return;
        }
    };

    match request_port_mapping(port, local).await {
        Ok(()) => info!(target: "upnp", port, local = %local, "Port forwarded via UPnP"),
        Err(NatError::NoGateway(e)) => {
            warn!(target: "upnp", error = %e, "UPnP device not found")
        }
        Err(e) => error!(target: "upnp", port, error = %e, "UPnP port mapping failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_address_is_not_unspecified() {
        // Hosts without any route cannot pick a source address
        if let Ok(ip) = discover_local_address().await {
            assert!(!ip.is_unspecified());
        }
    }

    #[tokio::test]
    async fn test_try_port_forward_never_fails() {
        // No gateway in CI; must return quietly
        tokio::time::timeout(Duration::from_secs(30), try_port_forward(51613))
            .await
            .unwrap();
    }
}
