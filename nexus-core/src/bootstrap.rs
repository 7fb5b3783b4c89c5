//! One-shot startup sequence
//!
//! Registers the local node in its own directory, asks the gateway for a
//! port mapping, checks the listener answers locally and, when no other
//! peer is known yet, asks the operator for a seed peer to pull a
//! directory from.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::context::NodeContext;
use crate::nat;
use crate::peer::merge;
use crate::protocol;

const LISTENER_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub enable_upnp: bool,
    /// Wait before probing the local listener
    pub listen_grace: Duration,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            enable_upnp: true,
            listen_grace: Duration::from_millis(500),
        }
    }
}

/// What the operator typed at the seed prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedInput {
    /// `search`: network discovery, recognized but not implemented
    Search,
    Peer(SocketAddr),
    Invalid,
}

impl SeedInput {
    /// Accepts `search` or `ip:port` (IPv6 as `[addr]:port`)
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line == "search" {
            return SeedInput::Search;
        }
        match line.parse::<SocketAddr>() {
            Ok(addr) => SeedInput::Peer(addr),
            Err(_) => SeedInput::Invalid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Directory already knew other peers
    AlreadySeeded { peers: usize },
    /// Pulled a directory from the operator's seed
    Seeded { peer: SocketAddr, fetched: usize },
    /// Seed given but the fetch failed
    SeedFailed { peer: SocketAddr },
    SearchRequested,
    /// Input ended without a usable answer
    NoSeed,
}

/// Run the startup sequence, prompting on `output` and reading from `input`
pub async fn bootstrap<R, W>(
    ctx: &NodeContext,
    opts: &BootstrapOptions,
    input: R,
    mut output: W,
) -> BootstrapOutcome
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let dir = ctx.refresh_self().await;
    info!(target: "bootstrap", node_id = %ctx.node_id(), port = ctx.port, "Registered local node");

    if opts.enable_upnp {
        nat::try_port_forward(ctx.port).await;
    }

    tokio::time::sleep(opts.listen_grace).await;
    if listener_is_active(ctx.port).await {
        info!(target: "bootstrap", port = ctx.port, "Confirmed listener active");
    } else {
        warn!(target: "bootstrap", port = ctx.port, "No active listener detected");
    }

    if dir.len() > 1 {
        info!(target: "bootstrap", peers = dir.len(), "Loaded peers");
        return BootstrapOutcome::AlreadySeeded { peers: dir.len() };
    }

    prompt_for_seed(ctx, input, &mut output).await
}

async fn listener_is_active(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    matches!(
        tokio::time::timeout(LISTENER_PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

async fn prompt_for_seed<R, W>(ctx: &NodeContext, input: R, output: &mut W) -> BootstrapOutcome
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let _ = output
        .write_all(
            b"No known peers found besides self.\n\
              Enter a known peer in IP:PORT format or type 'search' to attempt discovery.\n\
              WARNING: searching may take a very long time at the current network size.\n\
              Your input: ",
        )
        .await;
    let _ = output.flush().await;

    let mut lines = input.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                warn!(target: "bootstrap", "Seed prompt closed without input");
                return BootstrapOutcome::NoSeed;
            }
            Err(e) => {
                warn!(target: "bootstrap", error = %e, "Failed to read seed input");
                return BootstrapOutcome::NoSeed;
            }
        };

        match SeedInput::parse(&line) {
            SeedInput::Search => {
                info!(target: "bootstrap", "Search mode requested (not implemented)");
                return BootstrapOutcome::SearchRequested;
            }
            SeedInput::Peer(addr) => return seed_from(ctx, addr).await,
            SeedInput::Invalid => {
                let _ = output
                    .write_all(b"Invalid format. Enter IP:PORT or type 'search': ")
                    .await;
                let _ = output.flush().await;
            }
        }
    }
}

async fn seed_from(ctx: &NodeContext, addr: SocketAddr) -> BootstrapOutcome {
    info!(target: "bootstrap", peer = %addr, "Connecting to seed peer");

    match protocol::fetch_peer_list(addr).await {
        Ok(fetched) => {
            let count = fetched.len();
            let total = ctx
                .store
                .update(|dir| {
                    *dir = merge(dir, &fetched);
                    dir.len()
                })
                .await;
            info!(target: "bootstrap", peer = %addr, fetched = count, total, "Seeded directory");
            BootstrapOutcome::Seeded {
                peer: addr,
                fetched: count,
            }
        }
        Err(e) => {
            warn!(target: "bootstrap", peer = %addr, error = %e, "Failed to fetch peer list from seed");
            BootstrapOutcome::SeedFailed { peer: addr }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;
    use crate::peer::{format_timestamp, PeerDirectory, PeerRecord, Role, IPV6_NONE};
    use crate::public_addr::{PublicAddressResolver, PublicAddresses};
    use crate::store::PeerStore;
    use chrono::Utc;
    use tokio::io::BufReader;

    fn context(dir: &std::path::Path, port: u16) -> NodeContext {
        NodeContext::new(
            NodeIdentity::new("self", Role::Default),
            port,
            PeerStore::new(dir.join("peers.yaml")),
            PublicAddressResolver::fixed(PublicAddresses::from_lookups("192.0.2.1", "")),
        )
    }

    fn quick() -> BootstrapOptions {
        BootstrapOptions {
            enable_upnp: false,
            listen_grace: Duration::ZERO,
        }
    }

    #[test]
    fn test_seed_input_parse() {
        assert_eq!(SeedInput::parse("search\n"), SeedInput::Search);
        assert_eq!(
            SeedInput::parse(" 10.0.0.1:51613 "),
            SeedInput::Peer("10.0.0.1:51613".parse().unwrap())
        );
        assert_eq!(
            SeedInput::parse("[2001:db8::1]:51613"),
            SeedInput::Peer("[2001:db8::1]:51613".parse().unwrap())
        );
        assert_eq!(SeedInput::parse("example.com:51613"), SeedInput::Invalid);
        assert_eq!(SeedInput::parse("10.0.0.1"), SeedInput::Invalid);
        assert_eq!(SeedInput::parse("10.0.0.1:99999"), SeedInput::Invalid);
    }

    #[tokio::test]
    async fn test_registers_self_and_skips_prompt_when_seeded() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), 1);
        ctx.store
            .replace(PeerDirectory::from_records(vec![PeerRecord {
                node_id: "other".to_string(),
                role: Role::Default,
                ipv4: "10.0.0.3".to_string(),
                ipv6: IPV6_NONE.to_string(),
                port: 51613,
                last_seen: format_timestamp(Utc::now()),
            }]))
            .await;

        let mut out = Vec::new();
        let outcome = bootstrap(&ctx, &quick(), BufReader::new(&b""[..]), &mut out).await;

        assert_eq!(outcome, BootstrapOutcome::AlreadySeeded { peers: 2 });
        assert!(out.is_empty());
        let me = ctx.store.read().await.get("self").cloned().unwrap();
        assert_eq!(me.ipv4, "192.0.2.1");
        assert_eq!(me.ipv6, IPV6_NONE);
        assert_eq!(me.port, 1);
    }

    #[tokio::test]
    async fn test_search_branch_is_explicit() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), 1);

        let mut out = Vec::new();
        let input = BufReader::new(&b"bogus\nsearch\n"[..]);
        let outcome = bootstrap(&ctx, &quick(), input, &mut out).await;

        assert_eq!(outcome, BootstrapOutcome::SearchRequested);
        let shown = String::from_utf8(out).unwrap();
        assert!(shown.contains("IP:PORT"));
        assert!(shown.contains("Invalid format"));
        assert_eq!(ctx.store.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_end_of_input() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), 1);

        let mut out = Vec::new();
        let outcome = bootstrap(&ctx, &quick(), BufReader::new(&b""[..]), &mut out).await;
        assert_eq!(outcome, BootstrapOutcome::NoSeed);
    }

    #[tokio::test]
    async fn test_unreachable_seed() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), 1);
        let port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let line = format!("127.0.0.1:{}\n", port);
        let mut out = Vec::new();
        let outcome = bootstrap(&ctx, &quick(), BufReader::new(line.as_bytes()), &mut out).await;

        assert_eq!(
            outcome,
            BootstrapOutcome::SeedFailed {
                peer: format!("127.0.0.1:{}", port).parse().unwrap()
            }
        );
        assert_eq!(ctx.store.read().await.len(), 1);
    }
}
