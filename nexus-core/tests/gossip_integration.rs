//! Integration tests: real loopback TCP exchanges between nodes

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use nexus_core::bootstrap::{bootstrap, BootstrapOptions, BootstrapOutcome};
use nexus_core::peer::{format_timestamp, IPV6_NONE};
use nexus_core::{
    fetch_peer_list, tap_sync, NexusListener, NodeContext, NodeIdentity, PeerDirectory,
    PeerRecord, PeerStore, PublicAddressResolver, PublicAddresses, Role, SyncVia,
    TapSyncOutcome,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

fn at(secs: i64) -> String {
    format_timestamp(DateTime::from_timestamp(secs, 0).unwrap())
}

fn record(id: &str, ipv4: &str, port: u16, last_seen: String) -> PeerRecord {
    PeerRecord {
        node_id: id.to_string(),
        role: Role::Default,
        ipv4: ipv4.to_string(),
        ipv6: IPV6_NONE.to_string(),
        port,
        last_seen,
    }
}

fn node(dir: &Path, id: &str, port: u16) -> Arc<NodeContext> {
    Arc::new(NodeContext::new(
        NodeIdentity::new(id, Role::Default),
        port,
        PeerStore::new(dir.join(id).join("peers.yaml")),
        PublicAddressResolver::fixed(PublicAddresses::from_lookups("127.0.0.1", "")),
    ))
}

/// Bind a listener on an ephemeral port and build a node advertising it
async fn serving_node(dir: &Path, id: &str) -> (Arc<NodeContext>, SocketAddr) {
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let ctx = node(dir, id, addr.port());
    let listener = NexusListener::bind(addr, ctx.clone()).await.unwrap();
    listener.spawn();
    (ctx, addr)
}

#[tokio::test]
async fn test_tap_sync_converges_both_ends() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();

    let (server, server_addr) = serving_node(tmp.path(), "server").await;
    server
        .store
        .replace(PeerDirectory::from_records(vec![record("A", "", 1, at(10))]))
        .await;

    let client = node(tmp.path(), "client", 1);
    client
        .store
        .replace(PeerDirectory::from_records(vec![
            // No usable address, so never dialed
            record("A", "", 1, at(5)),
            record("B", "", 2, at(20)),
            record("server", "127.0.0.1", server_addr.port(), at(1)),
        ]))
        .await;

    let outcome = tap_sync(&client).await;
    assert_eq!(
        outcome,
        TapSyncOutcome::Synced {
            node_id: "server".to_string(),
            addr: server_addr,
            via: SyncVia::Remote,
            removed: vec![],
        }
    );

    let server_dir = server.store.read().await;
    let client_dir = client.store.read().await;

    for dir in [&server_dir, &client_dir] {
        assert_eq!(dir.get("A").unwrap().last_seen, at(10));
        assert_eq!(dir.get("B").unwrap().last_seen, at(20));
        assert!(dir.contains("server"));
        assert!(dir.contains("client"));
        assert_eq!(dir.len(), 4);
    }
    assert_eq!(server_dir, client_dir);
}

#[tokio::test]
async fn test_peerlist_over_tcp() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();

    let (server, addr) = serving_node(tmp.path(), "server").await;
    server
        .store
        .replace(PeerDirectory::from_records(vec![record(
            "server", "9.9.9.9", 1, at(1),
        )]))
        .await;

    let dir = fetch_peer_list(addr).await.unwrap();
    let me = dir.get("server").unwrap();
    assert_eq!(dir.len(), 1);
    assert_eq!(me.ipv4, "127.0.0.1");
    assert_eq!(me.port, addr.port());
    assert!(Utc::now() - me.last_seen_at().unwrap() < ChronoDuration::minutes(1));
    assert_eq!(server.store.read().await, dir);
}

#[tokio::test]
async fn test_bootstrap_from_manual_seed() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();

    let (seed, seed_addr) = serving_node(tmp.path(), "seed").await;
    seed.store
        .replace(PeerDirectory::from_records(vec![record(
            "far-away",
            "10.1.1.1",
            51613,
            format_timestamp(Utc::now()),
        )]))
        .await;

    let (newcomer, _) = serving_node(tmp.path(), "newcomer").await;
    let opts = BootstrapOptions {
        enable_upnp: false,
        listen_grace: Duration::from_millis(50),
    };
    let input = format!("not-an-address\n{}\n", seed_addr);
    let mut prompt = Vec::new();

    let outcome = bootstrap(&newcomer, &opts, BufReader::new(input.as_bytes()), &mut prompt).await;
    assert_eq!(
        outcome,
        BootstrapOutcome::Seeded {
            peer: seed_addr,
            fetched: 2,
        }
    );

    let dir = newcomer.store.read().await;
    let ids: Vec<&str> = dir.node_ids().collect();
    assert_eq!(ids, vec!["far-away", "newcomer", "seed"]);

    // A second start finds peers and does not prompt
    let mut prompt = Vec::new();
    let outcome = bootstrap(&newcomer, &opts, BufReader::new(&b""[..]), &mut prompt).await;
    assert_eq!(outcome, BootstrapOutcome::AlreadySeeded { peers: 3 });
    assert!(prompt.is_empty());
}

#[tokio::test]
async fn test_concurrent_syncs_lose_nothing() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let (server, server_addr) = serving_node(tmp.path(), "server").await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let id = format!("client-{}", i);
        let client = node(tmp.path(), &id, 1000 + i);
        client
            .store
            .replace(PeerDirectory::from_records(vec![record(
                "server",
                "127.0.0.1",
                server_addr.port(),
                at(1),
            )]))
            .await;
        tasks.push(tokio::spawn(async move { tap_sync(&client).await }));
    }

    for task in tasks {
        let outcome = task.await.unwrap();
        assert!(matches!(outcome, TapSyncOutcome::Synced { .. }));
    }

    let dir = server.store.read().await;
    for i in 0..8 {
        assert!(dir.contains(&format!("client-{}", i)));
    }
    assert_eq!(dir.len(), 9);
    assert_eq!(server.active_peer_count().await, 8);
}

/// Echo service that accepts connections and never answers
async fn silent_echo_service() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    url
}

#[tokio::test]
async fn test_peerlist_answers_while_echo_service_hangs() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let echo = silent_echo_service().await;

    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let ctx = Arc::new(NodeContext::new(
        NodeIdentity::new("server", Role::Default),
        addr.port(),
        PeerStore::new(tmp.path().join("peers.yaml")),
        PublicAddressResolver::http(echo.clone(), echo, Duration::ZERO).unwrap(),
    ));
    NexusListener::bind(addr, ctx.clone()).await.unwrap().spawn();

    // The first request still pays for one bounded lookup
    let dir = fetch_peer_list(addr).await.unwrap();
    assert_eq!(dir.get("server").unwrap().ipv4, "");

    // Later ones are answered from cache while the refresh keeps hanging
    let started = std::time::Instant::now();
    let dir = fetch_peer_list(addr).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(dir.len(), 1);
}
