//! Tap-sync: periodic outbound gossip
//!
//! Each round picks known peers in random order and runs a `SYNC` exchange
//! with the first one that answers. Peers that cannot be dialed are dropped
//! once they have been silent for longer than [`STALE_AFTER_HOURS`].

use chrono::{Duration as ChronoDuration, Utc};
use rand::seq::SliceRandom;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::context::NodeContext;
use crate::peer::{merge, PeerDirectory, PeerRecord};
use crate::protocol::{self, Command, FramedStream, ProtocolError, CLIENT_READ_TIMEOUT};

/// Unreachable peers older than this are removed
pub const STALE_AFTER_HOURS: i64 = 24;

/// Where the final directory of a successful round came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncVia {
    /// The peer answered with its merged directory
    Remote,
    /// The peer went quiet after sending its list; merged locally
    LocalMerge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapSyncOutcome {
    /// Nothing to dial
    NoCandidates,
    Synced {
        node_id: String,
        addr: SocketAddr,
        via: SyncVia,
        removed: Vec<String>,
    },
    /// Every candidate failed
    Exhausted {
        attempted: usize,
        removed: Vec<String>,
    },
}

/// Peers worth dialing: everyone but us with a parseable `ipv4`
pub fn candidates(dir: &PeerDirectory, self_id: &str) -> Vec<(PeerRecord, SocketAddr)> {
    dir.iter()
        .filter(|p| p.node_id != self_id)
        .filter_map(|p| {
            let ip = p.ipv4.trim().parse::<IpAddr>().ok()?;
            Some((p.clone(), SocketAddr::new(ip, p.port)))
        })
        .collect()
}

/// Run one tap-sync round
pub async fn tap_sync(ctx: &NodeContext) -> TapSyncOutcome {
    let dir = ctx.store.read().await;
    let mut targets = candidates(&dir, ctx.node_id());

    if targets.is_empty() {
        warn!(target: "tapsync", known = dir.len(), "No peers available to sync with");
        return TapSyncOutcome::NoCandidates;
    }

    targets.shuffle(&mut rand::thread_rng());

    let mut removed = Vec::new();
    let attempted = targets.len();

    for (peer, addr) in targets {
        debug!(target: "tapsync", peer = %addr, node_id = %peer.node_id, "Attempting sync");

        let mut conn = match protocol::connect(addr).await {
            Ok(conn) => conn,
            Err(e) => {
                match drop_if_stale(ctx, &peer.node_id).await {
                    Staleness::Removed => {
                        info!(
                            target: "tapsync",
                            node_id = %peer.node_id,
                            error = %e,
                            "Peer offline for over {}h, removing",
                            STALE_AFTER_HOURS
                        );
                        removed.push(peer.node_id);
                    }
                    Staleness::Kept => {
                        warn!(
                            target: "tapsync",
                            node_id = %peer.node_id,
                            error = %e,
                            "Peer offline but recently seen, keeping"
                        );
                    }
                    Staleness::Gone => {
                        debug!(
                            target: "tapsync",
                            node_id = %peer.node_id,
                            error = %e,
                            "Peer offline and already removed"
                        );
                    }
                }
                continue;
            }
        };

        match exchange(&mut conn, ctx).await {
            Ok(via) => {
                let _ = conn.shutdown().await;
                info!(target: "tapsync", peer = %addr, node_id = %peer.node_id, ?via, "Sync complete");
                return TapSyncOutcome::Synced {
                    node_id: peer.node_id,
                    addr,
                    via,
                    removed,
                };
            }
            Err(e) => {
                warn!(target: "tapsync", peer = %addr, error = %e, "Sync failed, trying next peer");
            }
        }
    }

    warn!(target: "tapsync", attempted, "No peer completed a sync this round");
    TapSyncOutcome::Exhausted { attempted, removed }
}

/// What [`drop_if_stale`] found for an unreachable peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Staleness {
    Removed,
    Kept,
    /// No longer in the store
    Gone,
}

/// Remove `node_id` if its stored record is past the staleness threshold
async fn drop_if_stale(ctx: &NodeContext, node_id: &str) -> Staleness {
    let now = Utc::now();
    let threshold = ChronoDuration::hours(STALE_AFTER_HOURS);
    ctx.store
        .update(|dir| match dir.get(node_id) {
            None => Staleness::Gone,
            Some(p) if p.is_stale(now, threshold) => {
                dir.remove(node_id);
                Staleness::Removed
            }
            Some(_) => Staleness::Kept,
        })
        .await
}

/// Client side of `SYNC` over an open connection
async fn exchange<S>(conn: &mut FramedStream<S>, ctx: &NodeContext) -> Result<SyncVia, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send_command(Command::Sync).await?;
    let theirs = conn.read_directory(CLIENT_READ_TIMEOUT).await?;
    debug!(target: "tapsync", count = theirs.len(), "Received peer directory");

    // Persisted before continuing so the refresh survives a broken exchange
    let ours = ctx.touch_self().await;

    let merged = match conn.send_directory(&ours).await {
        Ok(()) => conn.read_directory(CLIENT_READ_TIMEOUT).await,
        Err(e) => Err(e),
    };

    match merged {
        Ok(merged) => {
            ctx.store
                .update(|dir| *dir = merge(dir, &merged))
                .await;
            Ok(SyncVia::Remote)
        }
        Err(e) => {
            debug!(target: "tapsync", error = %e, "No merged reply, merging locally");
            ctx.store
                .update(|dir| *dir = merge(dir, &theirs))
                .await;
            Ok(SyncVia::LocalMerge)
        }
    }
}

/// Run [`tap_sync`] every `period`, starting immediately
pub async fn run_tap_sync_loop(ctx: Arc<NodeContext>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        debug!(target: "tapsync", "Running tap-sync");
        let outcome = tap_sync(&ctx).await;
        debug!(target: "tapsync", ?outcome, "Tap-sync round finished");
    }
}
