//! Nexus listener
//!
//! Accepts TCP connections and serves `PEERLIST` and `SYNC` against the
//! node's peer store. Each connection runs in its own task and carries a
//! single exchange.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::NodeContext;
use crate::peer::merge;
use crate::protocol::{Command, FramedStream, ProtocolError, COMMAND_READ_TIMEOUT, SYNC_READ_TIMEOUT};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bound TCP listener serving the nexus protocol
pub struct NexusListener {
    listener: TcpListener,
    ctx: Arc<NodeContext>,
}

impl NexusListener {
    pub async fn bind(addr: SocketAddr, ctx: Arc<NodeContext>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(target: "nexus", addr = %listener.local_addr()?, "Listening for connections");
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, remote)) => {
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, remote, &ctx).await {
                            debug!(target: "nexus", peer = %remote, error = %e, "Exchange ended early");
                        }
                    });
                }
                Err(e) => {
                    warn!(target: "nexus", error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// Serve one inbound exchange
pub async fn handle_connection<S>(
    stream: S,
    remote: SocketAddr,
    ctx: &NodeContext,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = FramedStream::new(stream);

    let command = match conn.read_command(COMMAND_READ_TIMEOUT).await? {
        Some(command) => command,
        None => {
            debug!(target: "nexus", peer = %remote, "Unrecognized command, closing");
            return Ok(());
        }
    };
    debug!(target: "nexus", peer = %remote, %command, "Command received");

    match command {
        Command::PeerList => serve_peer_list(&mut conn, ctx).await?,
        Command::Sync => serve_sync(&mut conn, remote, ctx).await?,
    }

    let _ = conn.shutdown().await;
    Ok(())
}

async fn serve_peer_list<S>(conn: &mut FramedStream<S>, ctx: &NodeContext) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let dir = ctx.refresh_self().await;
    conn.send_directory(&dir).await
}

async fn serve_sync<S>(
    conn: &mut FramedStream<S>,
    remote: SocketAddr,
    ctx: &NodeContext,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = ctx.refresh_self().await;
    conn.send_directory(&ours).await?;

    let theirs = match conn.read_directory(SYNC_READ_TIMEOUT).await {
        Ok(dir) => dir,
        Err(ProtocolError::Json(e)) => {
            error!(target: "sync", peer = %remote, error = %e, "Invalid sync data from peer");
            return Err(ProtocolError::Json(e));
        }
        Err(e) => return Err(e),
    };

    let merged = ctx
        .store
        .update(|dir| {
            *dir = merge(dir, &theirs);
            dir.clone()
        })
        .await;

    info!(
        target: "sync",
        peer = %remote,
        received = theirs.len(),
        total = merged.len(),
        "Merged peer directory"
    );
    conn.send_directory(&merged).await
}
