//! Nexus wire protocol
//!
//! One TCP connection carries one exchange of newline-terminated frames.
//! Commands are bare keywords; data frames are JSON arrays of peer records.
//!
//! ```text
//! PEERLIST:  client -> "PEERLIST\n"
//!            server -> <directory json>\n
//!
//! SYNC:      client -> "SYNC\n"
//!            server -> <server directory json>\n
//!            client -> <client directory json>\n
//!            server -> <merged directory json>\n
//! ```
//!
//! Every read and write is bounded by an explicit deadline.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::peer::PeerDirectory;

/// Dial timeout for outbound connections
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for client-side reads and for all writes
pub const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the server's initial command line
pub const COMMAND_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the client directory during a server-side SYNC
pub const SYNC_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest frame accepted from a peer, newline included
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out while {0}")]
    Timeout(&'static str),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Frame exceeds maximum length")]
    FrameTooLong,

    #[error("Invalid peer data: {0}")]
    Json(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// Request keywords understood by the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    PeerList,
    Sync,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "PEERLIST" => Some(Command::PeerList),
            "SYNC" => Some(Command::Sync),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::PeerList => "PEERLIST",
            Command::Sync => "SYNC",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode one data frame
pub fn decode_directory(line: &str) -> Result<PeerDirectory> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Encode a data frame, newline included
pub fn encode_directory(dir: &PeerDirectory) -> Result<Vec<u8>> {
    let mut buf = serde_json::to_vec(dir)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Line-framed stream
pub struct FramedStream<S> {
    inner: BufReader<S>,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            inner: BufReader::new(stream),
        }
    }

    /// Read one line (without its terminator) within `deadline`
    pub async fn read_line(&mut self, deadline: Duration) -> Result<String> {
        let mut line = String::new();
        let limit = (MAX_FRAME_LEN + 1) as u64;

        let n = timeout(deadline, (&mut self.inner).take(limit).read_line(&mut line))
            .await
            .map_err(|_| ProtocolError::Timeout("reading frame"))??;

        if n == 0 {
            return Err(ProtocolError::Closed);
        }
        if !line.ends_with('\n') && n > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLong);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    pub async fn read_command(&mut self, deadline: Duration) -> Result<Option<Command>> {
        let line = self.read_line(deadline).await?;
        Ok(Command::parse(&line))
    }

    pub async fn read_directory(&mut self, deadline: Duration) -> Result<PeerDirectory> {
        let line = self.read_line(deadline).await?;
        decode_directory(&line)
    }

    pub async fn send_command(&mut self, command: Command) -> Result<()> {
        let frame = format!("{}\n", command.as_str());
        self.write_all(frame.as_bytes()).await
    }

    pub async fn send_directory(&mut self, dir: &PeerDirectory) -> Result<()> {
        let frame = encode_directory(dir)?;
        self.write_all(&frame).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.get_mut().shutdown().await?;
        Ok(())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.inner.get_mut();
        timeout(CLIENT_READ_TIMEOUT, async {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| ProtocolError::Timeout("writing frame"))??;
        Ok(())
    }
}

/// Dial `addr` within [`CONNECT_TIMEOUT`]
pub async fn connect(addr: SocketAddr) -> Result<FramedStream<TcpStream>> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| ProtocolError::Timeout("connecting"))??;
    Ok(FramedStream::new(stream))
}

/// Ask the node at `addr` for its full directory
pub async fn fetch_peer_list(addr: SocketAddr) -> Result<PeerDirectory> {
    let mut conn = connect(addr).await?;
    conn.send_command(Command::PeerList).await?;

    let dir = conn.read_directory(CLIENT_READ_TIMEOUT).await?;
    let _ = conn.shutdown().await;

    info!(target: "nexus", peer = %addr, count = dir.len(), "Peer list received");
    debug!(target: "nexus", peer = %addr, ids = ?dir.node_ids().collect::<Vec<_>>(), "Peer list contents");
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerRecord, Role};
    use tokio::io::duplex;

    fn sample() -> PeerDirectory {
        PeerDirectory::from_records(vec![PeerRecord {
            node_id: "abc".to_string(),
            role: Role::Default,
            ipv4: "10.1.2.3".to_string(),
            ipv6: "none".to_string(),
            port: 51613,
            last_seen: "2025-01-01T00:00:00Z".to_string(),
        }])
    }

    #[test]
    fn test_command_parse() {
        assert_eq!(Command::parse("PEERLIST"), Some(Command::PeerList));
        assert_eq!(Command::parse("  SYNC\r\n"), Some(Command::Sync));
        assert_eq!(Command::parse("sync"), None);
        assert_eq!(Command::parse("PEERLISTX"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[test]
    fn test_encoded_frame_is_single_line() {
        let frame = encode_directory(&sample()).unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (a, b) = duplex(64 * 1024);
        let mut client = FramedStream::new(a);
        let mut server = FramedStream::new(b);

        client.send_command(Command::Sync).await.unwrap();
        client.send_directory(&sample()).await.unwrap();

        assert_eq!(
            server.read_command(COMMAND_READ_TIMEOUT).await.unwrap(),
            Some(Command::Sync)
        );
        assert_eq!(
            server.read_directory(SYNC_READ_TIMEOUT).await.unwrap(),
            sample()
        );
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let (_a, b) = duplex(1024);
        let mut server = FramedStream::new(b);

        let err = server
            .read_line(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_closed_stream() {
        let (a, b) = duplex(1024);
        drop(a);
        let mut server = FramedStream::new(b);

        assert!(matches!(
            server.read_line(CLIENT_READ_TIMEOUT).await,
            Err(ProtocolError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let (mut a, b) = duplex(1024);
        a.write_all(b"[{\"node_id\": 5}\n").await.unwrap();
        let mut server = FramedStream::new(b);

        assert!(matches!(
            server.read_directory(SYNC_READ_TIMEOUT).await,
            Err(ProtocolError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, b) = duplex(MAX_FRAME_LEN + 1024);
        let writer = tokio::spawn(async move {
            let blob = vec![b'x'; MAX_FRAME_LEN + 10];
            let _ = a.write_all(&blob).await;
            a
        });

        let mut server = FramedStream::new(b);
        assert!(matches!(
            server.read_line(CLIENT_READ_TIMEOUT).await,
            Err(ProtocolError::FrameTooLong)
        ));
        drop(writer.await);
    }

    #[tokio::test]
    async fn test_fetch_from_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(fetch_peer_list(addr).await.is_err());
    }
}
