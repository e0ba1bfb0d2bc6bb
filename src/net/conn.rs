//! Framed cluster connection with deadline enforcement.
//!
//! Frame layout: `[type: u8][len: u64 BE][payload: JSON]`.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Upper bound on a single frame payload.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

const FRAME_HEADER_LEN: usize = 9;

/// Encode a typed message into a frame.
pub fn encode_frame<T: Serialize>(typ: u8, msg: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(msg)?;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.push(typ);
    buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a frame payload.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

/// A cluster connection. Reads and writes fail with `Error::IoTimeout`
/// once the absolute deadline passes.
pub struct ClusterConn {
    stream: TcpStream,
    peer: String,
    deadline: Option<Instant>,
}

impl ClusterConn {
    pub fn new(stream: TcpStream, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
            deadline: None,
        }
    }

    /// Connect to `addr` and write the mux `header` byte, all before `deadline`.
    pub async fn connect(addr: &str, header: u8, deadline: Instant) -> Result<Self> {
        let stream = bounded(Some(deadline), "dial", async {
            TcpStream::connect(addr).await.map_err(|e| Error::Dial {
                addr: addr.to_string(),
                reason: e.to_string(),
            })
        })
        .await?;
        // Small RPC frames; latency matters more than batching.
        let _ = stream.set_nodelay(true);

        let mut conn = Self::new(stream, addr);
        conn.set_deadline(Some(deadline));
        conn.write_raw(&[header]).await?;
        Ok(conn)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Push the deadline `timeout` past now.
    pub fn extend_deadline(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    pub async fn write_frame<T: Serialize>(&mut self, typ: u8, msg: &T) -> Result<()> {
        let buf = encode_frame(typ, msg)?;
        self.write_raw(&buf).await
    }

    /// Read one frame; `Ok(None)` on a clean end of stream between frames.
    pub async fn try_read_frame(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        let deadline = self.deadline;
        bounded(deadline, "read", read_frame_from(&mut self.stream)).await
    }

    pub async fn read_frame(&mut self) -> Result<(u8, Vec<u8>)> {
        self.try_read_frame().await?.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before response",
            ))
        })
    }

    /// Read a frame and decode it, rejecting unexpected message types.
    pub async fn read_message<T: DeserializeOwned>(&mut self, expected: u8) -> Result<T> {
        let (typ, payload) = self.read_frame().await?;
        if typ != expected {
            return Err(Error::Serialization(format!(
                "unexpected message type {} from {} (want {})",
                typ, self.peer, expected
            )));
        }
        decode(&payload)
    }

    /// Whether the peer has closed an idle connection. Unsolicited data
    /// also counts, since the stream is no longer at a frame boundary.
    pub fn is_closed(&self) -> bool {
        let mut buf = [0u8; 1];
        match self.stream.try_read(&mut buf) {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
            _ => true,
        }
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    async fn write_raw(&mut self, buf: &[u8]) -> Result<()> {
        let deadline = self.deadline;
        bounded(deadline, "write", write_all_to(&mut self.stream, buf)).await
    }
}

async fn read_frame_from(stream: &mut TcpStream) -> Result<Option<(u8, Vec<u8>)>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let n = stream.read(&mut header[..1]).await?;
    if n == 0 {
        return Ok(None);
    }
    stream.read_exact(&mut header[1..]).await?;

    let typ = header[0];
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[1..]);
    let len = u64::from_be_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(Error::Serialization(format!(
            "frame of {} bytes exceeds limit of {}",
            len, MAX_FRAME_LEN
        )));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Some((typ, payload)))
}

async fn write_all_to(stream: &mut TcpStream, buf: &[u8]) -> Result<()> {
    stream.write_all(buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Run `fut` under an optional absolute deadline. A deadline that has
/// already passed fails without polling the operation.
async fn bounded<T, F>(deadline: Option<Instant>, op: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        None => fut.await,
        Some(deadline) => {
            if deadline <= Instant::now() {
                return Err(Error::IoTimeout(op.to_string()));
            }
            tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| Error::IoTimeout(op.to_string()))?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_cross_a_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let header = stream.read_u8().await.unwrap();
            let mut conn = ClusterConn::new(stream, "client");
            let (typ, payload) = conn.read_frame().await.unwrap();
            let msg: Vec<String> = decode(&payload).unwrap();
            (header, typ, msg, conn.try_read_frame().await.unwrap().is_none())
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut conn = ClusterConn::connect(&addr, 7, deadline).await.unwrap();
        conn.write_frame(3, &vec!["cpu".to_string()]).await.unwrap();
        conn.shutdown().await;

        let (header, typ, msg, eof) = server.await.unwrap();
        assert_eq!(header, 7);
        assert_eq!(typ, 3);
        assert_eq!(msg, vec!["cpu".to_string()]);
        assert!(eof, "clean close between frames should read as end of stream");
    }

    #[tokio::test]
    async fn idle_connection_reports_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = close_rx.await;
            drop(stream);
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        let conn = ClusterConn::connect(&addr, 2, deadline).await.unwrap();
        assert!(!conn.is_closed(), "open idle connection must be reusable");

        close_tx.send(()).unwrap();
        server.await.unwrap();
        let mut closed = false;
        for _ in 0..50 {
            if conn.is_closed() {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(closed, "peer close should be visible on the idle connection");
    }

    #[tokio::test]
    async fn expired_deadline_is_io_timeout() {
        let result = ClusterConn::connect("127.0.0.1:1", 2, Instant::now()).await;
        let err = result.err().expect("expired deadline must fail");
        assert!(err.is_timeout(), "expected i/o timeout, got {err}");
    }

    #[tokio::test]
    async fn silent_peer_trips_read_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let deadline = Instant::now() + Duration::from_millis(200);
        let mut conn = ClusterConn::connect(&addr, 2, deadline).await.unwrap();
        let err = conn.read_frame().await.unwrap_err();
        assert!(err.is_timeout(), "expected i/o timeout, got {err}");
    }
}
