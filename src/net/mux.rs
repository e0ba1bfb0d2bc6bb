//! Header-byte multiplexer over a single TCP listener.

use crate::{Error, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(30);
const LISTENER_BACKLOG: usize = 64;

/// Routes inbound connections to per-service listeners by their first byte.
pub struct Mux {
    listener: TcpListener,
    addr: SocketAddr,
    handlers: HashMap<u8, mpsc::Sender<TcpStream>>,
    header_timeout: Duration,
}

impl Mux {
    pub fn new(listener: TcpListener) -> Result<Self> {
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            handlers: HashMap::new(),
            header_timeout: DEFAULT_HEADER_TIMEOUT,
        })
    }

    pub fn with_header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Register a service for `header`. Each header may be claimed once.
    pub fn listen(&mut self, header: u8) -> Result<MuxListener> {
        if self.handlers.contains_key(&header) {
            return Err(Error::Config(format!(
                "mux header {} already registered",
                header
            )));
        }
        let (tx, rx) = mpsc::channel(LISTENER_BACKLOG);
        self.handlers.insert(header, tx);
        Ok(MuxListener {
            rx,
            addr: self.addr,
            header,
        })
    }

    /// Accept connections until `cancel` fires.
    pub async fn serve(self, cancel: CancellationToken) {
        let handlers = Arc::new(self.handlers);
        info!(addr = %self.addr, services = handlers.len(), "Cluster mux listening");

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (mut stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Cluster accept failed");
                    continue;
                }
            };

            let handlers = handlers.clone();
            let header_timeout = self.header_timeout;
            tokio::spawn(async move {
                let header = match tokio::time::timeout(header_timeout, stream.read_u8()).await {
                    Ok(Ok(b)) => b,
                    Ok(Err(e)) => {
                        debug!(peer = %peer, error = %e, "Connection closed before mux header");
                        return;
                    }
                    Err(_) => {
                        warn!(peer = %peer, "Timed out reading mux header");
                        return;
                    }
                };

                match handlers.get(&header) {
                    Some(tx) => {
                        if tx.send(stream).await.is_err() {
                            debug!(peer = %peer, header, "Mux handler closed");
                        }
                    }
                    None => {
                        warn!(peer = %peer, header, "Unknown mux header, dropping connection");
                    }
                }
            });
        }

        info!(addr = %self.addr, "Cluster mux stopped");
    }
}

/// Stream of connections that arrived with one header byte.
pub struct MuxListener {
    rx: mpsc::Receiver<TcpStream>,
    addr: SocketAddr,
    header: u8,
}

impl MuxListener {
    /// Next connection, or `None` once the mux has stopped.
    pub async fn accept(&mut self) -> Option<TcpStream> {
        self.rx.recv().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn header(&self) -> u8 {
        self.header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn routes_by_header_byte() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut mux = Mux::new(listener).unwrap();
        let addr = mux.local_addr();
        let mut raft = mux.listen(8).unwrap();
        let mut cluster = mux.listen(2).unwrap();
        assert!(mux.listen(2).is_err(), "duplicate header must be rejected");

        let cancel = CancellationToken::new();
        tokio::spawn(mux.serve(cancel.clone()));

        let mut c1 = TcpStream::connect(addr).await.unwrap();
        c1.write_all(&[2, 42]).await.unwrap();
        let mut c2 = TcpStream::connect(addr).await.unwrap();
        c2.write_all(&[8, 7]).await.unwrap();

        let mut s = cluster.accept().await.unwrap();
        assert_eq!(s.read_u8().await.unwrap(), 42);
        let mut s = raft.accept().await.unwrap();
        assert_eq!(s.read_u8().await.unwrap(), 7);

        cancel.cancel();
    }
}
