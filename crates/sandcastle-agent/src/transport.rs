//! Connection contract for sandbox control channels
//!
//! Request/response framing lives above this layer. The pool and the process
//! tracker only need to open a connection, ask whether it is still up, and
//! close it.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// A persistent bidirectional connection to a sandbox
#[async_trait::async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Establish the connection; `false` if it could not be opened in time
    async fn connect(&mut self, timeout: Duration) -> bool;

    fn is_connected(&self) -> bool;

    async fn disconnect(&mut self);
}

/// Creates fresh, not yet connected [`Connection`]s for one endpoint
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    fn create(&self) -> Self::Conn;

    /// Human-readable endpoint for diagnostics
    fn endpoint(&self) -> String;
}

/// Loopback TCP connection to a network tool server or control endpoint
#[derive(Debug)]
pub struct TcpTransport {
    addr: SocketAddr,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, stream: None }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The underlying stream for the framing layer
    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }
}

#[async_trait::async_trait]
impl Connection for TcpTransport {
    async fn connect(&mut self, connect_timeout: Duration) -> bool {
        match timeout(connect_timeout, TcpStream::connect(self.addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(addr = %self.addr, error = %e, "Could not set TCP_NODELAY");
                }
                self.stream = Some(stream);
                true
            }
            Ok(Err(e)) => {
                tracing::debug!(addr = %self.addr, error = %e, "TCP connect failed");
                false
            }
            Err(_) => {
                tracing::debug!(addr = %self.addr, timeout = ?connect_timeout, "TCP connect timed out");
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|stream| stream.peer_addr().is_ok())
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            use tokio::io::AsyncWriteExt;
            let _ = stream.shutdown().await;
        }
    }
}

/// Builds [`TcpTransport`]s for a fixed address
#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Connector for TcpConnector {
    type Conn = TcpTransport;

    fn create(&self) -> TcpTransport {
        TcpTransport::new(self.addr)
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}
