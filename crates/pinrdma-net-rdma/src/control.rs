//! TCP control channel used for the out-of-band handshake.

use std::fmt;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::config::SessionConfig;
use crate::error::RdmaError;

/// Which end of the control channel this party is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Binds, listens and accepts one connection.
    Server,
    /// Connects to the server.
    Client,
}

impl Role {
    /// The wildcard address selects the server role.
    pub fn from_addr(addr: &SocketAddrV4) -> Role {
        if addr.ip().is_unspecified() {
            Role::Server
        } else {
            Role::Client
        }
    }

    pub fn is_server(self) -> bool {
        self == Role::Server
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// A connected, bidirectional control stream.
pub trait ControlStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ControlStream for T {}

/// Opens the control channel for one session.
#[async_trait]
pub trait ControlConnector: Send + Sync {
    async fn establish(&self, role: Role, addr: SocketAddrV4) -> Result<Box<dyn ControlStream>, RdmaError>;
}

/// Control channel over plain TCP.
pub struct TcpControlConnector {
    backlog: u32,
    reuse_port: bool,
    retries: u32,
    retry_interval: Duration,
    prebound: parking_lot::Mutex<Option<TcpListener>>,
}

impl TcpControlConnector {
    pub fn new(cfg: &SessionConfig) -> Self {
        Self {
            backlog: cfg.listen_backlog,
            reuse_port: cfg.reuse_port,
            retries: cfg.connect_retries,
            retry_interval: cfg.connect_retry_interval(),
            prebound: parking_lot::Mutex::new(None),
        }
    }

    /// Serve the next session from an already-bound listener instead of
    /// binding the requested port. Used when the port is picked by the OS.
    pub fn with_listener(self, listener: TcpListener) -> Self {
        *self.prebound.lock() = Some(listener);
        self
    }

    fn listen(&self, addr: SocketAddrV4) -> io::Result<TcpListener> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        #[cfg(unix)]
        if self.reuse_port {
            socket.set_reuseport(true)?;
        }
        socket.bind(SocketAddr::V4(addr))?;
        socket.listen(self.backlog)
    }

    async fn accept(&self, addr: SocketAddrV4) -> Result<TcpStream, RdmaError> {
        let prebound = self.prebound.lock().take();
        let listener = match prebound {
            Some(l) => l,
            None => self.listen(addr).map_err(|e| RdmaError::transport("listen", e))?,
        };
        let local = listener.local_addr().ok();
        tracing::debug!(?local, "waiting for control connection");
        let (stream, peer) = listener.accept().await.map_err(|e| RdmaError::transport("accept", e))?;
        tracing::debug!(%peer, "control connection accepted");
        Ok(stream)
    }

    async fn connect(&self, addr: SocketAddrV4) -> Result<TcpStream, RdmaError> {
        let mut attempt = 0;
        loop {
            match TcpStream::connect(SocketAddr::V4(addr)).await {
                Ok(stream) => {
                    tracing::debug!(%addr, attempt, "control connection established");
                    return Ok(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused && attempt < self.retries => {
                    attempt += 1;
                    tracing::debug!(%addr, attempt, "connection refused, retrying");
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(e) => return Err(RdmaError::transport("connect", e)),
            }
        }
    }
}

#[async_trait]
impl ControlConnector for TcpControlConnector {
    async fn establish(&self, role: Role, addr: SocketAddrV4) -> Result<Box<dyn ControlStream>, RdmaError> {
        let stream = match role {
            Role::Server => self.accept(addr).await?,
            Role::Client => self.connect(addr).await?,
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(error = %e, "failed to set TCP_NODELAY on control stream");
        }
        Ok(Box::new(stream))
    }
}
