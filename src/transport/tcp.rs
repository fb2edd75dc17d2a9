//! TCP listener for terminal connections.
//!
//! # Example
//!
//! ```ignore
//! use jt808_gateway::transport::TcpAcceptor;
//!
//! let acceptor = TcpAcceptor::bind("0.0.0.0:8080").await?;
//! let (stream, peer) = acceptor.accept().await?;
//! ```

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::error::Result;

/// Listener handing out connected terminal streams.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind to an address. Port 0 picks a free port.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Accept a single connection.
    ///
    /// Nagle is disabled: replies are small and latency-sensitive.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer))
    }

    /// Get the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
