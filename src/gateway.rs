//! Gateway builder and accept loop.
//!
//! The [`GatewayBuilder`] provides a fluent API for registering handlers,
//! observers and session settings. The [`Gateway`] accepts terminal
//! connections and runs one [`Session`] per connection, each with its own
//! clone of the handler registry, all sharing one [`TerminalDirectory`].
//!
//! # Example
//!
//! ```ignore
//! use jt808_gateway::Gateway;
//!
//! #[tokio::main]
//! async fn main() -> jt808_gateway::Result<()> {
//!     let gateway = Gateway::builder()
//!         .default_active_timeout(std::time::Duration::from_secs(8))
//!         .bind("0.0.0.0:808")
//!         .await?;
//!
//!     let directory = gateway.directory();
//!     tokio::spawn(gateway.run());
//!     // directory.send(key, 0x8104, Bytes::new(), None).await?
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::ToSocketAddrs;

use crate::config::SessionConfig;
use crate::directory::TerminalDirectory;
use crate::error::Result;
use crate::handler::{Handler, HandlerRegistry, NoopEvents, TerminalEvents};
use crate::protocol::ReassemblyMode;
use crate::session::{Session, SessionHandle, SessionState};
use crate::transport::TcpAcceptor;

/// Builder for configuring and creating a gateway.
///
/// Starts with every built-in handler registered.
pub struct GatewayBuilder {
    registry: HandlerRegistry,
    config: SessionConfig,
    events: Arc<dyn TerminalEvents>,
    directory: Arc<TerminalDirectory>,
}

impl GatewayBuilder {
    /// Create a new gateway builder.
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::with_builtins(),
            config: SessionConfig::default(),
            events: Arc::new(NoopEvents),
            directory: Arc::new(TerminalDirectory::new()),
        }
    }

    /// Register a handler, replacing any previous one for the command.
    pub fn handler<H: Handler>(mut self, command: u16, handler: H) -> Self {
        self.registry.register(command, handler);
        self
    }

    /// Register an already shared handler.
    pub fn handler_shared(mut self, command: u16, handler: Arc<dyn Handler>) -> Self {
        self.registry.register_shared(command, handler);
        self
    }

    /// Replace the whole handler registry.
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the observer for session activity.
    pub fn events<E: TerminalEvents>(mut self, events: E) -> Self {
        self.events = Arc::new(events);
        self
    }

    /// Share an existing terminal directory.
    pub fn directory(mut self, directory: Arc<TerminalDirectory>) -> Self {
        self.directory = directory;
        self
    }

    /// Replace the whole session configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the inbound queue capacity.
    ///
    /// Default: 10
    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.config.inbound_capacity = capacity;
        self
    }

    /// Set the active command queue capacity.
    ///
    /// Default: 3
    pub fn active_capacity(mut self, capacity: usize) -> Self {
        self.config.active_capacity = capacity;
        self
    }

    /// Set the reissue queue capacity.
    ///
    /// Default: 3
    pub fn reissue_capacity(mut self, capacity: usize) -> Self {
        self.config.reissue_capacity = capacity;
        self
    }

    /// Set the response timeout for active commands without an override.
    ///
    /// Default: 5 seconds
    pub fn default_active_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_active_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the socket read buffer size.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Set how sub-package parts are surfaced.
    pub fn reassembly_mode(mut self, mode: ReassemblyMode) -> Self {
        self.config.reassembly_mode = mode;
        self
    }

    /// Skip read/write events for incomplete sub-package parts.
    pub fn filter_incomplete_events(mut self, filter: bool) -> Self {
        self.config.filter_incomplete_events = filter;
        self
    }

    /// Validate the configuration and bind the listener.
    pub async fn bind(self, addr: impl ToSocketAddrs) -> Result<Gateway> {
        self.config.validate()?;
        let acceptor = TcpAcceptor::bind(addr).await?;
        tracing::info!(addr = ?acceptor.local_addr().ok(), "Gateway listening");

        Ok(Gateway {
            acceptor,
            registry: self.registry,
            config: self.config,
            events: self.events,
            directory: self.directory,
        })
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound gateway.
pub struct Gateway {
    acceptor: TcpAcceptor,
    registry: HandlerRegistry,
    config: SessionConfig,
    events: Arc<dyn TerminalEvents>,
    directory: Arc<TerminalDirectory>,
}

impl Gateway {
    /// Create a new gateway builder.
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Get the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Directory of joined terminals, for issuing active commands.
    pub fn directory(&self) -> Arc<TerminalDirectory> {
        self.directory.clone()
    }

    /// Run a session over an already connected stream.
    pub fn serve<S>(&self, stream: S) -> Result<SessionHandle>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = Session::new(
            stream,
            self.registry.clone(),
            self.directory.clone(),
            self.events.clone(),
            self.config.clone(),
        )?;
        Ok(session.start())
    }

    /// Accept terminals until the process ends.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept terminals until `shutdown` resolves, then stop every session.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut sessions: Vec<SessionHandle> = Vec::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.acceptor.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "Terminal connected");
                        sessions.retain(|s| s.state() != SessionState::Stopped);
                        match self.serve(stream) {
                            Ok(session) => sessions.push(session),
                            Err(e) => tracing::error!(%peer, "Session rejected: {}", e),
                        }
                    }
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                },
            }
        }

        tracing::info!(sessions = sessions.len(), "Gateway shutting down");
        for session in &sessions {
            session.stop();
        }
        for session in &sessions {
            session.wait().await;
        }
        Ok(())
    }
}
