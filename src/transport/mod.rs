//! Transport module - accepting terminal connections.
//!
//! Sessions run over any `AsyncRead + AsyncWrite` stream; this module
//! provides the TCP listener the gateway accepts terminals on.

mod tcp;

pub use tcp::TcpAcceptor;
