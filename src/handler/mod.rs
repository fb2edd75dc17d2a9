//! Handler module - per-command replies and session observers.
//!
//! Provides:
//! - [`Handler`] - capability set the session needs from a command handler
//! - [`HandlerRegistry`] - maps command ids to handlers
//! - [`BuiltinHandler`] - handlers for the protocol-mandated replies
//! - [`TerminalEvents`] - connection-scoped notifications
//!
//! # Example
//!
//! ```ignore
//! use bytes::Bytes;
//! use jt808_gateway::handler::{Handler, HandlerRegistry};
//! use jt808_gateway::protocol::Message;
//!
//! struct Ignore;
//!
//! impl Handler for Ignore {
//!     fn has_reply(&self) -> bool { false }
//!     fn reply_body(&self, _msg: &Message) -> jt808_gateway::error::Result<Bytes> { Ok(Bytes::new()) }
//!     fn reply_protocol(&self) -> u16 { 0 }
//! }
//!
//! let mut registry = HandlerRegistry::with_builtins();
//! registry.register(0x0900, Ignore);
//! ```

mod builtin;
mod events;
mod registry;

pub use builtin::{general_respond, BuiltinHandler};
pub use events::{NoopEvents, TerminalEvents};
pub use registry::{Handler, HandlerRegistry};
