//! # jt808-gateway
//!
//! Session engine for JT/T 808 vehicle terminal gateways.
//!
//! Terminals keep one TCP connection open to the platform. Per connection this
//! crate decodes the escaped, checksummed frame format (both the 2013 and 2019
//! header revisions, with sub-package reassembly), dispatches messages to
//! per-command handlers, writes the replies the protocol mandates, and lets the
//! platform issue its own commands and await the terminal's answer.
//!
//! ## Architecture
//!
//! - **Codec** ([`protocol`]): `FrameBuffer` turns raw bytes into [`Message`]s
//! - **Handlers** ([`handler`]): command id → reply logic and events
//! - **Session** ([`session`]): one reader task and one writer task per connection
//! - **Directory** ([`directory`]): terminal identity → session, for active commands
//!
//! ## Example
//!
//! ```ignore
//! use jt808_gateway::Gateway;
//!
//! #[tokio::main]
//! async fn main() -> jt808_gateway::Result<()> {
//!     let gateway = Gateway::builder().bind("0.0.0.0:808").await?;
//!     gateway.run().await
//! }
//! ```

pub mod active;
pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod protocol;
pub mod session;
pub mod transport;

mod writer;

pub use active::{ActiveMessage, ActiveResult, ActiveSender};
pub use config::SessionConfig;
pub use directory::TerminalDirectory;
pub use error::{ErrorKind, GatewayError, Result};
pub use gateway::{Gateway, GatewayBuilder};
pub use handler::{BuiltinHandler, Handler, HandlerRegistry, NoopEvents, TerminalEvents};
pub use protocol::{Header, Message, ProtocolVersion};
pub use session::{Session, SessionHandle, SessionHooks, SessionState};
