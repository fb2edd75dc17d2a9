//! Handler registry for dispatching messages by command id.
//!
//! The registry maps command ids to handlers. Each session receives its own
//! clone when it is created, so lookups on the hot path never contend.
//!
//! # Example
//!
//! ```ignore
//! use jt808_gateway::handler::{BuiltinHandler, HandlerRegistry};
//!
//! let mut registry = HandlerRegistry::with_builtins();
//!
//! // Replace the heartbeat handler with a custom one
//! registry.register(0x0002, MyHeartbeat::default());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use super::BuiltinHandler;
use crate::error::Result;
use crate::protocol::Message;

/// Capability set every command handler provides.
///
/// `reply_body` is only called when `has_reply` returns true. The two
/// execution events are notifications and default to doing nothing.
pub trait Handler: Send + Sync + 'static {
    /// Whether the platform must answer this command.
    fn has_reply(&self) -> bool;

    /// Build the reply body for a received message.
    fn reply_body(&self, msg: &Message) -> Result<Bytes>;

    /// Command id of the reply.
    fn reply_protocol(&self) -> u16;

    /// Called after a message for this command has been read.
    fn on_read_execution_event(&self, _msg: &Message) {}

    /// Called after the platform wrote a frame for this command.
    fn on_write_execution_event(&self, _msg: &Message) {}
}

/// Registry mapping command ids to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    /// Handlers by command id.
    handlers: HashMap<u16, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every built-in handler.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for builtin in BuiltinHandler::ALL {
            registry.register(builtin.command(), builtin);
        }
        registry
    }

    /// Register a handler, replacing any previous one for the command.
    pub fn register<H: Handler>(&mut self, command: u16, handler: H) {
        self.handlers.insert(command, Arc::new(handler));
    }

    /// Register an already shared handler.
    pub fn register_shared(&mut self, command: u16, handler: Arc<dyn Handler>) {
        self.handlers.insert(command, handler);
    }

    /// Remove the handler for a command.
    pub fn unregister(&mut self, command: u16) -> Option<Arc<dyn Handler>> {
        self.handlers.remove(&command)
    }

    /// Get the handler for a command.
    pub fn get(&self, command: u16) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&command).cloned()
    }

    /// Check whether a command has a handler.
    pub fn contains(&self, command: u16) -> bool {
        self.handlers.contains_key(&command)
    }

    /// Registered command ids, sorted.
    pub fn commands(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Drop every handler.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command;

    struct Silent;

    impl Handler for Silent {
        fn has_reply(&self) -> bool {
            false
        }

        fn reply_body(&self, _msg: &Message) -> Result<Bytes> {
            Ok(Bytes::new())
        }

        fn reply_protocol(&self) -> u16 {
            0
        }
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register(0x0f01, Silent);

        assert!(registry.contains(0x0f01));
        assert!(registry.get(0x0f01).is_some());
        assert!(registry.get(0x0f02).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = HandlerRegistry::with_builtins();
        assert!(registry.get(command::T0002_HEARTBEAT).unwrap().has_reply());

        registry.register(command::T0002_HEARTBEAT, Silent);
        assert!(!registry.get(command::T0002_HEARTBEAT).unwrap().has_reply());
    }

    #[test]
    fn test_with_builtins_covers_commands() {
        let registry = HandlerRegistry::with_builtins();
        let commands = registry.commands();

        assert_eq!(commands.len(), BuiltinHandler::ALL.len());
        assert!(commands.contains(&command::T0001_GENERAL_RESPOND));
        assert!(commands.contains(&command::T0100_REGISTER));
        assert!(commands.contains(&command::P8003_REISSUE_SUB_PACKAGE));
        assert!(!commands.contains(&command::P8104_QUERY_PARAMETER));
    }

    #[test]
    fn test_clone_is_independent() {
        let original = HandlerRegistry::with_builtins();
        let mut copy = original.clone();
        copy.clear();

        assert!(copy.is_empty());
        assert!(!original.is_empty());
    }

    #[test]
    fn test_unregister() {
        let mut registry = HandlerRegistry::with_builtins();
        assert!(registry.unregister(command::T0200_LOCATION_REPORT).is_some());
        assert!(!registry.contains(command::T0200_LOCATION_REPORT));
        assert!(registry.unregister(command::T0200_LOCATION_REPORT).is_none());
    }
}
