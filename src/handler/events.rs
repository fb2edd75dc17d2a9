//! Connection-scoped observer callbacks.

use crate::error::Result;
use crate::protocol::Message;

/// Observer notified of session activity across all commands.
///
/// Every method defaults to doing nothing, so implementors only override what
/// they care about. Callbacks run on the reader or writer task and must not block.
pub trait TerminalEvents: Send + Sync + 'static {
    /// A message arrived for a command with no handler. It is dropped.
    fn on_not_supported(&self, _msg: &Message) {}

    /// A join was attempted with the given message.
    fn on_join(&self, _msg: &Message, _outcome: &Result<String>) {}

    /// The session stopped. `key` is `None` if it never joined.
    fn on_leave(&self, _key: Option<&str>) {}

    /// A message was read and is about to be dispatched.
    fn on_read_execution(&self, _msg: &Message) {}

    /// The platform wrote a frame for a message.
    fn on_write_execution(&self, _msg: &Message) {}
}

/// Events sink that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

impl TerminalEvents for NoopEvents {}
