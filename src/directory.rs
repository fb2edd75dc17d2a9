//! Terminal directory: which session serves which terminal.
//!
//! [`TerminalDirectory`] is the default [`SessionHooks`]. A session joins under
//! the terminal phone of its first message; a second live connection presenting
//! the same phone is rejected with [`GatewayError::KeyExist`]. The directory
//! keeps each session's active sender, so [`TerminalDirectory::send`] can issue
//! a command to a terminal by key and await its response.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//!
//! let response = directory
//!     .send("00000000017299841738", 0x8104, Bytes::new(), Some(Duration::from_secs(3)))
//!     .await?;
//! println!("parameters: {:x?}", response.body());
//! ```

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;

use crate::active::{ActiveMessage, ActiveSender};
use crate::error::{GatewayError, Result};
use crate::protocol::{Header, Message};
use crate::session::SessionHooks;

/// A joined terminal.
struct Terminal {
    active: ActiveSender,
    /// Addresses platform commands to this terminal.
    header: Header,
}

/// Registry of joined terminals keyed by phone.
#[derive(Default)]
pub struct TerminalDirectory {
    terminals: Mutex<HashMap<String, Terminal>>,
}

impl TerminalDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn terminals(&self) -> MutexGuard<'_, HashMap<String, Terminal>> {
        self.terminals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check whether a terminal is joined under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.terminals().contains_key(key)
    }

    /// Keys of all joined terminals, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.terminals().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of joined terminals.
    pub fn len(&self) -> usize {
        self.terminals().len()
    }

    /// Check whether no terminal is joined.
    pub fn is_empty(&self) -> bool {
        self.terminals().is_empty()
    }

    /// Active sender of the session serving `key`.
    pub fn active_sender(&self, key: &str) -> Option<ActiveSender> {
        self.terminals().get(key).map(|t| t.active.clone())
    }

    /// Issue a command to a terminal and wait for its response.
    ///
    /// `timeout` overrides the session's default response timeout. Fails with
    /// [`GatewayError::TerminalNotFound`] for unknown keys and
    /// [`GatewayError::ConnectionClosed`] if the session stops first.
    pub async fn send(
        &self,
        key: &str,
        command: u16,
        body: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let (active, header) = {
            let terminals = self.terminals();
            let terminal = terminals
                .get(key)
                .ok_or_else(|| GatewayError::TerminalNotFound(key.to_string()))?;
            (terminal.active.clone(), terminal.header.clone())
        };

        let (mut msg, reply) = ActiveMessage::new(command, header, body);
        if let Some(timeout) = timeout {
            msg = msg.with_timeout(timeout);
        }

        active
            .send(msg)
            .await
            .map_err(|_| GatewayError::ConnectionClosed)?;
        reply.await.map_err(|_| GatewayError::ConnectionClosed)?
    }
}

impl SessionHooks for TerminalDirectory {
    fn join(&self, msg: &Message, active: ActiveSender) -> Result<String> {
        let key = msg.phone().to_string();
        let mut header = Header::for_terminal(msg.phone(), msg.header.version())?;
        header.protocol_version = msg.header.protocol_version;
        let terminal = Terminal { active, header };

        match self.terminals().entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                // A session whose writer is gone no longer owns the key
                if !entry.get().active.is_closed() {
                    return Err(GatewayError::KeyExist(key));
                }
                entry.insert(terminal);
            }
            Entry::Vacant(entry) => {
                entry.insert(terminal);
            }
        }

        tracing::debug!(key = %key, "Terminal joined");
        Ok(key)
    }

    fn leave(&self, key: &str) {
        if self.terminals().remove(key).is_some() {
            tracing::debug!(key = %key, "Terminal left");
        }
    }
}
