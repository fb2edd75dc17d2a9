//! Platform-initiated (active) commands and their correlation.
//!
//! An [`ActiveMessage`] is submitted to a session, written by the writer task
//! and parked in the [`PendingTable`] under the platform serial number it was
//! sent with. The entry leaves the table exactly once: when a terminal
//! response correlates to it, when its deadline passes, or when the write
//! itself fails. The completion sender is consumed on delivery, so a second
//! completion for the same entry cannot happen.
//!
//! # Example
//!
//! ```ignore
//! use jt808_gateway::active::ActiveMessage;
//!
//! let (msg, reply) = ActiveMessage::new(0x8104, header, Bytes::new());
//! session.active_sender().send(msg).await?;
//! let response = reply.await??;
//! ```

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::{GatewayError, Result};
use crate::protocol::{command, Header, Message};

/// Outcome delivered to the submitter of an active command.
pub type ActiveResult = Result<Message>;

/// Queue into a session's writer task for active commands.
pub type ActiveSender = mpsc::Sender<ActiveMessage>;

/// A platform-initiated command awaiting a terminal response.
pub struct ActiveMessage {
    /// Command id written on the wire.
    pub command: u16,
    /// Header addressing the terminal.
    pub header: Header,
    /// Command body.
    pub body: Bytes,
    /// Overrides the session's default response timeout.
    pub timeout: Option<Duration>,
    /// Completion channel, consumed on delivery.
    reply: oneshot::Sender<ActiveResult>,
}

impl ActiveMessage {
    /// Create an active command and the receiver its outcome arrives on.
    pub fn new(
        command: u16,
        header: Header,
        body: impl Into<Bytes>,
    ) -> (Self, oneshot::Receiver<ActiveResult>) {
        let (reply, rx) = oneshot::channel();
        let msg = Self {
            command,
            header,
            body: body.into(),
            timeout: None,
            reply,
        };
        (msg, rx)
    }

    /// Set a response timeout for this command only.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Deliver the outcome. Returns false if the submitter stopped waiting.
    pub(crate) fn complete(self, result: ActiveResult) -> bool {
        self.reply.send(result).is_ok()
    }
}

/// How a terminal response points back at the command it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlator {
    /// The response carries the platform serial number of the command.
    Serial(u16),
    /// No serial in the response; answers the oldest outstanding command of this id.
    OldestOf(u16),
}

/// Determine how a terminal message correlates to an active command.
///
/// Returns `None` for commands that never answer an active command.
pub fn correlator(msg: &Message) -> Option<Result<Correlator>> {
    match msg.command() {
        command::T0001_GENERAL_RESPOND
        | command::T0104_QUERY_PARAMETER
        | command::T1205_UPLOAD_RESOURCE_LIST
        | command::T1206_FILE_UPLOAD_COMPLETE_NOTICE => Some(leading_serial(msg)),
        command::T1003_UPLOAD_AUDIO_VIDEO_ATTR => {
            Some(Ok(Correlator::OldestOf(command::P9003_QUERY_AUDIO_VIDEO_ATTR)))
        }
        _ => None,
    }
}

/// All serial-carrying responses start with the answered serial number.
fn leading_serial(msg: &Message) -> Result<Correlator> {
    match msg.body() {
        [hi, lo, ..] => Ok(Correlator::Serial(u16::from_be_bytes([*hi, *lo]))),
        body => Err(GatewayError::BodyLengthInconsistency(format!(
            "response {:#06x} has a {} byte body, serial number needs 2",
            msg.command(),
            body.len()
        ))),
    }
}

/// An active command that has been written and awaits its response.
pub(crate) struct Pending {
    /// The submitted command.
    pub message: ActiveMessage,
    /// Bytes that were written.
    pub data: Bytes,
    /// Effective timeout.
    pub timeout: Duration,
    /// When the timeout fires.
    pub deadline: Instant,
    /// Insertion order, to find the oldest entry.
    order: u64,
}

/// Outstanding active commands keyed by platform serial number.
///
/// Owned by the writer task; never shared.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: HashMap<u16, Pending>,
    inserted: u64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a written command. Returns the entry it displaced, if the
    /// serial number wrapped onto a command that is still outstanding.
    pub fn insert(
        &mut self,
        seq: u16,
        message: ActiveMessage,
        data: Bytes,
        timeout: Duration,
        now: Instant,
    ) -> Option<Pending> {
        self.inserted += 1;
        let pending = Pending {
            message,
            data,
            timeout,
            deadline: now + timeout,
            order: self.inserted,
        };
        self.entries.insert(seq, pending)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest deadline among outstanding commands.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|p| p.deadline).min()
    }

    /// Remove every entry whose deadline is at or before `now`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(u16, Pending)> {
        let expired: Vec<u16> = self
            .entries
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();

        let mut out: Vec<(u16, Pending)> = expired
            .into_iter()
            .filter_map(|seq| self.entries.remove(&seq).map(|p| (seq, p)))
            .collect();
        out.sort_by_key(|(_, p)| p.order);
        out
    }

    /// Remove the entry a terminal response correlates to.
    pub fn take_match(&mut self, correlator: Correlator) -> Option<(u16, Pending)> {
        let seq = match correlator {
            Correlator::Serial(seq) => seq,
            Correlator::OldestOf(command) => self
                .entries
                .iter()
                .filter(|(_, p)| p.message.command == command)
                .min_by_key(|(_, p)| p.order)
                .map(|(seq, _)| *seq)?,
        };
        self.entries.remove(&seq).map(|p| (seq, p))
    }
}
