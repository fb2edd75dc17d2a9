//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for buffer management.
//! Implements a state machine for delimiter-bounded frames:
//! - `WaitingForStart`: Skip bytes until a `0x7e` opens a frame
//! - `WaitingForEnd`: Start seen, scan for the closing `0x7e`
//!
//! Complete frames are unescaped, checksum-verified and decoded into
//! [`Message`]s. Sub-package parts are collected until every index of the set
//! has arrived, then surfaced as one message with the concatenated body.
//!
//! # Example
//!
//! ```ignore
//! use jt808_gateway::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from socket
//! let messages = buffer.push(&chunk)?;
//!
//! for msg in messages {
//!     println!("Got message {:#06x} from {}", msg.command(), msg.phone());
//! }
//! ```

use std::collections::{BTreeMap, HashMap};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::wire_format::{checksum, unescape, Header, DELIMITER, MAX_FRAME_SIZE};
use super::Message;
use crate::error::{GatewayError, Result};

/// Most sub-package sets a buffer keeps open at once. Opening another one
/// evicts the set that was opened first.
pub const MAX_OPEN_SETS: usize = 16;

/// Most part body bytes a buffer holds across all open sets.
pub const MAX_REASSEMBLY_BYTES: usize = 1024 * 1024;

/// What to do with sub-package parts before their set is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReassemblyMode {
    /// Surface each part as an incomplete message so it gets acknowledged.
    #[default]
    PassThrough,
    /// Surface nothing until the whole set is reassembled.
    Suppress,
}

/// State machine for frame extraction.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for an opening delimiter.
    WaitingForStart,
    /// Opening delimiter at offset 0, `scanned` bytes already searched.
    WaitingForEnd { scanned: usize },
}

/// Reassembly key: one logical message being split.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PartKey {
    phone: String,
    msg_id: u16,
    total: u16,
}

/// Parts received so far for one key, by part index.
#[derive(Debug)]
struct PartSet {
    parts: BTreeMap<u16, Bytes>,
    /// Open order, for eviction.
    opened: u64,
}

impl PartSet {
    fn size(&self) -> usize {
        self.parts.values().map(Bytes::len).sum()
    }
}

/// Buffer for accumulating incoming bytes and extracting complete messages.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Sub-package handling.
    mode: ReassemblyMode,
    /// Open sub-package sets.
    parts: HashMap<PartKey, PartSet>,
    /// Body bytes held in `parts`.
    held: usize,
    /// Sets opened so far.
    opened: u64,
}

impl FrameBuffer {
    /// Create a new frame buffer that surfaces sub-package parts.
    pub fn new() -> Self {
        Self::with_mode(ReassemblyMode::default())
    }

    /// Create a new frame buffer with the given reassembly mode.
    pub fn with_mode(mode: ReassemblyMode) -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_SIZE),
            state: State::WaitingForStart,
            mode,
            parts: HashMap::new(),
            held: 0,
            opened: 0,
        }
    }

    /// Push data into the buffer and extract all complete messages.
    ///
    /// Partial trailing data is kept for the next push. On any decode error
    /// the buffered remainder is discarded and the error returned; messages
    /// decoded earlier in the same push are dropped with it.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        loop {
            let frame = match self.try_extract_one() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.reset_stream();
                    return Err(e);
                }
            };
            let decoded =
                decode_frame(frame).and_then(|msg| self.reassemble(msg, &mut messages));
            if let Err(e) = decoded {
                self.reset_stream();
                return Err(e);
            }
        }

        Ok(messages)
    }

    /// Try to extract the raw bytes of one frame, delimiters included.
    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        match self.state {
            State::WaitingForStart => {
                match self.buffer.iter().position(|&b| b == DELIMITER) {
                    Some(pos) => {
                        let _ = self.buffer.split_to(pos);
                        self.state = State::WaitingForEnd { scanned: 1 };
                        self.try_extract_one()
                    }
                    None => {
                        // Noise between frames
                        self.buffer.clear();
                        Ok(None)
                    }
                }
            }

            State::WaitingForEnd { scanned } => {
                let found = self.buffer[scanned..]
                    .iter()
                    .position(|&b| b == DELIMITER)
                    .map(|p| p + scanned);

                match found {
                    // `7e 7e`: the first delimiter closed a previous frame
                    Some(1) => {
                        let _ = self.buffer.split_to(1);
                        self.state = State::WaitingForEnd { scanned: 1 };
                        self.try_extract_one()
                    }
                    Some(end) => {
                        let frame = self.buffer.split_to(end + 1).freeze();
                        self.state = State::WaitingForStart;
                        Ok(Some(frame))
                    }
                    None => {
                        if self.buffer.len() > MAX_FRAME_SIZE {
                            return Err(GatewayError::Frame(format!(
                                "no closing delimiter within {} bytes",
                                MAX_FRAME_SIZE
                            )));
                        }
                        self.state = State::WaitingForEnd {
                            scanned: self.buffer.len(),
                        };
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Route a decoded frame through sub-package reassembly.
    ///
    /// Fails once the open sets would hold more than
    /// [`MAX_REASSEMBLY_BYTES`].
    fn reassemble(&mut self, mut msg: Message, out: &mut Vec<Message>) -> Result<()> {
        let sub = match msg.header.sub_package {
            Some(sub) if sub.total > 1 => sub,
            _ => {
                out.push(msg);
                return Ok(());
            }
        };

        let key = PartKey {
            phone: msg.header.phone.clone(),
            msg_id: msg.header.msg_id,
            total: sub.total,
        };
        if !self.parts.contains_key(&key) && self.parts.len() >= MAX_OPEN_SETS {
            self.evict_oldest();
        }

        let replaced = self
            .parts
            .get(&key)
            .and_then(|set| set.parts.get(&sub.index))
            .map_or(0, Bytes::len);
        let held = self.held - replaced + msg.body.len();
        if held > MAX_REASSEMBLY_BYTES {
            self.parts.clear();
            self.held = 0;
            return Err(GatewayError::Frame(format!(
                "sub-package sets exceed {} bytes",
                MAX_REASSEMBLY_BYTES
            )));
        }
        self.held = held;

        let next = self.opened;
        let set = self.parts.entry(key.clone()).or_insert_with(|| PartSet {
            parts: BTreeMap::new(),
            opened: next,
        });
        if set.opened == next {
            self.opened += 1;
        }
        set.parts.insert(sub.index, msg.body.clone());

        if set.parts.len() == sub.total as usize {
            if let Some(set) = self.parts.remove(&key) {
                let mut body = BytesMut::with_capacity(set.size());
                for part in set.parts.values() {
                    body.extend_from_slice(part);
                }
                self.held -= body.len();
                msg.body = body.freeze();
                msg.complete = true;
                out.push(msg);
            }
            return Ok(());
        }

        if self.mode == ReassemblyMode::PassThrough {
            msg.complete = false;
            out.push(msg);
        }
        Ok(())
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .parts
            .iter()
            .min_by_key(|(_, set)| set.opened)
            .map(|(key, _)| key.clone());
        if let Some(set) = oldest.and_then(|key| self.parts.remove(&key)) {
            self.held -= set.size();
            tracing::warn!(
                parts = set.parts.len(),
                "Too many open sub-package sets, dropping the oldest"
            );
        }
    }

    fn reset_stream(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForStart;
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of sub-package sets still waiting for parts.
    pub fn incomplete_sets(&self) -> usize {
        self.parts.len()
    }

    /// Body bytes held by open sub-package sets.
    pub fn reassembly_bytes(&self) -> usize {
        self.held
    }

    /// Clear the buffer, reset state and drop partial reassembly sets.
    pub fn clear(&mut self) {
        self.reset_stream();
        self.parts.clear();
        self.held = 0;
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForStart => "WaitingForStart",
            State::WaitingForEnd { .. } => "WaitingForEnd",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Unescape, verify and decode one delimited frame.
fn decode_frame(raw: Bytes) -> Result<Message> {
    let content = unescape(&raw[1..raw.len() - 1])?;
    let (&expected, data) = content
        .split_last()
        .ok_or_else(|| GatewayError::Frame("empty frame".to_string()))?;

    let actual = checksum(data);
    if actual != expected {
        return Err(GatewayError::Checksum { expected, actual });
    }

    let (header, offset) = Header::decode(data)?;
    let body = &data[offset..];
    if body.len() != header.attributes.body_length as usize {
        return Err(GatewayError::Frame(format!(
            "message {:#06x} declares a {} byte body but carries {}",
            header.msg_id,
            header.attributes.body_length,
            body.len()
        )));
    }

    Ok(Message::new(header, Bytes::copy_from_slice(body), raw))
}
