//! Decoded message with its handler and writer bookkeeping.
//!
//! A [`Message`] is produced by the [`FrameBuffer`](super::FrameBuffer), gets its
//! handler attached by the reader task, and is consumed once by the writer task.
//! Body and raw bytes are `bytes::Bytes`, so handing a message between tasks
//! never copies the payload.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use super::wire_format::Header;
use crate::error::{GatewayError, Result};
use crate::handler::Handler;

/// One decoded protocol unit.
pub struct Message {
    /// Decoded header.
    pub header: Header,
    /// Unescaped body (concatenated for reassembled sub-packages).
    pub body: Bytes,
    /// Frame bytes as read from the wire (last part for reassembled messages).
    pub raw: Bytes,
    /// False only for a surfaced sub-package part whose set is not complete yet.
    pub complete: bool,
    /// Handler resolved by the reader task.
    pub handler: Option<Arc<dyn Handler>>,
    /// Platform serial number used for the frame written in response.
    pub platform_seq: u16,
    /// Bytes the platform wrote in response.
    pub platform_data: Bytes,
    /// Error recorded while writing the response.
    pub error: Option<GatewayError>,
}

impl Message {
    /// Create a message from decoded parts.
    pub fn new(header: Header, body: Bytes, raw: Bytes) -> Self {
        Self {
            header,
            body,
            raw,
            complete: true,
            handler: None,
            platform_seq: 0,
            platform_data: Bytes::new(),
            error: None,
        }
    }

    /// Get the command id.
    #[inline]
    pub fn command(&self) -> u16 {
        self.header.msg_id
    }

    /// Get the terminal phone.
    #[inline]
    pub fn phone(&self) -> &str {
        &self.header.phone
    }

    /// Get a reference to the body bytes.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Check whether this message is a whole logical message.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Re-encode this message exactly as the terminal sent it.
    pub fn to_frame(&self) -> Result<Bytes> {
        self.header.encode_as_received(&self.body)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("header", &self.header)
            .field("body_len", &self.body.len())
            .field("complete", &self.complete)
            .field("has_handler", &self.handler.is_some())
            .field("platform_seq", &self.platform_seq)
            .field("error", &self.error)
            .finish()
    }
}
