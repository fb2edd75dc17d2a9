//! Protocol module - wire format, framing, and message types.
//!
//! This module implements the JT/T 808 binary protocol:
//! - Header encoding/decoding for the 2013 and 2019 revisions
//! - Escaping and XOR checksums
//! - Frame buffer for accumulating partial reads and reassembling sub-packages
//! - Message struct carrying the decoded unit through the session

pub mod command;
mod frame_buffer;
mod message;
mod wire_format;

pub use frame_buffer::{FrameBuffer, ReassemblyMode, MAX_OPEN_SETS, MAX_REASSEMBLY_BYTES};
pub use message::Message;
pub use wire_format::{
    attr, bcd_decode, bcd_encode, checksum, escape_into, unescape, BodyAttributes, Header,
    ProtocolVersion, SubPackage, DELIMITER, ESCAPE, HEADER_SIZE_2013, HEADER_SIZE_2019,
    MAX_BODY_LENGTH, MAX_FRAME_SIZE, MAX_HEADER_SIZE, SUB_PACKAGE_SIZE,
};
