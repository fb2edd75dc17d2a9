//! Error types for the gateway.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration value out of range.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Frame checksum did not match the XOR of its contents.
    #[error("Checksum mismatch: frame carries {expected:#04x}, computed {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },

    /// Malformed frame (bad escape, short header, length mismatch, ...).
    #[error("Frame error: {0}")]
    Frame(String),

    /// Body too short or inconsistent for the command being parsed.
    #[error("Body length inconsistency: {0}")]
    BodyLengthInconsistency(String),

    /// Writing a frame to the terminal failed.
    #[error("Write data fail: {0}")]
    WriteDataFail(#[source] std::io::Error),

    /// An active command got no terminal response in time.
    #[error("Write data over time: no response within {0:?}")]
    WriteDataOverTime(Duration),

    /// Another session already owns this terminal identity.
    #[error("Key already exists: {0}")]
    KeyExist(String),

    /// No session is joined under this key.
    #[error("Terminal not found: {0}")]
    TerminalNotFound(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Classification of a [`GatewayError`], inspectable without matching on payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Io,
    Json,
    Config,
    Checksum,
    Frame,
    BodyLengthInconsistency,
    WriteDataFail,
    WriteDataOverTime,
    KeyExist,
    TerminalNotFound,
    ConnectionClosed,
}

impl GatewayError {
    /// Get the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Io(_) => ErrorKind::Io,
            GatewayError::Json(_) => ErrorKind::Json,
            GatewayError::Config(_) => ErrorKind::Config,
            GatewayError::Checksum { .. } => ErrorKind::Checksum,
            GatewayError::Frame(_) => ErrorKind::Frame,
            GatewayError::BodyLengthInconsistency(_) => ErrorKind::BodyLengthInconsistency,
            GatewayError::WriteDataFail(_) => ErrorKind::WriteDataFail,
            GatewayError::WriteDataOverTime(_) => ErrorKind::WriteDataOverTime,
            GatewayError::KeyExist(_) => ErrorKind::KeyExist,
            GatewayError::TerminalNotFound(_) => ErrorKind::TerminalNotFound,
            GatewayError::ConnectionClosed => ErrorKind::ConnectionClosed,
        }
    }

    /// Decode and framing errors end the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Checksum | ErrorKind::Frame | ErrorKind::KeyExist
        )
    }
}

/// Result type alias using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;
