//! Error types for hexloader.

use std::io;
use thiserror::Error;

use crate::protocol::stk500::Signature;

/// Result type for hexloader operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for hexloader operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Invalid Intel HEX encoder input, rejected before any output.
    #[error("Invalid encoder input: {0}")]
    Encoding(String),

    /// Invalid firmware image.
    #[error("Invalid image: {0}")]
    Image(String),

    /// The response stream no longer matches the outstanding command.
    #[error("Protocol desync during {command}: expected {expected:#04x}, got {actual:#04x}")]
    Desync {
        /// Command that was outstanding.
        command: &'static str,
        /// Marker byte the command expected.
        expected: u8,
        /// Byte actually received.
        actual: u8,
    },

    /// No complete response arrived within the time budget.
    #[error("Timeout waiting for response to {command}")]
    Timeout {
        /// Command that was outstanding.
        command: &'static str,
    },

    /// The stream closed while a command was outstanding.
    #[error("Stream closed during {command}")]
    Disconnected {
        /// Command that was outstanding.
        command: &'static str,
    },

    /// Read-back data did not match what was written.
    #[error("Verify mismatch at offset {offset:#x}: wrote {expected:#04x}, read {actual:#04x}")]
    VerifyMismatch {
        /// Absolute byte offset of the first differing byte.
        offset: u32,
        /// Byte that was written.
        expected: u8,
        /// Byte that was read back.
        actual: u8,
    },

    /// Device signature did not match the expected identifier.
    #[error("Signature mismatch: expected {expected}, got {actual}")]
    SignatureMismatch {
        /// Signature supplied by the caller.
        expected: Signature,
        /// Signature reported by the device.
        actual: Signature,
    },

    /// The session was stopped by an explicit stop request.
    #[error("Session stopped")]
    Stopped,

    /// Device not responding or no candidate port found.
    #[error("Device not found or not responding")]
    DeviceNotFound,

    /// Unsupported chip or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}
