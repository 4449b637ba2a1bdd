//! Error types for slaveboot.

use std::io;
use thiserror::Error;

/// Result type for slaveboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for slaveboot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Data-link framing error.
    #[error("Framing error: {0}")]
    Frame(String),

    /// Operation requires the channel raw mode to be toggled first.
    #[error("Raw mode error: {0}")]
    RawMode(String),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Command response did not have the expected shape or status.
    #[error("Invalid response for command {command:#04x} (status {status:#04x}, length {len})")]
    InvalidResponse {
        /// Command ID the request was sent with.
        command: u8,
        /// Status byte of the response (0 if the response was too short).
        status: u8,
        /// Length in bytes of the response message.
        len: usize,
    },

    /// Invalid firmware descriptor.
    #[error("Invalid firmware descriptor: {0}")]
    Descriptor(String),

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        /// Expected CRC value.
        expected: u32,
        /// Actual CRC value.
        actual: u32,
    },
}
