//! # EMS Bus Error Handling
//!
//! This module provides the error type shared by every layer of the EMS stack:
//! the telegram codec, the serial transport, the forwarder, the controller and
//! the configuration loader.
//!
//! ## Error Categories
//!
//! ### Codec Errors
//! - **Checksum Errors**: trailing CRC-8 does not match the frame contents
//! - **Too Short**: frame shorter than the smallest valid telegram
//! - **Malformed**: extended-dialect frame missing its type bytes
//!
//! ### Transport Errors
//! - **I/O Errors**: serial port read/write failures
//! - **Connection Errors**: serial port could not be opened
//! - **Timeout Errors**: operation exceeded its deadline
//!
//! ### System Errors
//! - **Configuration Errors**: invalid or unreadable configuration
//! - **Internal Errors**: poisoned locks, closed channels
//!
//! ## Recovery
//!
//! None of these errors is fatal to the process. Codec errors drop a single
//! frame, transport errors trigger a resynchronisation and the controller
//! performs a full protocol reset on systemic faults.
//!
//! ```rust
//! use ems_bus::{EmsError, EmsResult, Telegram};
//!
//! fn inspect(result: EmsResult<Telegram>) {
//!     match result {
//!         Ok(telegram) => println!("decoded type 0x{:04X}", telegram.type_id()),
//!         Err(EmsError::ChecksumError { expected, actual }) => {
//!             println!("noise on the bus: crc {:02X} != {:02X}", actual, expected);
//!         }
//!         Err(error) if error.is_recoverable() => println!("retry later: {}", error),
//!         Err(error) => println!("giving up: {}", error),
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for EMS operations
pub type EmsResult<T> = Result<T, EmsError>;

/// EMS error types
///
/// Each variant carries enough context to log a useful line without the
/// original frame at hand.
#[derive(Error, Debug, Clone)]
pub enum EmsError {
    /// Trailing CRC-8 byte does not match the computed checksum
    #[error("CRC validation failed: expected={expected:02X}, actual={actual:02X}")]
    ChecksumError { expected: u8, actual: u8 },

    /// Frame is shorter than the minimum telegram size
    #[error("Telegram too short: {length} bytes (minimum {minimum})")]
    TooShort { length: usize, minimum: usize },

    /// Frame passed the CRC but its layout is inconsistent
    #[error("Malformed telegram: {message}")]
    Malformed { message: String },

    /// I/O related errors (serial line)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Serial port could not be opened or configured
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Transmit rejected by the transport (empty, oversized or transport stopped)
    #[error("Transmit rejected: {message}")]
    Transmit { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Library internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EmsError {
    pub fn checksum(expected: u8, actual: u8) -> Self {
        Self::ChecksumError { expected, actual }
    }

    pub fn too_short(length: usize, minimum: usize) -> Self {
        Self::TooShort { length, minimum }
    }

    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::Malformed { message: message.into() }
    }

    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn transmit<S: Into<String>>(message: S) -> Self {
        Self::Transmit { message: message.into() }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether the operation may succeed if simply attempted again
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ChecksumError { .. }
                | Self::TooShort { .. }
                | Self::Malformed { .. }
                | Self::Io { .. }
                | Self::Timeout { .. }
                | Self::Transmit { .. }
        )
    }

    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. } | Self::Transmit { .. }
        )
    }

    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::ChecksumError { .. } | Self::TooShort { .. } | Self::Malformed { .. }
        )
    }
}

impl From<std::io::Error> for EmsError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for EmsError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<tokio_serial::Error> for EmsError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(err.to_string())
    }
}

impl From<serde_json::Error> for EmsError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_data(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for EmsError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}
