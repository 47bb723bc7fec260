//! # Voltage SLMP Error Handling
//!
//! This module provides the error taxonomy for the Voltage SLMP library. Every
//! public operation returns [`SlmpResult<T>`], and every failure is one of the
//! [`SlmpError`] variants below.
//!
//! ## Error Categories
//!
//! ### Local (fatal) errors
//! - **Validation**: bad address, count outside protocol limits, malformed input.
//!   Carries *every* violation that was found so a caller can fix its
//!   configuration in one pass. Never sent to the wire, never retried.
//! - **Configuration**: connection settings out of range.
//! - **Cancelled**: the caller's cancellation token fired.
//! - **Internal**: library bugs (should not occur in normal operation).
//!
//! ### Communication (recoverable) errors
//! - **Connection / Io**: refused, reset, unreachable, socket failures.
//! - **Timeout**: no response within the configured window.
//! - **Protocol**: the PLC answered with a non-zero end code.
//! - **Frame**: the response could not be decoded.
//!
//! Only recoverable errors are routed through the continuity engine; see
//! [`crate::continuity`].
//!
//! ## Error Recovery
//!
//! ```rust
//! use voltage_slmp::{SlmpError, SlmpResult};
//!
//! fn handle(result: SlmpResult<Vec<u16>>) {
//!     match result {
//!         Ok(words) => println!("read {} words", words.len()),
//!         Err(error) if error.is_recoverable() => println!("transient: {}", error),
//!         Err(error) => println!("fatal: {}", error),
//!     }
//! }
//!
//! handle(Err(SlmpError::protocol(0xC059)));
//! ```

use std::fmt;
use thiserror::Error;

use crate::device::DeviceCode;
use crate::protocol::end_code;

/// Result type alias for SLMP operations
pub type SlmpResult<T> = Result<T, SlmpError>;

/// A single validation failure.
///
/// Validation errors collect all of these instead of stopping at the first,
/// so the `Display` output of [`SlmpError::Validation`] names every offending
/// device and address.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Violation {
    pub device: Option<DeviceCode>,
    pub address: Option<u32>,
    pub message: String,
}

impl Violation {
    /// Violation tied to a device address
    pub fn at<S: Into<String>>(device: DeviceCode, address: u32, message: S) -> Self {
        Self {
            device: Some(device),
            address: Some(address),
            message: message.into(),
        }
    }

    /// Violation about the request as a whole
    pub fn general<S: Into<String>>(message: S) -> Self {
        Self {
            device: None,
            address: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.device, self.address) {
            (Some(device), Some(address)) => {
                write!(f, "{}{}: {}", device, device.format_address(address), self.message)
            }
            (Some(device), None) => write!(f, "{}: {}", device, self.message),
            (None, Some(address)) => write!(f, "address {}: {}", address, self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Coarse classification used by the continuity engine and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Connection,
    Timeout,
    Protocol,
    Configuration,
    Cancelled,
    Internal,
}

/// SLMP error types
///
/// Each variant carries enough context to diagnose the failure without
/// access to the raw frames.
#[derive(Error, Debug, Clone)]
pub enum SlmpError {
    /// Local input validation failures
    ///
    /// Raised before any I/O happens. The list contains every violation
    /// found, not just the first one.
    ///
    /// # Examples
    /// - Reading D65535 as a dword (high word would be D65536)
    /// - Word read with count 0 or above 960
    /// - Bit-unit access on a word device
    #[error("Validation failed: {}", join_violations(.violations))]
    Validation { violations: Vec<Violation> },

    /// Connection errors
    ///
    /// # Examples
    /// - Connection refused by the PLC
    /// - Connection reset while waiting for a response
    /// - Operation issued on a disconnected client
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Low-level I/O errors not tied to connection establishment
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Timeout errors
    ///
    /// Occurs when no response arrives within the per-call or connection
    /// receive timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The PLC answered with a non-zero end code
    #[error("PLC returned end code 0x{end_code:04X} ({description})")]
    Protocol { end_code: u16, description: &'static str },

    /// Response frame could not be decoded
    ///
    /// # Examples
    /// - Frame shorter than the fixed response header
    /// - Unexpected sub-header
    /// - Data length field larger than the received bytes
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The caller cancelled the operation
    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SlmpError {
    /// Create a validation error from a list of violations
    pub fn validation(violations: Vec<Violation>) -> Self {
        Self::Validation { violations }
    }

    /// Create a validation error with a single general violation
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            violations: vec![Violation::general(message)],
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a protocol error for a PLC end code
    pub fn protocol(code: u16) -> Self {
        Self::Protocol {
            end_code: code,
            description: end_code::describe(code),
        }
    }

    /// Create a new frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a new cancellation error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled { operation: operation.into() }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Coarse classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Connection { .. } | Self::Io { .. } => ErrorKind::Connection,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Protocol { .. } | Self::Frame { .. } => ErrorKind::Protocol,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Check if the error is eligible for retry or default substitution
    ///
    /// Connection, timeout and protocol failures are transient from the
    /// point of view of a monitoring loop. Validation, configuration,
    /// cancellation and internal errors indicate a programming or usage
    /// problem and always propagate.
    ///
    /// ```rust
    /// use voltage_slmp::SlmpError;
    ///
    /// assert!(SlmpError::timeout("read", 1000).is_recoverable());
    /// assert!(SlmpError::protocol(0xCEE0).is_recoverable());
    /// assert!(!SlmpError::invalid("count must be > 0").is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Protocol
        )
    }

    /// Check if the error comes from the transport layer
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Check if the error comes from the PLC or the frame decoder
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::Frame { .. })
    }

    /// End code reported by the PLC, if any
    pub fn end_code(&self) -> Option<u16> {
        match self {
            Self::Protocol { end_code, .. } => Some(*end_code),
            _ => None,
        }
    }

    /// Violations carried by a validation error
    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Validation { violations } => violations,
            _ => &[],
        }
    }

    /// Error type label used for statistics keys
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::Connection { .. } => "ConnectionError",
            Self::Io { .. } => "IoError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Protocol { .. } => "ProtocolError",
            Self::Frame { .. } => "FrameError",
            Self::Configuration { .. } => "ConfigurationError",
            Self::Cancelled { .. } => "Cancelled",
            Self::Internal { .. } => "InternalError",
        }
    }
}

impl From<std::io::Error> for SlmpError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::UnexpectedEof => Self::connection(err.to_string()),
            Io::TimedOut => Self::timeout(err.to_string(), 0),
            _ => Self::io(err.to_string()),
        }
    }
}

/// Converts Tokio's timeout errors with a generic message; callers that know
/// the duration build the error with [`SlmpError::timeout`] instead.
impl From<tokio::time::error::Elapsed> for SlmpError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<serde_json::Error> for SlmpError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for SlmpError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}
