/*!
 * Error types for port and transport operations.
 */
use thiserror::Error;

use portwarden_core::error::Error as CoreError;

use crate::port::PortStatus;

/// Failure reported by a transport or GPIO capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The device path does not exist or vanished
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The OS refused access to the device
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Read, write or control operation failed
    #[error("I/O failure: {0}")]
    Io(String),

    /// A bounded transport operation did not complete in time
    #[error("Transport timeout: {0}")]
    Timeout(String),

    /// Temporary resource exhaustion; only the triggering call fails
    #[error("Resource exhausted: {0}")]
    WouldBlock(String),

    /// The transport is not open
    #[error("Transport not open")]
    NotOpen,

    /// The transport rejected a setting
    #[error("Unsupported setting: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Whether this failure leaves the port usable
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::WouldBlock(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => TransportError::NotFound(err.to_string()),
            ErrorKind::PermissionDenied => TransportError::PermissionDenied(err.to_string()),
            ErrorKind::TimedOut => TransportError::Timeout(err.to_string()),
            ErrorKind::WouldBlock => TransportError::WouldBlock(err.to_string()),
            _ => TransportError::Io(err.to_string()),
        }
    }
}

/// Error type for port operations
#[derive(Error, Debug)]
pub enum PortError {
    /// Invalid or unsupported port options
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transport I/O failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Another write is in flight and the write policy is fail-fast
    #[error("Port {0} is busy")]
    Busy(String),

    /// A reader is already attached to the port
    #[error("Port {0} already has an active reader")]
    AlreadyReading(String),

    /// The operation is not permitted in the current state
    #[error("Operation {operation} not permitted while port is {status:?}")]
    InvalidState {
        /// The attempted operation
        operation: &'static str,
        /// The state the port was in
        status: PortStatus,
    },

    /// A bounded port operation did not complete in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The port is not registered
    #[error("Port not found: {0}")]
    NotFound(String),

    /// A state machine already exists for the port
    #[error("Port already registered: {0}")]
    AlreadyExists(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for port operations
pub type Result<T> = std::result::Result<T, PortError>;

impl PortError {
    /// Create a new configuration error
    pub fn configuration<S: AsRef<str>>(msg: S) -> Self {
        PortError::Configuration(msg.as_ref().to_string())
    }

    /// Create a new invalid-state error
    pub fn invalid_state(operation: &'static str, status: PortStatus) -> Self {
        PortError::InvalidState { operation, status }
    }
}
