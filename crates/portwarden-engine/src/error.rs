/*!
 * Error types for the Portwarden engine crate.
 */
use std::time::Duration;

use thiserror::Error;

use portwarden_security::{DenyReason, SecurityError};

/// Error type for Portwarden engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// Governor error
    #[error("Governor error: {0}")]
    Governor(String),

    /// Arbitration error
    #[error("Arbitration error: {0}")]
    Arbitration(String),

    /// A governance parameter change was rejected
    #[error("Parameter change rejected: {0}")]
    Parameters(String),

    /// The validate phase exceeded its bound
    #[error("Validation timed out after {0:?}")]
    ValidationTimeout(Duration),

    /// Port error
    #[error("Port error: {0}")]
    Port(#[from] portwarden_devices::PortError),

    /// Security error
    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] portwarden_core::error::Error),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Already exists error
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The hierarchy is shutting down
    #[error("Shutting down")]
    Shutdown,
}

/// Result type for Portwarden engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new governor error
    pub fn governor<S: AsRef<str>>(msg: S) -> Self {
        Error::Governor(msg.as_ref().to_string())
    }

    /// Create a new arbitration error
    pub fn arbitration<S: AsRef<str>>(msg: S) -> Self {
        Error::Arbitration(msg.as_ref().to_string())
    }

    /// Create a new parameter rejection
    pub fn parameters<S: AsRef<str>>(msg: S) -> Self {
        Error::Parameters(msg.as_ref().to_string())
    }

    /// Create a new not found error
    pub fn not_found<S: AsRef<str>>(msg: S) -> Self {
        Error::NotFound(msg.as_ref().to_string())
    }

    /// Create a new already exists error
    pub fn already_exists<S: AsRef<str>>(msg: S) -> Self {
        Error::AlreadyExists(msg.as_ref().to_string())
    }

    /// Create a new timeout error
    pub fn timeout<S: AsRef<str>>(msg: S) -> Self {
        Error::Timeout(msg.as_ref().to_string())
    }

    /// Why the security governor refused, if it did
    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Error::Security(e) => e.deny_reason(),
            _ => None,
        }
    }

    /// Whether this is an authorization refusal
    pub fn is_denied(&self) -> bool {
        self.deny_reason().is_some()
    }
}
