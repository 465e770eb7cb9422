/*!
 * Error types for the security layer.
 */
use thiserror::Error;

use portwarden_core::error::Error as CoreError;

use crate::governor::DenyReason;

/// Error type for security operations
#[derive(Error, Debug)]
pub enum SecurityError {
    /// No token pair matches the given token
    #[error("Unknown token")]
    UnknownToken,

    /// The token pair has expired
    #[error("Token expired")]
    TokenExpired,

    /// The token pair has been revoked
    #[error("Token revoked")]
    TokenRevoked,

    /// The token pair was issued as non-renewable
    #[error("Token is not renewable")]
    NotRenewable,

    /// An operation was denied
    #[error("Authorization denied for {operation} on {port}: {reason}")]
    Authorization {
        /// The attempted operation
        operation: String,
        /// The target port
        port: String,
        /// Why it was denied
        reason: DenyReason,
    },

    /// The authorization round-trip did not finish in time
    #[error("Authorization timed out after {0:?}")]
    AuthorizationTimeout(std::time::Duration),

    /// A listener address falls outside the private-network boundary
    #[error("Network boundary violation: {0}")]
    NetworkBoundaryViolation(String),

    /// The address text could not be parsed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Audit trail could not be written
    #[error("Audit error: {0}")]
    Audit(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for security operations
pub type Result<T> = std::result::Result<T, SecurityError>;

impl SecurityError {
    /// Create a new authorization error
    pub fn authorization<O: ToString, P: ToString>(operation: O, port: P, reason: DenyReason) -> Self {
        SecurityError::Authorization {
            operation: operation.to_string(),
            port: port.to_string(),
            reason,
        }
    }

    /// The deny reason, for authorization failures
    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            SecurityError::Authorization { reason, .. } => Some(*reason),
            SecurityError::AuthorizationTimeout(_) => Some(DenyReason::TimedOut),
            _ => None,
        }
    }

    /// Create a new boundary violation
    pub fn boundary<S: AsRef<str>>(msg: S) -> Self {
        SecurityError::NetworkBoundaryViolation(msg.as_ref().to_string())
    }
}
