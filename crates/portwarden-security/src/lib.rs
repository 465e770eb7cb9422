/*!
 * Portwarden Security
 *
 * This crate holds the authorization boundary every governor action passes
 * through: mutual token pairs, the Security Governor with its audit trail,
 * rate limiting and threat view, and the private-network boundary checked
 * before any listener binds.
 */

#![warn(missing_docs)]

pub mod boundary;
pub mod error;
pub mod event;
pub mod governor;
pub mod rate_limit;
pub mod threat;
pub mod token;

pub use boundary::{
    is_binding_allowed, is_rfc1918_address, validate_address, AddressValidation, BindPermit,
    NetworkBoundary, PeerFilter,
};
pub use error::{Result, SecurityError};
pub use event::{SecurityEvent, SecurityEventKind, SecurityEventLog, ThreatLevel};
pub use governor::{
    authorize_within, AuthorizationDecision, Authorizer, DenyReason, SecurityGovernor,
};
pub use rate_limit::{PeerRateLimiter, RateDecision};
pub use threat::ThreatAssessment;
pub use token::{
    fingerprint, Operation, SecurityLevel, TokenManager, TokenPair, TokenPermissions,
    TokenRejection, TokenSummary,
};

/// Portwarden security crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
