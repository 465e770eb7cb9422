/*!
 * Portwarden Engine
 *
 * This crate provides the governor hierarchy for Portwarden: the PSRLV
 * cycle every governor runs, the five governor roles from per-port
 * operation up to meta-governance, the resource arbiter for shared buses,
 * the authorized port service and the supervisor that ties them together.
 */

#![warn(missing_docs)]

// Re-export core types
pub use portwarden_core::prelude;

pub use portwarden_core::types::Id;

pub mod coordination;
pub mod error;
pub mod events;
pub mod governor;
pub mod hierarchy;
pub mod intelligence;
pub mod management;
pub mod meta;
pub mod operational;
pub mod psrlv;
pub mod service;

// Re-export main types for convenience
pub use coordination::{
    ArbiterPolicy, CoordinationStrategy, Grant, ResourceArbiter, ResourceSnapshot,
    DEFAULT_PRIORITY,
};
pub use error::{Error, Result};
pub use events::GovernanceEvent;
pub use governor::{
    ControlStrategy, Governor, GovernorContext, GovernorHandle, GovernorId, GovernorState,
    GovernorView, Role, Sensed,
};
pub use hierarchy::{Governance, GovernanceHealth, PortHealth};
pub use intelligence::{IntelligenceStrategy, Recommendation, RecommendationKind};
pub use management::{FailureTracker, ManagementStrategy, ReliabilityMode};
pub use meta::{GovernanceParameters, MetaStrategy, ParameterChange, ParameterStore};
pub use operational::{OperationalStrategy, RecoveryDirective, Roster};
pub use psrlv::{CycleHistory, PsrlvCycle, ResponseOutcome, Severity, ValidationOutcome};
pub use service::PortService;

/// Portwarden engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging and the engine
pub fn init() -> Result<()> {
    portwarden_core::init()?;
    portwarden_devices::init()?;
    tracing::info!(
        "Portwarden Engine {} initialized with adapters: {}",
        VERSION,
        portwarden_devices::available_adapters().join(", ")
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
