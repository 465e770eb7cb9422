/*!
 * Governance events published on the shared event bus.
 */
use serde::{Deserialize, Serialize};

use portwarden_core::types::Id;

use crate::governor::GovernorId;
use crate::management::ReliabilityMode;

/// Something the hierarchy itself did, as opposed to a port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GovernanceEvent {
    /// System3 moved a System1 governor to another reliability mode
    ReliabilityModeChanged {
        /// Affected governor
        governor: GovernorId,
        /// Port it controls
        port: Id,
        /// Previous mode
        from: ReliabilityMode,
        /// New mode
        to: ReliabilityMode,
        /// Recovery attempts spent when the mode changed
        attempts: u32,
    },
    /// A parameter snapshot was committed
    ParametersCommitted {
        /// New version
        version: u64,
        /// Why it was proposed
        rationale: String,
    },
    /// A candidate snapshot failed simulation
    ParametersRejected {
        /// Version the candidate would have had
        version: u64,
        /// Why it was rejected
        reason: String,
    },
    /// The previous snapshot was restored
    ParametersReverted {
        /// Version of the restored snapshot
        version: u64,
        /// Why
        reason: String,
    },
}
