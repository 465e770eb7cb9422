/*!
 * Probe-Sense-Respond-Learn-Validate records.
 *
 * Every governor appends one [`PsrlvCycle`] per completed cycle to its own
 * [`CycleHistory`]. Histories are append-only rings; the management and
 * intelligence levels read them, nothing rewrites them.
 */
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use portwarden_core::error::Error as CoreError;
use portwarden_core::types::{BoundedLog, Timestamp};

use crate::error::Result;
use crate::governor::{GovernorId, Role};

/// Deviation classified by the sense phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Within expectations
    Nominal,
    /// Drift worth correcting
    Minor,
    /// Scope is not doing its job
    Major,
    /// Scope is unreachable or unsafe
    Critical,
}

/// What the respond phase did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ResponseOutcome {
    /// Nothing needed doing
    NoOp,
    /// An action ran to completion
    Executed(String),
    /// The security governor refused the action
    Denied(String),
    /// The action ran and failed
    Failed(String),
}

impl ResponseOutcome {
    /// Whether the action failed or was refused
    pub fn is_failure(&self) -> bool {
        matches!(self, ResponseOutcome::Denied(_) | ResponseOutcome::Failed(_))
    }
}

impl fmt::Display for ResponseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseOutcome::NoOp => write!(f, "no-op"),
            ResponseOutcome::Executed(d) => write!(f, "executed: {}", d),
            ResponseOutcome::Denied(d) => write!(f, "denied: {}", d),
            ResponseOutcome::Failed(d) => write!(f, "failed: {}", d),
        }
    }
}

/// Result of the validate phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// The re-probe confirmed the scope is healthy
    Passed,
    /// The re-probe found the scope unhealthy
    Failed(String),
    /// The re-probe did not finish within its bound
    TimedOut,
    /// Probing failed, so there was nothing to validate
    Skipped,
}

impl ValidationOutcome {
    /// Whether validation counts against the scope's health
    pub fn is_failure(&self) -> bool {
        matches!(self, ValidationOutcome::Failed(_) | ValidationOutcome::TimedOut)
    }
}

/// One completed PSRLV cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsrlvCycle {
    /// Sequence number within the governor's history
    pub seq: u64,
    /// Governor that ran the cycle
    pub governor: GovernorId,
    /// Its role
    pub role: Role,
    /// What it controls
    pub scope: String,
    /// Probe summary
    pub probe: String,
    /// Sense classification
    pub severity: Severity,
    /// Respond outcome
    pub response: ResponseOutcome,
    /// Learned delta
    pub learned: String,
    /// Validate outcome
    pub validation: ValidationOutcome,
    /// When the cycle completed
    pub timestamp: Timestamp,
}

impl PsrlvCycle {
    /// Whether the cycle counts as a failure of the governed scope
    pub fn is_failure(&self) -> bool {
        self.severity >= Severity::Major
            || self.response.is_failure()
            || self.validation.is_failure()
    }
}

/// Shared, bounded history of one governor's cycles
#[derive(Debug, Clone)]
pub struct CycleHistory(Arc<RwLock<BoundedLog<PsrlvCycle>>>);

impl CycleHistory {
    /// Create a history retaining `capacity` cycles
    pub fn new(capacity: usize) -> Self {
        Self(Arc::new(RwLock::new(BoundedLog::with_capacity(capacity))))
    }

    /// Append a cycle, stamping its sequence number
    pub fn record(&self, mut cycle: PsrlvCycle) -> Result<u64> {
        let mut log = self
            .0
            .write()
            .map_err(|_| CoreError::runtime("Failed to acquire write lock on cycle history"))?;
        cycle.seq = log.last_seq() + 1;
        Ok(log.push(cycle))
    }

    /// Cycles with a sequence number greater than `seq`
    pub fn since(&self, seq: u64) -> Vec<PsrlvCycle> {
        self.0
            .read()
            .map(|log| log.since(seq).into_iter().map(|s| s.record).collect())
            .unwrap_or_default()
    }

    /// The `limit` most recent cycles, oldest first
    pub fn recent(&self, limit: usize) -> Vec<PsrlvCycle> {
        self.0.read().map(|log| log.recent(limit)).unwrap_or_default()
    }

    /// The most recent cycle
    pub fn last(&self) -> Option<PsrlvCycle> {
        self.0.read().ok().and_then(|log| log.last().cloned())
    }

    /// Sequence number of the most recent cycle
    pub fn last_seq(&self) -> u64 {
        self.0.read().map(|log| log.last_seq()).unwrap_or(0)
    }

    /// Number of retained cycles
    pub fn len(&self) -> usize {
        self.0.read().map(|log| log.len()).unwrap_or(0)
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fraction of failed cycles among `cycles`, 0.0 when empty
pub fn failure_rate(cycles: &[PsrlvCycle]) -> f64 {
    if cycles.is_empty() {
        return 0.0;
    }
    let failed = cycles.iter().filter(|c| c.is_failure()).count();
    failed as f64 / cycles.len() as f64
}

#[cfg(test)]
pub(crate) fn cycle(governor: &GovernorId, severity: Severity) -> PsrlvCycle {
    PsrlvCycle {
        seq: 0,
        governor: governor.clone(),
        role: Role::Operational,
        scope: "COM1".to_string(),
        probe: String::new(),
        severity,
        response: ResponseOutcome::NoOp,
        learned: String::new(),
        validation: ValidationOutcome::Passed,
        timestamp: chrono::Utc::now(),
    }
}
