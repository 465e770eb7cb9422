/*!
 * Meta level (System5) and the governance parameter store.
 *
 * Levels 2 to 4 read their tuning from the [`ParameterStore`] at the start
 * of every cycle. Only the store replaces the snapshot, and only after the
 * candidate has passed invariant checks and a replay of recent System1
 * history. Commits, rejections and reverts are all audited as
 * `ConfigurationChange` security events.
 */
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use portwarden_core::config::{ArbitrationStrategy, GovernanceConfig};
use portwarden_core::event::SharedEventBus;
use portwarden_core::utils::HARD_TIMEOUT_CEILING;
use portwarden_security::{SecurityEvent, SecurityEventKind, SecurityGovernor, ThreatLevel};

use crate::error::{Error, Result};
use crate::events::GovernanceEvent;
use crate::governor::{ControlStrategy, Role, Sensed};
use crate::intelligence::Recommendation;
use crate::management::FailureTracker;
use crate::operational::Roster;
use crate::psrlv::{ResponseOutcome, Severity, ValidationOutcome};

/// Versioned tuning for the coordination, management and intelligence levels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceParameters {
    /// Monotonic snapshot version
    pub version: u64,
    /// Arbitration strategy
    pub strategy: ArbitrationStrategy,
    /// Starvation bound in milliseconds
    pub starvation_ms: u64,
    /// Health window in milliseconds
    pub health_check_interval_ms: u64,
    /// Failures that trigger a recovery
    pub failure_threshold: u32,
    /// Recovery attempts before a governor is marked failed
    pub retry_attempts: u32,
    /// Base recovery backoff in milliseconds
    pub retry_delay_ms: u64,
    /// Cycles per governor considered by analysis and replay
    pub analysis_window: usize,
    /// Failure rate above which a port is flagged
    pub failure_rate_alert: f64,
}

impl GovernanceParameters {
    /// First snapshot, taken from configuration
    pub fn from_config(config: &GovernanceConfig) -> Self {
        Self {
            version: 1,
            strategy: config.system2.strategy,
            starvation_ms: config.system2.starvation_ms,
            health_check_interval_ms: config.system3.health_check_interval_ms,
            failure_threshold: config.system3.failure_threshold,
            retry_attempts: config.system3.retry_attempts,
            retry_delay_ms: config.system3.retry_delay_ms,
            analysis_window: config.system4.analysis_window,
            failure_rate_alert: config.system4.failure_rate_alert,
        }
    }

    /// Starvation bound
    pub fn starvation(&self) -> Duration {
        Duration::from_millis(self.starvation_ms)
    }

    /// Health window
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Base recovery backoff
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Check the invariants every committed snapshot holds
    pub fn check(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::parameters("failure threshold must be at least 1"));
        }
        if self.retry_attempts == 0 {
            return Err(Error::parameters("retry attempts must be at least 1"));
        }
        if self.retry_delay_ms == 0 || self.starvation_ms == 0 || self.health_check_interval_ms == 0 {
            return Err(Error::parameters("intervals must be positive"));
        }
        if self.retry_delay().saturating_mul(self.retry_attempts) > HARD_TIMEOUT_CEILING {
            return Err(Error::parameters(format!(
                "longest recovery backoff exceeds {:?}",
                HARD_TIMEOUT_CEILING
            )));
        }
        if self.analysis_window == 0 {
            return Err(Error::parameters("analysis window must be at least 1"));
        }
        if !(self.failure_rate_alert > 0.0 && self.failure_rate_alert <= 1.0) {
            return Err(Error::parameters("failure rate alert must be in (0, 1]"));
        }
        Ok(())
    }
}

impl Default for GovernanceParameters {
    fn default() -> Self {
        Self::from_config(&GovernanceConfig::default())
    }
}

/// Partial update of [`GovernanceParameters`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterChange {
    /// New arbitration strategy
    pub strategy: Option<ArbitrationStrategy>,
    /// New starvation bound
    pub starvation_ms: Option<u64>,
    /// New health window
    pub health_check_interval_ms: Option<u64>,
    /// New failure threshold
    pub failure_threshold: Option<u32>,
    /// New retry attempts
    pub retry_attempts: Option<u32>,
    /// New base backoff
    pub retry_delay_ms: Option<u64>,
    /// New analysis window
    pub analysis_window: Option<usize>,
    /// New failure-rate alert
    pub failure_rate_alert: Option<f64>,
}

impl ParameterChange {
    /// Whether the change touches nothing
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Candidate snapshot: `base` with the change applied and the version bumped
    pub fn apply(&self, base: &GovernanceParameters) -> GovernanceParameters {
        GovernanceParameters {
            version: base.version + 1,
            strategy: self.strategy.unwrap_or(base.strategy),
            starvation_ms: self.starvation_ms.unwrap_or(base.starvation_ms),
            health_check_interval_ms: self
                .health_check_interval_ms
                .unwrap_or(base.health_check_interval_ms),
            failure_threshold: self.failure_threshold.unwrap_or(base.failure_threshold),
            retry_attempts: self.retry_attempts.unwrap_or(base.retry_attempts),
            retry_delay_ms: self.retry_delay_ms.unwrap_or(base.retry_delay_ms),
            analysis_window: self.analysis_window.unwrap_or(base.analysis_window),
            failure_rate_alert: self.failure_rate_alert.unwrap_or(base.failure_rate_alert),
        }
    }

    /// Combine two changes; fields set in `other` win
    pub fn merge(self, other: ParameterChange) -> Self {
        Self {
            strategy: other.strategy.or(self.strategy),
            starvation_ms: other.starvation_ms.or(self.starvation_ms),
            health_check_interval_ms: other
                .health_check_interval_ms
                .or(self.health_check_interval_ms),
            failure_threshold: other.failure_threshold.or(self.failure_threshold),
            retry_attempts: other.retry_attempts.or(self.retry_attempts),
            retry_delay_ms: other.retry_delay_ms.or(self.retry_delay_ms),
            analysis_window: other.analysis_window.or(self.analysis_window),
            failure_rate_alert: other.failure_rate_alert.or(self.failure_rate_alert),
        }
    }
}

impl fmt::Display for ParameterChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields = Vec::new();
        if let Some(v) = self.strategy {
            fields.push(format!("strategy={:?}", v));
        }
        if let Some(v) = self.starvation_ms {
            fields.push(format!("starvation_ms={}", v));
        }
        if let Some(v) = self.health_check_interval_ms {
            fields.push(format!("health_check_interval_ms={}", v));
        }
        if let Some(v) = self.failure_threshold {
            fields.push(format!("failure_threshold={}", v));
        }
        if let Some(v) = self.retry_attempts {
            fields.push(format!("retry_attempts={}", v));
        }
        if let Some(v) = self.retry_delay_ms {
            fields.push(format!("retry_delay_ms={}", v));
        }
        if let Some(v) = self.analysis_window {
            fields.push(format!("analysis_window={}", v));
        }
        if let Some(v) = self.failure_rate_alert {
            fields.push(format!("failure_rate_alert={}", v));
        }
        if fields.is_empty() {
            write!(f, "no change")
        } else {
            write!(f, "{}", fields.join(", "))
        }
    }
}

/// Holder of the live [`GovernanceParameters`] snapshot
#[derive(Debug)]
pub struct ParameterStore {
    current: RwLock<Arc<GovernanceParameters>>,
    previous: RwLock<Option<Arc<GovernanceParameters>>>,
    roster: Roster,
    security: Arc<SecurityGovernor>,
    events: SharedEventBus,
}

impl ParameterStore {
    /// Create a store; the initial snapshot must pass [`GovernanceParameters::check`]
    pub fn new(
        initial: GovernanceParameters,
        roster: Roster,
        security: Arc<SecurityGovernor>,
        events: SharedEventBus,
    ) -> Result<Self> {
        initial.check()?;
        Ok(Self {
            current: RwLock::new(Arc::new(initial)),
            previous: RwLock::new(None),
            roster,
            security,
            events,
        })
    }

    /// The live snapshot
    pub fn snapshot(&self) -> Arc<GovernanceParameters> {
        match self.current.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Check a candidate without committing it.
    ///
    /// Besides the invariants, recent System1 history is replayed through
    /// the management level's failure tracking: a candidate that would mark
    /// a governor failed where the live snapshot does not is rejected.
    pub fn simulate(&self, candidate: &GovernanceParameters) -> Result<()> {
        candidate.check()?;
        let current = self.snapshot();
        let window = candidate.analysis_window.max(current.analysis_window);
        for (governor, entry) in self.roster.entries()? {
            let cycles = entry.history.recent(window);
            if FailureTracker::exhausts(&cycles, candidate)
                && !FailureTracker::exhausts(&cycles, &current)
            {
                return Err(Error::parameters(format!(
                    "replay of {} cycles marks {} failed",
                    cycles.len(),
                    governor
                )));
            }
        }
        Ok(())
    }

    /// Simulate and, if it passes, commit a change
    pub fn propose(&self, change: &ParameterChange, rationale: &str) -> Result<Arc<GovernanceParameters>> {
        if change.is_empty() {
            return Err(Error::parameters("empty change"));
        }
        let base = self.snapshot();
        let candidate = change.apply(&base);

        if let Err(e) = self.simulate(&candidate) {
            warn!("Rejected parameters v{} ({}): {}", candidate.version, change, e);
            self.audit(
                ThreatLevel::Medium,
                format!("rejected v{} ({}): {}", candidate.version, change, e),
            );
            self.publish(GovernanceEvent::ParametersRejected {
                version: candidate.version,
                reason: e.to_string(),
            });
            return Err(e);
        }

        let committed = Arc::new(candidate);
        {
            let mut current = self
                .current
                .write()
                .map_err(|_| Error::governor("Failed to acquire write lock on parameters"))?;
            if current.version != base.version {
                return Err(Error::parameters(format!(
                    "snapshot moved to v{} during simulation",
                    current.version
                )));
            }
            let replaced = std::mem::replace(&mut *current, committed.clone());
            if let Ok(mut previous) = self.previous.write() {
                *previous = Some(replaced);
            }
        }

        info!("Committed parameters v{}: {} ({})", committed.version, change, rationale);
        self.audit(
            ThreatLevel::Low,
            format!("committed v{}: {} ({})", committed.version, change, rationale),
        );
        self.publish(GovernanceEvent::ParametersCommitted {
            version: committed.version,
            rationale: rationale.to_string(),
        });
        Ok(committed)
    }

    /// Restore the snapshot replaced by the last commit.
    ///
    /// The restored values get a fresh version so versions never go back.
    pub fn revert(&self, reason: &str) -> Result<Arc<GovernanceParameters>> {
        let previous = self
            .previous
            .write()
            .map_err(|_| Error::governor("Failed to acquire write lock on parameters"))?
            .take()
            .ok_or_else(|| Error::parameters("no previous snapshot to revert to"))?;

        let restored = {
            let mut current = self
                .current
                .write()
                .map_err(|_| Error::governor("Failed to acquire write lock on parameters"))?;
            let restored = Arc::new(GovernanceParameters {
                version: current.version + 1,
                ..(*previous).clone()
            });
            *current = restored.clone();
            restored
        };

        warn!("Reverted parameters to v{} values: {}", previous.version, reason);
        self.audit(
            ThreatLevel::Medium,
            format!("reverted to v{} values as v{}: {}", previous.version, restored.version, reason),
        );
        self.publish(GovernanceEvent::ParametersReverted {
            version: restored.version,
            reason: reason.to_string(),
        });
        Ok(restored)
    }

    fn audit(&self, level: ThreatLevel, details: String) {
        self.security
            .record(SecurityEvent::new(SecurityEventKind::ConfigurationChange, level, details));
    }

    fn publish(&self, event: GovernanceEvent) {
        if let Err(e) = self.events.publish(event) {
            warn!("Failed to publish governance event: {}", e);
        }
    }
}

/// What System5 sees each cycle
#[derive(Debug, Clone)]
pub struct MetaObservation {
    /// Live snapshot
    pub parameters: Arc<GovernanceParameters>,
    /// Recommendations received since the last cycle
    pub recommendations: Vec<Recommendation>,
    /// Recommendations lost to a lagging receiver
    pub lagged: u64,
}

/// A change System5 intends to propose
#[derive(Debug, Clone)]
pub struct Proposal {
    /// The change
    pub change: ParameterChange,
    /// Joined rationales of the recommendations behind it
    pub rationale: String,
}

/// System5 strategy: turns parameter recommendations into proposals
#[derive(Debug)]
pub struct MetaStrategy {
    store: Arc<ParameterStore>,
    recommendations: broadcast::Receiver<Recommendation>,
    committed: Option<u64>,
    commits: u64,
    rejections: u64,
}

impl MetaStrategy {
    /// Create the strategy
    pub fn new(store: Arc<ParameterStore>, recommendations: broadcast::Receiver<Recommendation>) -> Self {
        Self {
            store,
            recommendations,
            committed: None,
            commits: 0,
            rejections: 0,
        }
    }
}

#[async_trait]
impl ControlStrategy for MetaStrategy {
    type Observation = MetaObservation;
    type Action = Proposal;

    fn role(&self) -> Role {
        Role::Meta
    }

    fn scope(&self) -> String {
        "governance parameters".to_string()
    }

    async fn probe(&mut self) -> Result<MetaObservation> {
        let mut recommendations = Vec::new();
        let mut lagged = 0;
        loop {
            match self.recommendations.try_recv() {
                Ok(rec) => recommendations.push(rec),
                Err(TryRecvError::Lagged(n)) => lagged += n,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        Ok(MetaObservation {
            parameters: self.store.snapshot(),
            recommendations,
            lagged,
        })
    }

    fn sense(&mut self, observation: &MetaObservation) -> Sensed<Proposal> {
        let mut change = ParameterChange::default();
        let mut rationale = Vec::new();
        for rec in observation
            .recommendations
            .iter()
            .filter(|r| r.target == Role::Meta)
        {
            if let Some(c) = rec.kind.parameter_change() {
                change = change.merge(c);
                rationale.push(rec.rationale.clone());
            }
        }

        let summary = format!(
            "v{}, {} recommendations ({} lagged)",
            observation.parameters.version,
            observation.recommendations.len(),
            observation.lagged
        );
        if change.is_empty() {
            return Sensed::nominal(summary);
        }
        Sensed::act(
            Severity::Minor,
            summary,
            Proposal {
                change,
                rationale: rationale.join("; "),
            },
        )
    }

    async fn respond(&mut self, proposal: Proposal) -> ResponseOutcome {
        match self.store.propose(&proposal.change, &proposal.rationale) {
            Ok(params) => {
                self.committed = Some(params.version);
                ResponseOutcome::Executed(format!("committed v{}: {}", params.version, proposal.change))
            }
            Err(e) => ResponseOutcome::Failed(e.to_string()),
        }
    }

    fn learn(&mut self, _: &MetaObservation, _: Severity, outcome: &ResponseOutcome) -> String {
        match outcome {
            ResponseOutcome::Executed(_) => {
                self.commits += 1;
                format!("+1 commit ({})", self.commits)
            }
            ResponseOutcome::Failed(_) => {
                self.rejections += 1;
                format!("+1 rejection ({})", self.rejections)
            }
            _ => String::new(),
        }
    }

    async fn validate(&mut self) -> Result<ValidationOutcome> {
        let Some(version) = self.committed.take() else {
            return Ok(ValidationOutcome::Passed);
        };
        let live = self.store.snapshot();
        if live.version != version {
            debug!("Parameters v{} superseded by v{}", version, live.version);
            return Ok(ValidationOutcome::Passed);
        }
        if let Err(e) = live.check() {
            let restored = self.store.revert(&e.to_string())?;
            return Ok(ValidationOutcome::Failed(format!(
                "v{} reverted as v{}: {}",
                version, restored.version, e
            )));
        }
        Ok(ValidationOutcome::Passed)
    }

    fn model_summary(&self) -> String {
        format!(
            "v{}, {} commits, {} rejections",
            self.store.snapshot().version,
            self.commits,
            self.rejections
        )
    }
}
