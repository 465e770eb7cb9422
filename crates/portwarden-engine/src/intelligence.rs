/*!
 * Intelligence level (System4).
 *
 * Mines recent PSRLV history across all ports and the arbiter's queues and
 * broadcasts non-binding [`Recommendation`]s: port investigations for
 * System3, parameter changes for System5. It never touches a port.
 */
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use portwarden_core::config::ArbitrationStrategy;
use portwarden_core::types::{Id, Timestamp};

use crate::coordination::{ResourceArbiter, ResourceSnapshot};
use crate::error::Result;
use crate::governor::{ControlStrategy, GovernorId, Role, Sensed};
use crate::meta::{GovernanceParameters, ParameterChange, ParameterStore};
use crate::operational::Roster;
use crate::psrlv::{failure_rate, ResponseOutcome, Severity, ValidationOutcome};

/// Capacity of the recommendation broadcast channel
pub const RECOMMENDATION_CAPACITY: usize = 64;

/// What a recommendation suggests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecommendationKind {
    /// A port fails more often than the alert rate
    InvestigatePort {
        /// Port concerned
        port: Id,
        /// Observed failure rate
        failure_rate: f64,
    },
    /// Recoveries come too fast for the fleet to settle
    ExtendRetryDelay {
        /// Suggested base backoff
        retry_delay_ms: u64,
    },
    /// Contention suggests another arbitration strategy
    SwitchArbitration {
        /// Suggested strategy
        strategy: ArbitrationStrategy,
    },
}

impl RecommendationKind {
    /// Parameter change this recommendation amounts to, if any
    pub fn parameter_change(&self) -> Option<ParameterChange> {
        match self {
            RecommendationKind::InvestigatePort { .. } => None,
            RecommendationKind::ExtendRetryDelay { retry_delay_ms } => Some(ParameterChange {
                retry_delay_ms: Some(*retry_delay_ms),
                ..ParameterChange::default()
            }),
            RecommendationKind::SwitchArbitration { strategy } => Some(ParameterChange {
                strategy: Some(*strategy),
                ..ParameterChange::default()
            }),
        }
    }
}

/// Non-binding advice addressed to one level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Recommendation id
    pub id: Id,
    /// Level it is meant for
    pub target: Role,
    /// What it suggests
    pub kind: RecommendationKind,
    /// Why
    pub rationale: String,
    /// When it was issued
    pub timestamp: Timestamp,
}

impl Recommendation {
    /// Create a recommendation stamped now
    pub fn new<S: Into<String>>(target: Role, kind: RecommendationKind, rationale: S) -> Self {
        Self {
            id: Id::new(),
            target,
            kind,
            rationale: rationale.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Recent behaviour of one port
#[derive(Debug, Clone, PartialEq)]
pub struct PortTrend {
    /// System1 governor
    pub governor: GovernorId,
    /// Port
    pub port: Id,
    /// Cycles considered
    pub cycles: usize,
    /// Fraction of failed cycles
    pub failure_rate: f64,
    /// Cycles whose action was refused
    pub denials: usize,
}

/// What System4 sees each cycle
#[derive(Debug, Clone)]
pub struct IntelligenceObservation {
    /// Live parameters
    pub parameters: Arc<GovernanceParameters>,
    /// One trend per System1 governor
    pub trends: Vec<PortTrend>,
    /// Arbiter queues
    pub resources: Vec<ResourceSnapshot>,
}

/// System4 strategy
#[derive(Debug)]
pub struct IntelligenceStrategy {
    roster: Roster,
    parameters: Arc<ParameterStore>,
    arbiter: Option<Arc<ResourceArbiter>>,
    recommendations: broadcast::Sender<Recommendation>,
    flagged: HashSet<Id>,
    advised_version: Option<u64>,
    baseline: HashMap<Id, f64>,
    issued: u64,
}

impl IntelligenceStrategy {
    /// Create the strategy
    pub fn new(
        roster: Roster,
        parameters: Arc<ParameterStore>,
        recommendations: broadcast::Sender<Recommendation>,
    ) -> Self {
        Self {
            roster,
            parameters,
            arbiter: None,
            recommendations,
            flagged: HashSet::new(),
            advised_version: None,
            baseline: HashMap::new(),
            issued: 0,
        }
    }

    /// Also watch the arbiter's queues
    pub fn with_arbiter(mut self, arbiter: Arc<ResourceArbiter>) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    /// Learned failure-rate baseline of a port
    pub fn baseline(&self, port: &Id) -> Option<f64> {
        self.baseline.get(port).copied()
    }
}

#[async_trait]
impl ControlStrategy for IntelligenceStrategy {
    type Observation = IntelligenceObservation;
    type Action = Vec<Recommendation>;

    fn role(&self) -> Role {
        Role::Intelligence
    }

    fn scope(&self) -> String {
        "cross-port history".to_string()
    }

    async fn probe(&mut self) -> Result<IntelligenceObservation> {
        let parameters = self.parameters.snapshot();
        let mut trends = Vec::new();
        for (governor, entry) in self.roster.entries()? {
            let cycles = entry.history.recent(parameters.analysis_window);
            trends.push(PortTrend {
                governor,
                port: entry.port,
                cycles: cycles.len(),
                failure_rate: failure_rate(&cycles),
                denials: cycles
                    .iter()
                    .filter(|c| matches!(c.response, ResponseOutcome::Denied(_)))
                    .count(),
            });
        }
        let resources = match &self.arbiter {
            Some(arbiter) => arbiter.snapshot()?,
            None => Vec::new(),
        };
        Ok(IntelligenceObservation {
            parameters,
            trends,
            resources,
        })
    }

    fn sense(&mut self, observation: &IntelligenceObservation) -> Sensed<Vec<Recommendation>> {
        let params = &observation.parameters;
        let flagged: Vec<&PortTrend> = observation
            .trends
            .iter()
            .filter(|t| t.cycles > 0 && t.failure_rate > params.failure_rate_alert)
            .collect();

        let mut recs = Vec::new();
        for trend in &flagged {
            if self.flagged.contains(&trend.port) {
                continue;
            }
            recs.push(Recommendation::new(
                Role::Management,
                RecommendationKind::InvestigatePort {
                    port: trend.port.clone(),
                    failure_rate: trend.failure_rate,
                },
                format!(
                    "{} failed {:.0}% of its last {} cycles ({} refused)",
                    trend.port,
                    trend.failure_rate * 100.0,
                    trend.cycles,
                    trend.denials
                ),
            ));
        }
        self.flagged = flagged.iter().map(|t| t.port.clone()).collect();

        let systemic = flagged.len() >= 2 && flagged.len() * 2 >= observation.trends.len();
        let fresh = self.advised_version != Some(params.version);
        if systemic && fresh {
            let ceiling = 30_000 / u64::from(params.retry_attempts.max(1));
            let longer = params.retry_delay_ms.saturating_mul(2).min(ceiling);
            if longer > params.retry_delay_ms {
                recs.push(Recommendation::new(
                    Role::Meta,
                    RecommendationKind::ExtendRetryDelay {
                        retry_delay_ms: longer,
                    },
                    format!(
                        "{} of {} ports above the alert rate",
                        flagged.len(),
                        observation.trends.len()
                    ),
                ));
            }
        }

        let contended = observation.resources.iter().filter(|r| r.waiting.len() >= 2).count();
        if contended > 0 && fresh && params.strategy == ArbitrationStrategy::Priority {
            recs.push(Recommendation::new(
                Role::Meta,
                RecommendationKind::SwitchArbitration {
                    strategy: ArbitrationStrategy::RoundRobin,
                },
                format!("{} resources with queued waiters under static priority", contended),
            ));
        }
        if recs.iter().any(|r| r.target == Role::Meta) {
            self.advised_version = Some(params.version);
        }

        let summary = format!(
            "{} ports, {} above {:.0}%, {} contended resources",
            observation.trends.len(),
            flagged.len(),
            params.failure_rate_alert * 100.0,
            contended
        );
        let severity = if systemic {
            Severity::Major
        } else if !flagged.is_empty() || contended > 0 {
            Severity::Minor
        } else {
            Severity::Nominal
        };
        if recs.is_empty() {
            Sensed::observe(severity, summary)
        } else {
            Sensed::act(severity, summary, recs)
        }
    }

    async fn respond(&mut self, recs: Vec<Recommendation>) -> ResponseOutcome {
        let count = recs.len();
        let mut reached = 0;
        for rec in recs {
            debug!("Recommending to {}: {:?}", rec.target, rec.kind);
            reached = self.recommendations.send(rec).unwrap_or(0).max(reached);
        }
        self.issued += count as u64;
        ResponseOutcome::Executed(format!("issued {} recommendations to {} listeners", count, reached))
    }

    fn learn(&mut self, observation: &IntelligenceObservation, _: Severity, _: &ResponseOutcome) -> String {
        let mut moved = Vec::new();
        for trend in observation.trends.iter().filter(|t| t.cycles > 0) {
            let entry = self.baseline.entry(trend.port.clone()).or_insert(trend.failure_rate);
            let before = *entry;
            *entry = 0.7 * before + 0.3 * trend.failure_rate;
            if (*entry - before).abs() >= 0.1 {
                moved.push(format!("{} {:.2}", trend.port, *entry));
            }
        }
        let live: HashSet<&Id> = observation.trends.iter().map(|t| &t.port).collect();
        self.baseline.retain(|port, _| live.contains(port));
        moved.join(", ")
    }

    async fn validate(&mut self) -> Result<ValidationOutcome> {
        Ok(ValidationOutcome::Passed)
    }

    fn model_summary(&self) -> String {
        format!(
            "{} baselines, {} recommendations issued",
            self.baseline.len(),
            self.issued
        )
    }
}
