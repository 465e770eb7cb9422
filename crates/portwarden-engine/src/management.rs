/*!
 * Management level (System3).
 *
 * Reads every System1 history, counts failures per governor and forces a
 * recovery once trailing consecutive failures, or failures within the
 * health window, reach the failure threshold. Each attempt sends exactly
 * one directive; once the attempts are spent the governor is marked
 * failed. Mode transitions, not individual failures, are published.
 */
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use portwarden_core::event::SharedEventBus;
use portwarden_core::types::{Id, Timestamp};
use portwarden_core::utils::capped_backoff;

use crate::error::Result;
use crate::events::GovernanceEvent;
use crate::governor::{ControlStrategy, GovernorId, Role, Sensed};
use crate::intelligence::Recommendation;
use crate::meta::{GovernanceParameters, ParameterStore};
use crate::operational::{RecoveryDirective, Roster};
use crate::psrlv::{PsrlvCycle, ResponseOutcome, Severity, ValidationOutcome};

/// Number of advisory notes kept
const NOTE_CAPACITY: usize = 32;

/// Reliability of one System1 governor as judged by System3
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReliabilityMode {
    /// No recovery in progress
    #[default]
    Normal,
    /// Recovering
    Degraded,
    /// Recovery attempts exhausted
    Failed,
}

impl fmt::Display for ReliabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReliabilityMode::Normal => write!(f, "normal"),
            ReliabilityMode::Degraded => write!(f, "degraded"),
            ReliabilityMode::Failed => write!(f, "failed"),
        }
    }
}

/// Result of feeding new cycles to a [`FailureTracker`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerStep {
    /// Directive to send, at most one per step
    pub directive: Option<RecoveryDirective>,
    /// Mode transitions in order
    pub transitions: Vec<(ReliabilityMode, ReliabilityMode)>,
}

/// Failure bookkeeping for one System1 governor
#[derive(Debug, Clone, Default)]
pub struct FailureTracker {
    last_seq: u64,
    consecutive: u32,
    window: VecDeque<Timestamp>,
    attempts: u32,
    mode: ReliabilityMode,
}

impl FailureTracker {
    /// Current mode
    pub fn mode(&self) -> ReliabilityMode {
        self.mode
    }

    /// Recovery attempts spent since the governor was last healthy
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Sequence number of the last cycle seen
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    fn set_mode(&mut self, to: ReliabilityMode, step: &mut TrackerStep) {
        if self.mode != to {
            step.transitions.push((self.mode, to));
            self.mode = to;
        }
    }

    /// Feed cycles newer than the last one seen.
    ///
    /// A healthy cycle resets the streak and, after a recovery, returns the
    /// governor to `Normal`. The threshold is checked once after all cycles
    /// are counted, so one step sends at most one directive.
    pub fn step(&mut self, cycles: &[PsrlvCycle], params: &GovernanceParameters) -> TrackerStep {
        let mut step = TrackerStep::default();
        let window = chrono::Duration::milliseconds(
            i64::try_from(params.health_check_interval_ms).unwrap_or(i64::MAX),
        );

        for cycle in cycles.iter() {
            if cycle.seq <= self.last_seq {
                continue;
            }
            self.last_seq = cycle.seq;
            if cycle.is_failure() {
                self.consecutive += 1;
                self.window.push_back(cycle.timestamp);
            } else {
                self.consecutive = 0;
                if self.mode != ReliabilityMode::Normal {
                    self.attempts = 0;
                    self.window.clear();
                    self.set_mode(ReliabilityMode::Normal, &mut step);
                }
            }
            let horizon = cycle.timestamp - window;
            while self.window.front().is_some_and(|t| *t < horizon) {
                self.window.pop_front();
            }
        }

        let threshold = params.failure_threshold as usize;
        let tripped = self.consecutive as usize >= threshold || self.window.len() >= threshold;
        if self.mode == ReliabilityMode::Failed || !tripped {
            return step;
        }

        self.consecutive = 0;
        self.window.clear();
        if self.attempts >= params.retry_attempts {
            self.set_mode(ReliabilityMode::Failed, &mut step);
            return step;
        }

        self.attempts += 1;
        step.directive = Some(RecoveryDirective::new(
            self.attempts,
            capped_backoff(params.retry_delay(), self.attempts, params.retry_attempts),
        ));
        self.set_mode(ReliabilityMode::Degraded, &mut step);
        step
    }

    /// Take back an attempt whose directive was never delivered
    pub fn retract(&mut self) {
        self.attempts = self.attempts.saturating_sub(1);
    }

    /// Whether replaying `cycles` one at a time under `params` ends in `Failed`
    pub fn exhausts(cycles: &[PsrlvCycle], params: &GovernanceParameters) -> bool {
        let mut tracker = FailureTracker::default();
        cycles.iter().any(|cycle| {
            tracker.step(std::slice::from_ref(cycle), params);
            tracker.mode == ReliabilityMode::Failed
        })
    }
}

/// One governor's share of a System3 observation
#[derive(Debug, Clone)]
pub struct GovernorReport {
    /// System1 governor
    pub governor: GovernorId,
    /// Its port
    pub port: Id,
    /// Cycles recorded since the last probe
    pub cycles: Vec<PsrlvCycle>,
}

/// What System3 sees each cycle
#[derive(Debug, Clone)]
pub struct ManagementObservation {
    /// Live parameters
    pub parameters: Arc<GovernanceParameters>,
    /// New cycles per governor
    pub reports: Vec<GovernorReport>,
    /// Advisory notes received from System4
    pub advice: Vec<Recommendation>,
}

/// A step of System3's plan
#[derive(Debug, Clone, PartialEq)]
pub enum ManagementAction {
    /// Send a directive to a System1 governor
    Recover {
        /// Target governor
        governor: GovernorId,
        /// Directive
        directive: RecoveryDirective,
    },
    /// Publish a mode transition
    Transition {
        /// Affected governor
        governor: GovernorId,
        /// Its port
        port: Id,
        /// Previous mode
        from: ReliabilityMode,
        /// New mode
        to: ReliabilityMode,
        /// Attempts spent at the transition
        attempts: u32,
    },
}

/// System3 strategy
#[derive(Debug)]
pub struct ManagementStrategy {
    roster: Roster,
    parameters: Arc<ParameterStore>,
    events: SharedEventBus,
    advice: broadcast::Receiver<Recommendation>,
    trackers: HashMap<GovernorId, FailureTracker>,
    notes: VecDeque<String>,
    undelivered: Vec<GovernorId>,
    recoveries: u64,
    transitions: u64,
}

impl ManagementStrategy {
    /// Create the strategy
    pub fn new(
        roster: Roster,
        parameters: Arc<ParameterStore>,
        events: SharedEventBus,
        advice: broadcast::Receiver<Recommendation>,
    ) -> Self {
        Self {
            roster,
            parameters,
            events,
            advice,
            trackers: HashMap::new(),
            notes: VecDeque::with_capacity(NOTE_CAPACITY),
            undelivered: Vec::new(),
            recoveries: 0,
            transitions: 0,
        }
    }

    /// Mode of a System1 governor as currently judged
    pub fn mode(&self, governor: &GovernorId) -> ReliabilityMode {
        self.trackers.get(governor).map(|t| t.mode()).unwrap_or_default()
    }

    /// Advisory notes taken from System4, oldest first
    pub fn notes(&self) -> impl Iterator<Item = &String> {
        self.notes.iter()
    }

    fn note(&mut self, rec: &Recommendation) {
        if self.notes.len() == NOTE_CAPACITY {
            self.notes.pop_front();
        }
        self.notes.push_back(format!("{:?}: {}", rec.kind, rec.rationale));
    }
}

#[async_trait]
impl ControlStrategy for ManagementStrategy {
    type Observation = ManagementObservation;
    type Action = Vec<ManagementAction>;

    fn role(&self) -> Role {
        Role::Management
    }

    fn scope(&self) -> String {
        "system1 health".to_string()
    }

    async fn probe(&mut self) -> Result<ManagementObservation> {
        let mut reports = Vec::new();
        for (governor, entry) in self.roster.entries()? {
            let last_seq = self.trackers.get(&governor).map(|t| t.last_seq()).unwrap_or(0);
            reports.push(GovernorReport {
                governor,
                port: entry.port,
                cycles: entry.history.since(last_seq),
            });
        }

        let mut advice = Vec::new();
        loop {
            match self.advice.try_recv() {
                Ok(rec) if rec.target == Role::Management => advice.push(rec),
                Ok(_) => {}
                Err(TryRecvError::Lagged(n)) => debug!("Skipped {} recommendations", n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        Ok(ManagementObservation {
            parameters: self.parameters.snapshot(),
            reports,
            advice,
        })
    }

    fn sense(&mut self, observation: &ManagementObservation) -> Sensed<Vec<ManagementAction>> {
        for rec in &observation.advice {
            self.note(rec);
        }

        let mut plan = Vec::new();
        let mut severity = Severity::Nominal;
        for report in &observation.reports {
            let tracker = self.trackers.entry(report.governor.clone()).or_default();
            let step = tracker.step(&report.cycles, &observation.parameters);
            let attempts = tracker.attempts();

            for (from, to) in step.transitions {
                severity = severity.max(match to {
                    ReliabilityMode::Failed => Severity::Critical,
                    ReliabilityMode::Degraded => Severity::Major,
                    ReliabilityMode::Normal => Severity::Minor,
                });
                plan.push(ManagementAction::Transition {
                    governor: report.governor.clone(),
                    port: report.port.clone(),
                    from,
                    to,
                    attempts,
                });
            }
            if let Some(directive) = step.directive {
                severity = severity.max(Severity::Major);
                plan.push(ManagementAction::Recover {
                    governor: report.governor.clone(),
                    directive,
                });
            }
        }

        let degraded = self
            .trackers
            .values()
            .filter(|t| t.mode() != ReliabilityMode::Normal)
            .count();
        let summary = format!(
            "{} governors, {} not normal, {} advisory notes",
            observation.reports.len(),
            degraded,
            observation.advice.len()
        );
        if plan.is_empty() {
            Sensed::nominal(summary)
        } else {
            Sensed::act(severity, summary, plan)
        }
    }

    async fn respond(&mut self, plan: Vec<ManagementAction>) -> ResponseOutcome {
        let mut done = Vec::new();
        self.undelivered.clear();

        for action in plan {
            match action {
                ManagementAction::Recover { governor, directive } => {
                    let Ok(Some(entry)) = self.roster.get(&governor) else {
                        warn!("Governor {} left the roster before recovery", governor);
                        continue;
                    };
                    match entry.directives.try_send(directive.clone()) {
                        Ok(()) => {
                            self.recoveries += 1;
                            info!(
                                "Recovery attempt {} sent to {} (backoff {:?})",
                                directive.attempt,
                                governor,
                                directive.backoff()
                            );
                            done.push(format!("recover {} #{}", governor, directive.attempt));
                        }
                        Err(TrySendError::Full(_)) => {
                            debug!("Recovery already pending for {}", governor);
                            if let Some(tracker) = self.trackers.get_mut(&governor) {
                                tracker.retract();
                            }
                        }
                        Err(TrySendError::Closed(_)) => {
                            warn!("Governor {} no longer takes directives", governor);
                            self.undelivered.push(governor);
                        }
                    }
                }
                ManagementAction::Transition {
                    governor,
                    port,
                    from,
                    to,
                    attempts,
                } => {
                    self.transitions += 1;
                    info!("Governor {} reliability {} -> {}", governor, from, to);
                    if let Err(e) = self.events.publish(GovernanceEvent::ReliabilityModeChanged {
                        governor: governor.clone(),
                        port,
                        from,
                        to,
                        attempts,
                    }) {
                        warn!("Failed to publish mode change: {}", e);
                    }
                    done.push(format!("{} {}", governor, to));
                }
            }
        }

        if done.is_empty() {
            ResponseOutcome::NoOp
        } else {
            ResponseOutcome::Executed(done.join(", "))
        }
    }

    fn learn(&mut self, _: &ManagementObservation, _: Severity, _: &ResponseOutcome) -> String {
        let live: Vec<GovernorId> = self
            .roster
            .entries()
            .map(|entries| entries.into_iter().map(|(g, _)| g).collect())
            .unwrap_or_default();
        let before = self.trackers.len();
        self.trackers.retain(|g, _| live.contains(g));
        match before - self.trackers.len() {
            0 => String::new(),
            n => format!("forgot {} governors", n),
        }
    }

    async fn validate(&mut self) -> Result<ValidationOutcome> {
        if self.undelivered.is_empty() {
            return Ok(ValidationOutcome::Passed);
        }
        let names: Vec<String> = self.undelivered.iter().map(|g| g.to_string()).collect();
        Ok(ValidationOutcome::Failed(format!(
            "directives undeliverable to {}",
            names.join(", ")
        )))
    }

    fn model_summary(&self) -> String {
        format!(
            "{} tracked, {} recoveries, {} transitions, {} notes",
            self.trackers.len(),
            self.recoveries,
            self.transitions,
            self.notes.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operational::{directive_channel, RosterEntry};
    use crate::psrlv::{cycle, CycleHistory};
    use portwarden_core::config::SecurityConfig;
    use portwarden_core::event::EventReceiver;
    use portwarden_security::SecurityGovernor;
    use tokio::sync::mpsc;

    struct Fixture {
        strategy: ManagementStrategy,
        history: CycleHistory,
        directives: mpsc::Receiver<RecoveryDirective>,
        events: EventReceiver<GovernanceEvent>,
        gid: GovernorId,
    }

    fn fixture(retry_attempts: u32) -> Result<Fixture> {
        let roster = Roster::new();
        let gid = GovernorId::for_port(&Id::from("COM1"));
        let history = CycleHistory::new(64);
        let (tx, rx) = directive_channel();
        roster.insert(
            gid.clone(),
            RosterEntry {
                port: Id::from("COM1"),
                history: history.clone(),
                directives: tx,
            },
        )?;

        let bus = SharedEventBus::new();
        let security = Arc::new(SecurityGovernor::new(&SecurityConfig::default())?);
        let params = GovernanceParameters {
            retry_attempts,
            retry_delay_ms: 100,
            ..GovernanceParameters::default()
        };
        let store = Arc::new(ParameterStore::new(params, roster.clone(), security, bus.clone())?);
        let (_advice_tx, advice_rx) = broadcast::channel(8);
        let events = bus.subscribe::<GovernanceEvent>()?;

        Ok(Fixture {
            strategy: ManagementStrategy::new(roster, store, bus, advice_rx),
            history,
            directives: rx,
            events,
            gid,
        })
    }

    async fn run(strategy: &mut ManagementStrategy) -> Result<ResponseOutcome> {
        let observation = strategy.probe().await?;
        let sensed = strategy.sense(&observation);
        Ok(match sensed.action {
            Some(plan) => strategy.respond(plan).await,
            None => ResponseOutcome::NoOp,
        })
    }

    fn fail(f: &Fixture, n: usize) -> Result<()> {
        for _ in 0..n {
            f.history.record(cycle(&f.gid, Severity::Major))?;
        }
        Ok(())
    }

    fn mode_changes(f: &mut Fixture) -> Vec<(ReliabilityMode, ReliabilityMode)> {
        let mut changes = Vec::new();
        while let Ok(event) = f.events.try_recv() {
            if let GovernanceEvent::ReliabilityModeChanged { from, to, .. } = event {
                changes.push((from, to));
            }
        }
        changes
    }

    #[tokio::test]
    async fn test_threshold_sends_exactly_one_directive() -> Result<()> {
        let mut f = fixture(3)?;
        fail(&f, 5)?;

        run(&mut f.strategy).await?;
        let directive = f.directives.try_recv().ok();
        assert_eq!(directive.map(|d| (d.attempt, d.backoff_ms)), Some((1, 100)));
        assert!(f.directives.try_recv().is_err());

        // Further failures below the threshold send nothing
        fail(&f, 2)?;
        run(&mut f.strategy).await?;
        assert!(f.directives.try_recv().is_err());

        assert_eq!(
            mode_changes(&mut f),
            vec![(ReliabilityMode::Normal, ReliabilityMode::Degraded)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_backoff_grows_then_governor_fails() -> Result<()> {
        let mut f = fixture(2)?;

        fail(&f, 3)?;
        run(&mut f.strategy).await?;
        assert_eq!(f.directives.try_recv().ok().map(|d| d.backoff_ms), Some(100));

        fail(&f, 3)?;
        run(&mut f.strategy).await?;
        assert_eq!(f.directives.try_recv().ok().map(|d| d.backoff_ms), Some(200));

        fail(&f, 3)?;
        run(&mut f.strategy).await?;
        assert!(f.directives.try_recv().is_err());
        assert_eq!(f.strategy.mode(&f.gid), ReliabilityMode::Failed);

        // Failed is published once, not per failure
        fail(&f, 6)?;
        run(&mut f.strategy).await?;
        assert_eq!(
            mode_changes(&mut f),
            vec![
                (ReliabilityMode::Normal, ReliabilityMode::Degraded),
                (ReliabilityMode::Degraded, ReliabilityMode::Failed),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_success_after_recovery_returns_to_normal() -> Result<()> {
        let mut f = fixture(3)?;
        fail(&f, 3)?;
        run(&mut f.strategy).await?;
        assert!(f.directives.try_recv().is_ok());

        f.history.record(cycle(&f.gid, Severity::Nominal))?;
        run(&mut f.strategy).await?;

        assert_eq!(f.strategy.mode(&f.gid), ReliabilityMode::Normal);
        assert_eq!(
            mode_changes(&mut f),
            vec![
                (ReliabilityMode::Normal, ReliabilityMode::Degraded),
                (ReliabilityMode::Degraded, ReliabilityMode::Normal),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_pending_directive_subsumes_next() -> Result<()> {
        let mut f = fixture(3)?;
        fail(&f, 3)?;
        run(&mut f.strategy).await?;

        // The first directive is still queued
        fail(&f, 3)?;
        run(&mut f.strategy).await?;

        assert_eq!(f.directives.try_recv().ok().map(|d| d.attempt), Some(1));
        assert!(f.directives.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn test_window_failures_trip_without_streak() {
        let gid = GovernorId::from_string("g");
        let params = GovernanceParameters::default();
        let mut tracker = FailureTracker::default();
        let mut cycles = Vec::new();
        for (seq, severity) in [Severity::Major, Severity::Nominal, Severity::Major, Severity::Nominal, Severity::Major]
            .into_iter()
            .enumerate()
        {
            let mut c = cycle(&gid, severity);
            c.seq = seq as u64 + 1;
            cycles.push(c);
        }

        let step = tracker.step(&cycles, &params);
        assert!(step.directive.is_some());
        assert_eq!(tracker.mode(), ReliabilityMode::Degraded);
    }
}
