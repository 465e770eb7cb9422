/*!
 * Generic governor.
 *
 * One [`Governor`] type drives every level of the hierarchy. The level is
 * fixed by the [`Role`] of its [`ControlStrategy`]; the strategy supplies
 * the five phases and the governor supplies timing, bounds, cancellation
 * and bookkeeping.
 */
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

use portwarden_core::error::Error as CoreError;
use portwarden_core::logging::component_span;
use portwarden_core::types::{Id, Timestamp};
use portwarden_core::utils::bounded;

use crate::error::Result;
use crate::psrlv::{CycleHistory, PsrlvCycle, ResponseOutcome, Severity, ValidationOutcome};

/// Governor identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GovernorId(Id);

impl GovernorId {
    /// Create a new random governor ID
    pub fn new() -> Self {
        Self(Id::new())
    }

    /// Create a governor ID from a string
    pub fn from_string<S: AsRef<str>>(s: S) -> Self {
        Self(Id::from_string(s))
    }

    /// ID of the operational governor for `port`
    pub fn for_port(port: &Id) -> Self {
        Self::from_string(format!("system1:{}", port))
    }

    /// Get the inner ID
    pub fn inner(&self) -> &Id {
        &self.0
    }
}

impl Default for GovernorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GovernorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a governor in the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System1: one port
    Operational,
    /// System2: shared-resource arbitration
    Coordination,
    /// System3: health and recovery
    Management,
    /// System4: cross-port analysis
    Intelligence,
    /// System5: governance policy
    Meta,
}

impl Role {
    /// Hierarchy level, 1 to 5
    pub fn level(&self) -> u8 {
        match self {
            Role::Operational => 1,
            Role::Coordination => 2,
            Role::Management => 3,
            Role::Intelligence => 4,
            Role::Meta => 5,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "system{}", self.level())
    }
}

/// Lifecycle of a governor task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernorState {
    /// Constructed, not yet spawned
    Idle,
    /// Cycling
    Running,
    /// Stopped after a shutdown signal
    Stopped,
}

/// Introspection record for one governor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorContext {
    /// Governor id
    pub id: GovernorId,
    /// Role
    pub role: Role,
    /// Level derived from the role
    pub level: u8,
    /// Controlled scope
    pub scope: String,
    /// Cycle interval in milliseconds
    pub interval_ms: u64,
    /// Task lifecycle
    pub state: GovernorState,
    /// Completed cycles
    pub cycles: u64,
    /// Severity sensed by the last cycle
    pub last_severity: Option<Severity>,
    /// Validation outcome of the last cycle
    pub last_outcome: Option<ValidationOutcome>,
    /// When the last cycle completed
    pub last_cycle_at: Option<Timestamp>,
    /// Summary of the strategy's learned model
    pub model: String,
}

/// Output of the sense phase
#[derive(Debug, Clone)]
pub struct Sensed<A> {
    /// Deviation classification
    pub severity: Severity,
    /// Probe summary recorded in the cycle
    pub summary: String,
    /// Proposed action, if any
    pub action: Option<A>,
}

impl<A> Sensed<A> {
    /// Nothing to do
    pub fn nominal<S: Into<String>>(summary: S) -> Self {
        Self {
            severity: Severity::Nominal,
            summary: summary.into(),
            action: None,
        }
    }

    /// Deviation with a proposed action
    pub fn act<S: Into<String>>(severity: Severity, summary: S, action: A) -> Self {
        Self {
            severity,
            summary: summary.into(),
            action: Some(action),
        }
    }

    /// Deviation the strategy cannot act on
    pub fn observe<S: Into<String>>(severity: Severity, summary: S) -> Self {
        Self {
            severity,
            summary: summary.into(),
            action: None,
        }
    }
}

/// The five phases of one role
#[async_trait]
pub trait ControlStrategy: Send + 'static {
    /// What probe observes
    type Observation: Send + Sync;
    /// What sense may propose
    type Action: Send;

    /// Role this strategy plays
    fn role(&self) -> Role;

    /// Human-readable scope
    fn scope(&self) -> String;

    /// Observe the scope
    async fn probe(&mut self) -> Result<Self::Observation>;

    /// Classify the observation and propose an action
    fn sense(&mut self, observation: &Self::Observation) -> Sensed<Self::Action>;

    /// Perform the proposed action
    async fn respond(&mut self, action: Self::Action) -> ResponseOutcome;

    /// Update the internal model and report what changed
    fn learn(
        &mut self,
        observation: &Self::Observation,
        severity: Severity,
        outcome: &ResponseOutcome,
    ) -> String;

    /// Re-probe to confirm the response had the intended effect
    async fn validate(&mut self) -> Result<ValidationOutcome>;

    /// One-line summary of the learned model
    fn model_summary(&self) -> String {
        String::new()
    }
}

type SharedContext = Arc<RwLock<GovernorContext>>;

/// A governor driving one [`ControlStrategy`]
pub struct Governor<S: ControlStrategy> {
    id: GovernorId,
    strategy: S,
    interval: Duration,
    validate_timeout: Duration,
    context: SharedContext,
    history: CycleHistory,
}

impl<S: ControlStrategy> fmt::Debug for Governor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Governor")
            .field("id", &self.id)
            .field("role", &self.strategy.role())
            .field("interval", &self.interval)
            .finish()
    }
}

impl<S: ControlStrategy> Governor<S> {
    /// Create an idle governor
    pub fn new(
        id: GovernorId,
        strategy: S,
        interval: Duration,
        validate_timeout: Duration,
        history: CycleHistory,
    ) -> Self {
        let role = strategy.role();
        let context = GovernorContext {
            id: id.clone(),
            role,
            level: role.level(),
            scope: strategy.scope(),
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            state: GovernorState::Idle,
            cycles: 0,
            last_severity: None,
            last_outcome: None,
            last_cycle_at: None,
            model: String::new(),
        };
        Self {
            id,
            strategy,
            interval,
            validate_timeout,
            context: Arc::new(RwLock::new(context)),
            history,
        }
    }

    /// Governor id
    pub fn id(&self) -> &GovernorId {
        &self.id
    }

    /// Role
    pub fn role(&self) -> Role {
        self.strategy.role()
    }

    /// The strategy
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// The strategy, mutably
    pub fn strategy_mut(&mut self) -> &mut S {
        &mut self.strategy
    }

    /// Cycle history
    pub fn history(&self) -> &CycleHistory {
        &self.history
    }

    /// Context snapshot
    pub fn context(&self) -> Result<GovernorContext> {
        read_context(&self.context)
    }

    /// Read-only view that outlives the governor being spawned
    pub fn view(&self) -> GovernorView {
        GovernorView {
            id: self.id.clone(),
            role: self.strategy.role(),
            context: self.context.clone(),
            history: self.history.clone(),
        }
    }

    fn set_state(&self, state: GovernorState) {
        if let Ok(mut ctx) = self.context.write() {
            ctx.state = state;
        }
    }

    /// Run one cycle.
    ///
    /// The shutdown signal is checked between phases; a cancelled cycle
    /// returns `None` and records nothing. Respond always runs to completion
    /// once started.
    pub async fn run_cycle(&mut self, shutdown: &watch::Receiver<bool>) -> Result<Option<PsrlvCycle>> {
        let limit = bounded(self.validate_timeout);
        if *shutdown.borrow() {
            return Ok(None);
        }

        let observation = match time::timeout(limit, self.strategy.probe()).await {
            Ok(Ok(observation)) => observation,
            Ok(Err(e)) => {
                warn!("Governor {} probe failed: {}", self.id, e);
                let cycle = self.finish(
                    format!("probe failed: {}", e),
                    Severity::Critical,
                    ResponseOutcome::NoOp,
                    String::new(),
                    ValidationOutcome::Skipped,
                )?;
                return Ok(Some(cycle));
            }
            Err(_) => {
                warn!("Governor {} probe timed out after {:?}", self.id, limit);
                let cycle = self.finish(
                    "probe timed out".to_string(),
                    Severity::Critical,
                    ResponseOutcome::NoOp,
                    String::new(),
                    ValidationOutcome::TimedOut,
                )?;
                return Ok(Some(cycle));
            }
        };
        if *shutdown.borrow() {
            return Ok(None);
        }

        let sensed = self.strategy.sense(&observation);
        if *shutdown.borrow() {
            return Ok(None);
        }

        let response = match sensed.action {
            Some(action) => self.strategy.respond(action).await,
            None => ResponseOutcome::NoOp,
        };
        let learned = self.strategy.learn(&observation, sensed.severity, &response);

        let validation = if *shutdown.borrow() {
            ValidationOutcome::Skipped
        } else {
            match time::timeout(limit, self.strategy.validate()).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => ValidationOutcome::Failed(e.to_string()),
                Err(_) => {
                    warn!("Governor {} validation timed out after {:?}", self.id, limit);
                    ValidationOutcome::TimedOut
                }
            }
        };

        let cycle = self.finish(sensed.summary, sensed.severity, response, learned, validation)?;
        Ok(Some(cycle))
    }

    fn finish(
        &self,
        probe: String,
        severity: Severity,
        response: ResponseOutcome,
        learned: String,
        validation: ValidationOutcome,
    ) -> Result<PsrlvCycle> {
        let mut cycle = PsrlvCycle {
            seq: 0,
            governor: self.id.clone(),
            role: self.strategy.role(),
            scope: self.strategy.scope(),
            probe,
            severity,
            response,
            learned,
            validation,
            timestamp: chrono::Utc::now(),
        };
        cycle.seq = self.history.record(cycle.clone())?;

        let mut ctx = self
            .context
            .write()
            .map_err(|_| CoreError::runtime("Failed to acquire write lock on governor context"))?;
        ctx.cycles += 1;
        ctx.scope = cycle.scope.clone();
        ctx.last_severity = Some(cycle.severity);
        ctx.last_outcome = Some(cycle.validation.clone());
        ctx.last_cycle_at = Some(cycle.timestamp);
        ctx.model = self.strategy.model_summary();

        debug!(
            "Governor {} cycle {}: {:?}, {}, {:?}",
            self.id, cycle.seq, cycle.severity, cycle.response, cycle.validation
        );
        Ok(cycle)
    }

    /// Run cycles on the governor's interval until `shutdown` turns true
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> GovernorHandle {
        let handle_context = self.context.clone();
        let history = self.history.clone();
        let id = self.id.clone();
        let role = self.strategy.role();
        let phase_signal = shutdown.clone();
        let span = component_span(&role.to_string(), Some(&id.to_string()));

        let task = tokio::spawn(async move {
            self.set_state(GovernorState::Running);
            info!("Governor {} ({}) started", self.id, self.strategy.role());

            let mut ticker = time::interval(self.interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_cycle(&phase_signal).await {
                            warn!("Governor {} cycle failed: {}", self.id, e);
                        }
                    }
                }
            }

            self.set_state(GovernorState::Stopped);
            info!("Governor {} stopped", self.id);
        }
        .instrument(span));

        GovernorHandle {
            id,
            role,
            context: handle_context,
            history,
            task,
        }
    }
}

fn read_context(context: &SharedContext) -> Result<GovernorContext> {
    Ok(context
        .read()
        .map_err(|_| CoreError::runtime("Failed to acquire read lock on governor context"))?
        .clone())
}

/// Handle to a running governor
#[derive(Debug)]
pub struct GovernorHandle {
    id: GovernorId,
    role: Role,
    context: SharedContext,
    history: CycleHistory,
    task: JoinHandle<()>,
}

impl GovernorHandle {
    /// Governor id
    pub fn id(&self) -> &GovernorId {
        &self.id
    }

    /// Role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Context snapshot
    pub fn context(&self) -> Result<GovernorContext> {
        read_context(&self.context)
    }

    /// Cycle history
    pub fn history(&self) -> &CycleHistory {
        &self.history
    }

    /// Whether the task has ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to end, aborting it after `grace`
    pub async fn join(self, grace: Duration) -> Result<()> {
        let GovernorHandle { id, mut task, .. } = self;
        match time::timeout(bounded(grace), &mut task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(crate::error::Error::governor(format!(
                "Governor {} task failed: {}",
                id, e
            ))),
            Err(_) => {
                task.abort();
                warn!("Governor {} did not stop within {:?}; aborted", id, grace);
                Ok(())
            }
        }
    }
}

/// Read-only view of a governor's context and history
#[derive(Debug, Clone)]
pub struct GovernorView {
    id: GovernorId,
    role: Role,
    context: SharedContext,
    history: CycleHistory,
}

impl GovernorView {
    /// Governor id
    pub fn id(&self) -> &GovernorId {
        &self.id
    }

    /// Role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Context snapshot
    pub fn context(&self) -> Result<GovernorContext> {
        read_context(&self.context)
    }

    /// Cycle history
    pub fn history(&self) -> &CycleHistory {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Scripted {
        probe_delay: Duration,
        validate_delay: Duration,
        severity: Option<Severity>,
        responses: Arc<AtomicUsize>,
        fail_probe: bool,
    }

    #[async_trait]
    impl ControlStrategy for Scripted {
        type Observation = u32;
        type Action = ();

        fn role(&self) -> Role {
            Role::Coordination
        }

        fn scope(&self) -> String {
            "test".to_string()
        }

        async fn probe(&mut self) -> Result<u32> {
            time::sleep(self.probe_delay).await;
            if self.fail_probe {
                return Err(crate::error::Error::governor("unreachable"));
            }
            Ok(7)
        }

        fn sense(&mut self, observation: &u32) -> Sensed<()> {
            match self.severity {
                Some(severity) => Sensed::act(severity, format!("saw {}", observation), ()),
                None => Sensed::nominal(format!("saw {}", observation)),
            }
        }

        async fn respond(&mut self, _: ()) -> ResponseOutcome {
            self.responses.fetch_add(1, Ordering::SeqCst);
            ResponseOutcome::Executed("nudged".to_string())
        }

        fn learn(&mut self, _: &u32, _: Severity, _: &ResponseOutcome) -> String {
            "+1".to_string()
        }

        async fn validate(&mut self) -> Result<ValidationOutcome> {
            time::sleep(self.validate_delay).await;
            Ok(ValidationOutcome::Passed)
        }

        fn model_summary(&self) -> String {
            "scripted".to_string()
        }
    }

    fn governor(strategy: Scripted, validate_timeout: Duration) -> Governor<Scripted> {
        Governor::new(
            GovernorId::from_string("g"),
            strategy,
            Duration::from_millis(10),
            validate_timeout,
            CycleHistory::new(16),
        )
    }

    #[test]
    fn test_levels_follow_roles() {
        let levels: Vec<u8> = [
            Role::Operational,
            Role::Coordination,
            Role::Management,
            Role::Intelligence,
            Role::Meta,
        ]
        .iter()
        .map(Role::level)
        .collect();
        assert_eq!(levels, vec![1, 2, 3, 4, 5]);
        assert_eq!(Role::Management.to_string(), "system3");
    }

    #[tokio::test]
    async fn test_cycle_records_every_phase() -> Result<()> {
        let (_tx, rx) = watch::channel(false);
        let mut g = governor(
            Scripted {
                severity: Some(Severity::Minor),
                ..Scripted::default()
            },
            Duration::from_secs(1),
        );

        let cycle = g.run_cycle(&rx).await?.expect("cycle ran");
        assert_eq!(cycle.seq, 1);
        assert_eq!(cycle.probe, "saw 7");
        assert_eq!(cycle.response, ResponseOutcome::Executed("nudged".into()));
        assert_eq!(cycle.learned, "+1");
        assert_eq!(cycle.validation, ValidationOutcome::Passed);

        let ctx = g.context()?;
        assert_eq!(ctx.level, 2);
        assert_eq!(ctx.cycles, 1);
        assert_eq!(ctx.model, "scripted");
        assert_eq!(g.history().len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_timeout_is_recorded() -> Result<()> {
        let (_tx, rx) = watch::channel(false);
        let mut g = governor(
            Scripted {
                validate_delay: Duration::from_secs(60),
                ..Scripted::default()
            },
            Duration::from_millis(50),
        );

        let cycle = g.run_cycle(&rx).await?.expect("cycle ran");
        assert_eq!(cycle.validation, ValidationOutcome::TimedOut);
        assert!(cycle.is_failure());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_timeout_respects_hard_ceiling() -> Result<()> {
        let (_tx, rx) = watch::channel(false);
        let mut g = governor(
            Scripted {
                validate_delay: Duration::from_secs(31),
                ..Scripted::default()
            },
            Duration::from_secs(3600),
        );

        let started = time::Instant::now();
        let cycle = g.run_cycle(&rx).await?.expect("cycle ran");
        assert_eq!(cycle.validation, ValidationOutcome::TimedOut);
        assert!(started.elapsed() <= Duration::from_secs(31));
        Ok(())
    }

    #[tokio::test]
    async fn test_probe_failure_is_critical() -> Result<()> {
        let (_tx, rx) = watch::channel(false);
        let mut g = governor(
            Scripted {
                fail_probe: true,
                ..Scripted::default()
            },
            Duration::from_secs(1),
        );

        let cycle = g.run_cycle(&rx).await?.expect("cycle ran");
        assert_eq!(cycle.severity, Severity::Critical);
        assert_eq!(cycle.validation, ValidationOutcome::Skipped);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_between_phases_skips_respond() -> Result<()> {
        let (tx, rx) = watch::channel(false);
        let responses = Arc::new(AtomicUsize::new(0));
        let mut g = governor(
            Scripted {
                probe_delay: Duration::from_millis(100),
                severity: Some(Severity::Major),
                responses: responses.clone(),
                ..Scripted::default()
            },
            Duration::from_secs(1),
        );

        let cycle = tokio::join!(g.run_cycle(&rx), async {
            time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
        })
        .0?;

        assert!(cycle.is_none());
        assert_eq!(responses.load(Ordering::SeqCst), 0);
        assert!(g.history().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_spawned_governor_stops_on_signal() -> Result<()> {
        let (tx, rx) = watch::channel(false);
        let handle = governor(Scripted::default(), Duration::from_secs(1)).spawn(rx);

        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.context()?.state, GovernorState::Running);
        assert!(!handle.history().is_empty());

        tx.send(true).map_err(|e| crate::error::Error::governor(e.to_string()))?;
        let context = handle.context.clone();
        handle.join(Duration::from_secs(1)).await?;
        assert_eq!(read_context(&context)?.state, GovernorState::Stopped);
        Ok(())
    }
}
