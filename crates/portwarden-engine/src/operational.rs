/*!
 * Operational level (System1).
 *
 * One governor per port. Its strategy keeps the port open with the desired
 * options: it reopens a closed or failed port, flushes after new errors,
 * requests a reconfiguration when the live options drifted, and executes
 * recovery directives sent by System3. It never changes policy.
 *
 * Every action goes through the [`PortService`] with the governor's own
 * token, so a revoked or rate-limited governor is refused like any other
 * caller.
 */
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use portwarden_core::types::{Id, Timestamp};
use portwarden_devices::{PortMetrics, PortOptions, PortOptionsPatch, PortStateMachine, PortStatus};
use portwarden_security::TokenPair;

use crate::error::{Error, Result};
use crate::governor::{ControlStrategy, GovernorId, Role, Sensed};
use crate::psrlv::{CycleHistory, ResponseOutcome, Severity, ValidationOutcome};
use crate::service::PortService;

/// Capacity of the System3 to System1 directive channel
pub const DIRECTIVE_CAPACITY: usize = 1;

/// Order from System3 to close and reopen a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryDirective {
    /// Recovery attempt this directive belongs to, from 1
    pub attempt: u32,
    /// Pause between close and reopen in milliseconds
    pub backoff_ms: u64,
    /// When System3 issued it
    pub issued_at: Timestamp,
}

impl RecoveryDirective {
    /// Create a directive stamped now
    pub fn new(attempt: u32, backoff: Duration) -> Self {
        Self {
            attempt,
            backoff_ms: u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            issued_at: chrono::Utc::now(),
        }
    }

    /// Pause between close and reopen
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Bounded directive channel; a pending directive subsumes later ones
pub fn directive_channel() -> (mpsc::Sender<RecoveryDirective>, mpsc::Receiver<RecoveryDirective>) {
    mpsc::channel(DIRECTIVE_CAPACITY)
}

/// What the upper levels know about one System1 governor
#[derive(Debug, Clone)]
pub struct RosterEntry {
    /// Port it controls
    pub port: Id,
    /// Its cycle history
    pub history: CycleHistory,
    /// Where System3 sends its directives
    pub directives: mpsc::Sender<RecoveryDirective>,
}

/// Registry of System1 governors shared with the upper levels
#[derive(Debug, Clone, Default)]
pub struct Roster(Arc<RwLock<BTreeMap<GovernorId, RosterEntry>>>);

impl Roster {
    /// Create an empty roster
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a governor
    pub fn insert(&self, governor: GovernorId, entry: RosterEntry) -> Result<()> {
        let mut roster = self
            .0
            .write()
            .map_err(|_| Error::governor("Failed to acquire write lock on roster"))?;
        if roster.contains_key(&governor) {
            return Err(Error::already_exists(format!("Governor {} already exists", governor)));
        }
        roster.insert(governor, entry);
        Ok(())
    }

    /// Remove a governor
    pub fn remove(&self, governor: &GovernorId) -> Result<Option<RosterEntry>> {
        let mut roster = self
            .0
            .write()
            .map_err(|_| Error::governor("Failed to acquire write lock on roster"))?;
        Ok(roster.remove(governor))
    }

    /// Look up a governor
    pub fn get(&self, governor: &GovernorId) -> Result<Option<RosterEntry>> {
        let roster = self
            .0
            .read()
            .map_err(|_| Error::governor("Failed to acquire read lock on roster"))?;
        Ok(roster.get(governor).cloned())
    }

    /// All governors, ordered by id
    pub fn entries(&self) -> Result<Vec<(GovernorId, RosterEntry)>> {
        let roster = self
            .0
            .read()
            .map_err(|_| Error::governor("Failed to acquire read lock on roster"))?;
        Ok(roster.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Number of governors
    pub fn len(&self) -> usize {
        self.0.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether the roster is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Token a System1 governor presents, renewed at half its lifetime
#[derive(Debug, Clone)]
struct Credential {
    token: String,
    expires_at: Timestamp,
    lifetime: chrono::Duration,
}

impl Credential {
    fn from_pair(pair: &TokenPair) -> Self {
        Self {
            token: pair.local_token.clone(),
            expires_at: pair.expires_at,
            lifetime: pair.expires_at - pair.created_at,
        }
    }

    fn renewal_due(&self, now: Timestamp) -> bool {
        now >= self.expires_at - self.lifetime / 2
    }
}

/// Corrective actions available to System1
#[derive(Debug, Clone, PartialEq)]
pub enum OperationalAction {
    /// Open with the desired options
    RetryOpen,
    /// Discard transport buffers
    Flush,
    /// Bring the live options back to the desired ones
    Reconfigure(PortOptionsPatch),
    /// Close, wait, reopen
    Recover(RecoveryDirective),
}

/// What System1 sees each cycle
#[derive(Debug, Clone)]
pub struct OperationalObservation {
    /// Port status
    pub status: PortStatus,
    /// Live options
    pub options: Arc<PortOptions>,
    /// Port counters
    pub metrics: PortMetrics,
    /// Directive received from System3, if any
    pub directive: Option<RecoveryDirective>,
}

#[derive(Debug, Default)]
struct OperationalModel {
    opens: u64,
    flushes: u64,
    reconfigures: u64,
    recoveries: u64,
    denials: u64,
    failure_ema: f64,
}

/// System1 strategy for one port
#[derive(Debug)]
pub struct OperationalStrategy {
    port: Arc<PortStateMachine>,
    service: Arc<PortService>,
    credential: Credential,
    desired: PortOptions,
    directives: mpsc::Receiver<RecoveryDirective>,
    seen_errors: u64,
    model: OperationalModel,
}

impl OperationalStrategy {
    /// Create the strategy for `port`, acting with `credentials`
    pub fn new(
        port: Arc<PortStateMachine>,
        service: Arc<PortService>,
        credentials: &TokenPair,
        desired: PortOptions,
        directives: mpsc::Receiver<RecoveryDirective>,
    ) -> Self {
        Self {
            port,
            service,
            credential: Credential::from_pair(credentials),
            desired,
            directives,
            seen_errors: 0,
            model: OperationalModel::default(),
        }
    }

    /// Port id
    pub fn port_id(&self) -> &Id {
        self.port.id()
    }

    /// Options the governor maintains
    pub fn desired(&self) -> &PortOptions {
        &self.desired
    }

    fn drift(&self, live: &PortOptions) -> Option<PortOptionsPatch> {
        if *live == self.desired {
            return None;
        }
        let d = &self.desired;
        Some(PortOptionsPatch {
            baud_rate: Some(d.baud_rate),
            data_bits: Some(d.data_bits),
            parity: Some(d.parity),
            stop_bits: Some(d.stop_bits),
            flow_control: Some(d.flow_control),
            rs485: Some(d.rs485.clone()),
            write_policy: Some(d.write_policy),
            drain_timeout_ms: Some(d.drain_timeout_ms),
        })
    }

    fn renew_if_due(&mut self) {
        if !self.credential.renewal_due(chrono::Utc::now()) {
            return;
        }
        match self.service.security().renew_token(&self.credential.token) {
            Ok(pair) => {
                debug!("Renewed credentials for {} until {}", self.port.id(), pair.expires_at);
                self.credential.expires_at = pair.expires_at;
            }
            Err(e) => warn!("Credential renewal for {} failed: {}", self.port.id(), e),
        }
    }

    async fn recover(&self, directive: &RecoveryDirective) -> Result<String> {
        let token = Some(self.credential.token.as_str());
        let id = self.port.id();
        if let Err(e) = self.service.close(token, id).await {
            if e.is_denied() {
                return Err(e);
            }
            warn!("Close before recovery of {} failed: {}", id, e);
        }
        tokio::time::sleep(directive.backoff()).await;
        self.service.open(token, id, self.desired.clone()).await?;
        Ok(format!(
            "recovered on attempt {} after {:?}",
            directive.attempt,
            directive.backoff()
        ))
    }
}

#[async_trait]
impl ControlStrategy for OperationalStrategy {
    type Observation = OperationalObservation;
    type Action = OperationalAction;

    fn role(&self) -> Role {
        Role::Operational
    }

    fn scope(&self) -> String {
        format!("port {}", self.port.id())
    }

    async fn probe(&mut self) -> Result<OperationalObservation> {
        self.renew_if_due();
        let directive = match self.directives.try_recv() {
            Ok(directive) => Some(directive),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        };
        Ok(OperationalObservation {
            status: self.port.status()?,
            options: self.port.options()?,
            metrics: self.port.metrics()?,
            directive,
        })
    }

    fn sense(&mut self, observation: &OperationalObservation) -> Sensed<OperationalAction> {
        let new_errors = observation.metrics.errors.saturating_sub(self.seen_errors);
        self.seen_errors = observation.metrics.errors;
        let summary = format!(
            "{} at {} baud, {} new errors",
            observation.status, observation.options.baud_rate, new_errors
        );

        if let Some(directive) = &observation.directive {
            return Sensed::act(
                Severity::Major,
                summary,
                OperationalAction::Recover(directive.clone()),
            );
        }

        match observation.status {
            PortStatus::Blocked => Sensed::observe(Severity::Critical, summary),
            PortStatus::Error => Sensed::act(Severity::Major, summary, OperationalAction::RetryOpen),
            PortStatus::Closed => Sensed::act(Severity::Minor, summary, OperationalAction::RetryOpen),
            PortStatus::Open if new_errors > 0 => {
                Sensed::act(Severity::Minor, summary, OperationalAction::Flush)
            }
            PortStatus::Open => match self.drift(&observation.options) {
                Some(patch) => {
                    Sensed::act(Severity::Minor, summary, OperationalAction::Reconfigure(patch))
                }
                None => Sensed::nominal(summary),
            },
            _ => Sensed::nominal(summary),
        }
    }

    async fn respond(&mut self, action: OperationalAction) -> ResponseOutcome {
        let token = Some(self.credential.token.as_str());
        let id = self.port.id();
        let result = match &action {
            OperationalAction::RetryOpen => self
                .service
                .open(token, id, self.desired.clone())
                .await
                .map(|_| "opened".to_string()),
            OperationalAction::Flush => self
                .service
                .flush(token, id)
                .await
                .map(|_| "flushed".to_string()),
            OperationalAction::Reconfigure(patch) => self
                .service
                .update_options(token, id, patch)
                .await
                .map(|options| format!("reconfigured to {} baud", options.baud_rate)),
            OperationalAction::Recover(directive) => self.recover(directive).await,
        };

        match result {
            Ok(detail) => {
                match action {
                    OperationalAction::RetryOpen => self.model.opens += 1,
                    OperationalAction::Flush => self.model.flushes += 1,
                    OperationalAction::Reconfigure(_) => self.model.reconfigures += 1,
                    OperationalAction::Recover(_) => {
                        self.model.recoveries += 1;
                        info!("Port {} {}", id, detail);
                    }
                }
                ResponseOutcome::Executed(detail)
            }
            Err(e) if e.is_denied() => {
                self.model.denials += 1;
                ResponseOutcome::Denied(e.to_string())
            }
            Err(e) => ResponseOutcome::Failed(e.to_string()),
        }
    }

    fn learn(&mut self, _: &OperationalObservation, severity: Severity, outcome: &ResponseOutcome) -> String {
        let failed = severity >= Severity::Major || outcome.is_failure();
        let before = self.model.failure_ema;
        self.model.failure_ema = 0.8 * before + if failed { 0.2 } else { 0.0 };
        format!("failure ema {:.2} -> {:.2}", before, self.model.failure_ema)
    }

    async fn validate(&mut self) -> Result<ValidationOutcome> {
        Ok(match self.port.status()? {
            PortStatus::Open => ValidationOutcome::Passed,
            other => ValidationOutcome::Failed(format!("port is {}", other)),
        })
    }

    fn model_summary(&self) -> String {
        format!(
            "{} opens, {} flushes, {} reconfigures, {} recoveries, {} denials, failure ema {:.2}",
            self.model.opens,
            self.model.flushes,
            self.model.reconfigures,
            self.model.recoveries,
            self.model.denials,
            self.model.failure_ema
        )
    }
}
