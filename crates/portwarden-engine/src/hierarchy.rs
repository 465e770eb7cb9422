/*!
 * The governance supervisor.
 *
 * [`Governance`] owns the port registry, the security governor, the shared
 * parameter store and the five levels of governors. Ports are added with
 * their transport; each gets a System1 governor holding its own token pair.
 * [`Governance::start`] checks the network boundary before anything runs,
 * then spawns every governor. [`Governance::shutdown`] stops them, closes
 * the ports and revokes the governors' tokens.
 */
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use portwarden_core::config::SharedConfig;
use portwarden_core::event::SharedEventBus;
use portwarden_core::logging::component_span;
use portwarden_core::types::Id;
use portwarden_devices::{
    CapabilityProvider, GpioLine, PortInfo, PortOptions, PortStateMachine, PortStatus,
    RegistryEvent, SerialTransport, SharedPortRegistry,
};
use portwarden_security::{
    BindPermit, NetworkBoundary, SecurityEvent, SecurityEventKind, SecurityGovernor,
    SecurityLevel, ThreatAssessment, ThreatLevel, TokenPair, TokenPermissions,
};

use crate::coordination::{ArbiterPolicy, CoordinationStrategy, ResourceArbiter};
use crate::error::{Error, Result};
use crate::governor::{Governor, GovernorContext, GovernorHandle, GovernorId, GovernorView};
use crate::intelligence::{IntelligenceStrategy, Recommendation, RECOMMENDATION_CAPACITY};
use crate::management::ManagementStrategy;
use crate::meta::{GovernanceParameters, MetaStrategy, ParameterStore};
use crate::operational::{directive_channel, OperationalStrategy, Roster, RosterEntry};
use crate::psrlv::{CycleHistory, PsrlvCycle};
use crate::service::PortService;

type Launch = Box<dyn FnOnce(watch::Receiver<bool>) -> GovernorHandle + Send>;

enum Slot {
    Pending(Launch),
    Running(GovernorHandle),
}

struct Supervised {
    view: GovernorView,
    stop: watch::Sender<bool>,
    slot: Slot,
}

impl Supervised {
    fn new<S: crate::governor::ControlStrategy>(governor: Governor<S>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            view: governor.view(),
            stop,
            slot: Slot::Pending(Box::new(move |signal| governor.spawn(signal))),
        }
    }

    fn launch(self) -> Self {
        let slot = match self.slot {
            Slot::Pending(launch) => Slot::Running(launch(self.stop.subscribe())),
            running => running,
        };
        Self { slot, ..self }
    }

    async fn stop(self, grace: Duration) {
        // No receiver yet means it never ran
        let _ = self.stop.send(true);
        if let Slot::Running(handle) = self.slot {
            if let Err(e) = handle.join(grace).await {
                warn!("{}", e);
            }
        }
    }
}

/// Status of one port as reported by [`Governance::health`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortHealth {
    /// Port id
    pub port: Id,
    /// Lifecycle state
    pub status: PortStatus,
    /// Failed operations so far
    pub errors: u64,
}

/// Introspection snapshot of the whole hierarchy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceHealth {
    /// Every governor, System1 first
    pub governors: Vec<GovernorContext>,
    /// Every port
    pub ports: Vec<PortHealth>,
    /// Live governance parameters
    pub parameters: GovernanceParameters,
    /// Current threat view
    pub threat: ThreatAssessment,
}

/// Supervisor of the governor hierarchy
pub struct Governance {
    config: SharedConfig,
    capabilities: Arc<dyn CapabilityProvider>,
    events: SharedEventBus,
    registry: SharedPortRegistry,
    security: Arc<SecurityGovernor>,
    service: Arc<PortService>,
    arbiter: Arc<ResourceArbiter>,
    parameters: Arc<ParameterStore>,
    roster: Roster,
    recommendations: broadcast::Sender<Recommendation>,
    governors: Mutex<Vec<Supervised>>,
    credentials: Mutex<HashMap<Id, TokenPair>>,
    housekeeping_task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for Governance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governance")
            .field("ports", &self.roster.len())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

impl Governance {
    /// Build the hierarchy from configuration
    pub fn new(config: SharedConfig, capabilities: Arc<dyn CapabilityProvider>) -> Result<Self> {
        let cfg = config.get();
        let events = SharedEventBus::new();
        let registry = SharedPortRegistry::new();
        let security = Arc::new(SecurityGovernor::new(&cfg.security)?);
        let roster = Roster::new();

        let parameters = Arc::new(ParameterStore::new(
            GovernanceParameters::from_config(&cfg.governance),
            roster.clone(),
            security.clone(),
            events.clone(),
        )?);
        let snapshot = parameters.snapshot();
        let arbiter = Arc::new(ResourceArbiter::new(ArbiterPolicy {
            strategy: snapshot.strategy,
            starvation: snapshot.starvation(),
        }));
        let service = Arc::new(
            PortService::new(
                registry.clone(),
                security.clone(),
                cfg.security.authorization_timeout(),
            )
            .with_arbiter(arbiter.clone(), cfg.governance.system2.grant_timeout()),
        );
        let (recommendations, _) = broadcast::channel(RECOMMENDATION_CAPACITY);

        Ok(Self {
            config,
            capabilities,
            events,
            registry,
            security,
            service,
            arbiter,
            parameters,
            roster,
            recommendations,
            governors: Mutex::new(Vec::new()),
            credentials: Mutex::new(HashMap::new()),
            housekeeping_task: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Authorized port access
    pub fn service(&self) -> &Arc<PortService> {
        &self.service
    }

    /// Security governor
    pub fn security(&self) -> &Arc<SecurityGovernor> {
        &self.security
    }

    /// Parameter store
    pub fn parameters(&self) -> &Arc<ParameterStore> {
        &self.parameters
    }

    /// Resource arbiter
    pub fn arbiter(&self) -> &Arc<ResourceArbiter> {
        &self.arbiter
    }

    /// Event bus carrying port and governance events
    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    /// Port registry
    pub fn registry(&self) -> &SharedPortRegistry {
        &self.registry
    }

    /// Live recommendation feed
    pub fn recommendations(&self) -> broadcast::Receiver<Recommendation> {
        self.recommendations.subscribe()
    }

    fn supervised(&self) -> Result<MutexGuard<'_, Vec<Supervised>>> {
        self.governors
            .lock()
            .map_err(|_| Error::governor("Failed to lock governor table"))
    }

    fn credentials(&self) -> Result<MutexGuard<'_, HashMap<Id, TokenPair>>> {
        self.credentials
            .lock()
            .map_err(|_| Error::governor("Failed to lock credential table"))
    }

    fn supervise(&self, supervised: Supervised) -> Result<()> {
        // `started` only flips under the table lock
        let mut governors = self.supervised()?;
        let supervised = if self.started.load(Ordering::SeqCst) {
            supervised.launch()
        } else {
            supervised
        };
        governors.push(supervised);
        Ok(())
    }

    /// Register a port and give it a System1 governor.
    ///
    /// `desired` is checked against the port's effective capabilities up
    /// front; `priority` orders the port on shared buses (lower wins).
    pub fn add_port(
        &self,
        info: PortInfo,
        transport: Arc<dyn SerialTransport>,
        gpio: Option<Arc<dyn GpioLine>>,
        desired: PortOptions,
        priority: u32,
    ) -> Result<GovernorId> {
        let cfg = self.config.get();
        let caps = self
            .capabilities
            .effective_capabilities(&info.path)
            .ok_or_else(|| Error::not_found(format!("No capabilities for {}", info.path)))?;
        desired.validate(info.port_type, &caps)?;

        let port_id = info.id.clone();
        let mut machine = PortStateMachine::new(info, caps, transport, self.events.clone());
        if let Some(line) = gpio {
            machine = machine.with_gpio(line);
        }
        let port = self.registry.registry().register(machine)?;

        let pair = self.security.generate_token_pair(
            TokenPermissions::full(port_id.clone()).with_level(SecurityLevel::Elevated),
            None,
        )?;
        self.arbiter.set_priority(&port_id, priority)?;

        let gid = GovernorId::for_port(&port_id);
        let history = CycleHistory::new(cfg.governance.system1.history_capacity);
        let (tx, rx) = directive_channel();
        self.roster.insert(
            gid.clone(),
            RosterEntry {
                port: port_id.clone(),
                history: history.clone(),
                directives: tx,
            },
        )?;

        let strategy = OperationalStrategy::new(port, self.service.clone(), &pair, desired, rx);
        let governor = Governor::new(
            gid.clone(),
            strategy,
            cfg.governance.system1.probe_interval(),
            cfg.governance.system1.validate_timeout(),
            history,
        );
        self.credentials()?.insert(port_id.clone(), pair);
        self.supervise(Supervised::new(governor))?;

        info!("Added port {} under {}", port_id, gid);
        Ok(gid)
    }

    /// Stop a port's governor, close the port and unregister it
    pub async fn remove_port(&self, port_id: &Id, grace: Duration) -> Result<()> {
        let gid = GovernorId::for_port(port_id);
        let supervised = {
            let mut governors = self.supervised()?;
            let index = governors
                .iter()
                .position(|s| s.view.id() == &gid)
                .ok_or_else(|| Error::not_found(format!("Governor {} not found", gid)))?;
            governors.remove(index)
        };
        supervised.stop(grace).await;
        self.roster.remove(&gid)?;

        let pair = self.credentials()?.remove(port_id);
        if let Some(pair) = pair {
            self.retire(port_id, &pair).await;
        }
        self.registry.registry().remove(port_id)?;
        info!("Removed port {}", port_id);
        Ok(())
    }

    async fn retire(&self, port_id: &Id, pair: &TokenPair) {
        if let Err(e) = self.service.close(Some(&pair.local_token), port_id).await {
            warn!("Failed to close {}: {}", port_id, e);
        }
        if let Err(e) = self.security.revoke_token(&pair.local_token) {
            warn!("Failed to revoke credentials of {}: {}", port_id, e);
        }
    }

    /// Check the network boundary, then spawn every governor.
    ///
    /// A boundary violation is returned as an error and nothing starts.
    pub async fn start(&self) -> Result<BindPermit> {
        if self.started.load(Ordering::SeqCst) {
            return Err(Error::already_exists("Governance already started"));
        }
        let cfg = self.config.get();
        let permit = NetworkBoundary::enforce(&cfg.network, &self.security)?;

        let s2 = Governor::new(
            GovernorId::from_string("system2"),
            CoordinationStrategy::new(self.arbiter.clone(), self.parameters.clone()),
            cfg.governance.system2.cycle_interval(),
            cfg.governance.system1.validate_timeout(),
            CycleHistory::new(cfg.governance.system1.history_capacity),
        );
        let s3 = Governor::new(
            GovernorId::from_string("system3"),
            ManagementStrategy::new(
                self.roster.clone(),
                self.parameters.clone(),
                self.events.clone(),
                self.recommendations.subscribe(),
            ),
            cfg.governance.system3.health_check_interval(),
            cfg.governance.system1.validate_timeout(),
            CycleHistory::new(cfg.governance.system1.history_capacity),
        );
        let s4 = Governor::new(
            GovernorId::from_string("system4"),
            IntelligenceStrategy::new(
                self.roster.clone(),
                self.parameters.clone(),
                self.recommendations.clone(),
            )
            .with_arbiter(self.arbiter.clone()),
            cfg.governance.system4.analysis_interval(),
            cfg.governance.system1.validate_timeout(),
            CycleHistory::new(cfg.governance.system1.history_capacity),
        );
        let s5 = Governor::new(
            GovernorId::from_string("system5"),
            MetaStrategy::new(self.parameters.clone(), self.recommendations.subscribe()),
            cfg.governance.system5.reporting_interval(),
            cfg.governance.system1.validate_timeout(),
            CycleHistory::new(cfg.governance.system1.history_capacity),
        );

        let count = {
            let mut governors = self.supervised()?;
            governors.push(Supervised::new(s2));
            governors.push(Supervised::new(s3));
            governors.push(Supervised::new(s4));
            governors.push(Supervised::new(s5));
            let launched: Vec<Supervised> = governors.drain(..).map(Supervised::launch).collect();
            *governors = launched;
            self.started.store(true, Ordering::SeqCst);
            governors.len()
        };

        let housekeeping = self.housekeeping(cfg.governance.system3.health_check_interval());
        if let Ok(mut slot) = self.housekeeping_task.lock() {
            *slot = Some(housekeeping);
        }

        info!("Governance started with {} governors; listener permitted on {}", count, permit);
        Ok(permit)
    }

    /// Audit registry changes, sweep expired tokens and idle rate-limit
    /// peers, and lift blocks whose blacklist has run out, until aborted
    fn housekeeping(&self, sweep_every: Duration) -> JoinHandle<()> {
        let mut events = self.registry.registry().subscribe();
        let security = self.security.clone();
        let service = self.service.clone();
        tokio::spawn(
            async move {
                let mut sweep = tokio::time::interval(sweep_every.max(Duration::from_millis(1)));
                sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        received = events.recv() => {
                            let event = match received {
                                Ok(RegistryEvent::PortAdded(info)) => SecurityEvent::new(
                                    SecurityEventKind::DeviceChange,
                                    ThreatLevel::Low,
                                    format!("added {} at {}", info.id, info.path),
                                )
                                .with_port(info.id),
                                Ok(RegistryEvent::PortRemoved(id)) => SecurityEvent::new(
                                    SecurityEventKind::DeviceChange,
                                    ThreatLevel::Low,
                                    format!("removed {}", id),
                                )
                                .with_port(id),
                                Err(broadcast::error::RecvError::Lagged(n)) => {
                                    warn!("Missed {} registry events", n);
                                    continue;
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                            };
                            security.record(event);
                        }
                        _ = sweep.tick() => {
                            match security.sweep_expired() {
                                Ok(0) => {}
                                Ok(n) => debug!("Swept {} expired token pairs", n),
                                Err(e) => warn!("Token sweep failed: {}", e),
                            }
                            security.sweep_rate_limits();
                            service.lift_expired_blocks();
                        }
                    }
                }
                debug!("Housekeeping ended");
            }
            .instrument(component_span("housekeeping", None)),
        )
    }

    /// Stop every governor, close every port and revoke governor tokens.
    ///
    /// Ports stay registered but closed. The instance is not meant to be
    /// started again.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        info!("Shutting down governance");
        let governors: Vec<Supervised> = {
            let mut table = self.supervised()?;
            self.started.store(false, Ordering::SeqCst);
            table.drain(..).collect()
        };
        let stopped = governors.len();
        for supervised in governors {
            supervised.stop(grace).await;
        }

        if let Ok(mut slot) = self.housekeeping_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }

        let credentials: Vec<(Id, TokenPair)> = self.credentials()?.drain().collect();
        for (port_id, pair) in &credentials {
            self.retire(port_id, pair).await;
        }
        info!(
            "Governance stopped: {} governors, {} ports closed",
            stopped,
            credentials.len()
        );
        Ok(())
    }

    /// Introspection snapshot
    pub fn health(&self) -> Result<GovernanceHealth> {
        let mut governors = self
            .supervised()?
            .iter()
            .map(|s| s.view.context())
            .collect::<Result<Vec<_>>>()?;
        governors.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.id.cmp(&b.id)));

        let mut ports = Vec::new();
        for port in self.registry.registry().ports()? {
            ports.push(PortHealth {
                port: port.id().clone(),
                status: port.status()?,
                errors: port.metrics()?.errors,
            });
        }
        ports.sort_by(|a, b| a.port.cmp(&b.port));

        Ok(GovernanceHealth {
            governors,
            ports,
            parameters: (*self.parameters.snapshot()).clone(),
            threat: self.security.get_threat_assessment(),
        })
    }

    /// The `limit` most recent cycles of a governor, oldest first
    pub fn history(&self, governor: &GovernorId, limit: usize) -> Result<Vec<PsrlvCycle>> {
        self.supervised()?
            .iter()
            .find(|s| s.view.id() == governor)
            .map(|s| s.view.history().recent(limit))
            .ok_or_else(|| Error::not_found(format!("Governor {} not found", governor)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::{GovernorState, Role};
    use crate::psrlv::{ResponseOutcome, ValidationOutcome};
    use portwarden_core::config::Config;
    use portwarden_devices::mock::MockTransport;
    use portwarden_devices::{
        PlatformInfo, PortCapabilities, PortType, StaticCapabilityProvider, TransportError,
    };
    use portwarden_security::SecurityError;

    fn config() -> Config {
        let mut config = Config::default();
        config.governance.system1.probe_interval_ms = 10;
        config.governance.system1.validate_timeout_ms = 50;
        config.governance.system2.cycle_interval_ms = 10;
        config.governance.system3.health_check_interval_ms = 20;
        config.governance.system4.analysis_interval_ms = 20;
        config.governance.system5.reporting_interval_ms = 20;
        config
    }

    fn governance(config: Config) -> Result<Governance> {
        let provider = StaticCapabilityProvider::new(PlatformInfo::default())
            .with_fallback(PortCapabilities::default());
        Governance::new(SharedConfig::new(config), Arc::new(provider))
    }

    #[test_log::test(tokio::test)]
    async fn test_start_opens_ports_and_shutdown_closes_them() -> Result<()> {
        let governance = governance(config())?;
        let transport = Arc::new(MockTransport::new());
        let gid = governance.add_port(
            PortInfo::new("COM1", "/dev/ttyUSB0", PortType::UsbSerial),
            transport.clone(),
            None,
            PortOptions::new(115_200),
            10,
        )?;

        let permit = governance.start().await?;
        assert!(permit.addr.ip().is_loopback());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let health = governance.health()?;
        assert_eq!(health.governors.len(), 5);
        assert_eq!(health.governors[0].role, Role::Operational);
        assert!(health.governors.iter().all(|g| g.state == GovernorState::Running));
        assert_eq!(health.ports[0].status, PortStatus::Open);

        let cycles = governance.history(&gid, 10)?;
        assert!(cycles.iter().any(|c| c.validation == ValidationOutcome::Passed));

        governance.shutdown(Duration::from_secs(1)).await?;
        assert!(!transport.is_open());
        assert!(governance
            .security()
            .get_recent_events(100)
            .iter()
            .any(|e| e.kind == SecurityEventKind::TokenRevoked));
        Ok(())
    }

    async fn wait_for(what: &str, mut done: impl FnMut() -> bool) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while !done() {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!("waiting for {}", what)));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_failing_port_gets_one_close_and_reopen_per_directive() -> Result<()> {
        let mut config = config();
        config.governance.system3.failure_threshold = 3;
        config.governance.system3.retry_attempts = 3;
        config.governance.system3.retry_delay_ms = 200;
        let governance = governance(config)?;
        let transport = Arc::new(MockTransport::new());
        let gid = governance.add_port(
            PortInfo::new("COM1", "/dev/ttyUSB0", PortType::UsbSerial),
            transport.clone(),
            None,
            PortOptions::new(115_200),
            10,
        )?;
        governance.start().await?;
        let port_id = Id::from("COM1");
        let port = governance.registry().registry().get(&port_id)?;
        wait_for("port open", || port.status().is_ok_and(|s| s == PortStatus::Open)).await?;

        let opens = transport.open_count();
        let closes = transport.close_count();

        // Every reopen fails, then a hard write error puts the port in Error
        transport.fail_opens(Some(TransportError::Io("device gone".to_string())));
        transport.fail_next_write(TransportError::Io("device gone".to_string()));
        let operator = governance
            .security()
            .generate_token_pair(TokenPermissions::full("COM1"), None)?;
        assert!(governance
            .service()
            .write(Some(&operator.local_token), &port_id, b"ping")
            .await
            .is_err());

        // System1 keeps failing to reopen until System3 orders a recovery,
        // which closes the port before its backoff
        wait_for("recovery close", || transport.close_count() > closes).await?;
        assert_eq!(transport.close_count(), closes + 1);
        assert_eq!(transport.open_count(), opens);

        // The device comes back during the backoff
        transport.fail_opens(None);
        wait_for("recovery reopen", || transport.open_count() > opens).await?;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(port.status()?, PortStatus::Open);
        assert_eq!(transport.close_count(), closes + 1);
        assert_eq!(transport.open_count(), opens + 1);

        let cycles = governance.history(&gid, 1000)?;
        let recoveries = cycles
            .iter()
            .filter(|c| {
                matches!(&c.response, ResponseOutcome::Executed(d) if d.starts_with("recovered"))
            })
            .count();
        assert_eq!(recoveries, 1);

        governance.shutdown(Duration::from_secs(1)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_public_bind_address_is_fatal() -> Result<()> {
        let mut config = config();
        config.network.bind_address = "8.8.8.8:7450".to_string();
        let governance = governance(config)?;

        let err = tokio_test::assert_err!(governance.start().await);
        assert!(matches!(
            err,
            Error::Security(SecurityError::NetworkBoundaryViolation(_))
        ));
        assert!(governance.health()?.governors.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_unsupported_options_rejected_before_registration() -> Result<()> {
        let governance = governance(config())?;
        let err = governance
            .add_port(
                PortInfo::new("COM1", "/dev/ttyUSB0", PortType::UsbSerial),
                Arc::new(MockTransport::new()),
                None,
                PortOptions::new(31_337),
                10,
            )
            .unwrap_err();

        assert!(matches!(err, Error::Port(_)));
        assert_eq!(governance.registry().registry().count()?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_port_is_audited() -> Result<()> {
        let governance = governance(config())?;
        governance.add_port(
            PortInfo::new("COM2", "/dev/ttyUSB1", PortType::UsbSerial),
            Arc::new(MockTransport::new()),
            None,
            PortOptions::default(),
            10,
        )?;
        governance.start().await?;

        governance
            .remove_port(&Id::from("COM2"), Duration::from_secs(1))
            .await?;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!governance.registry().registry().contains(&Id::from("COM2"))?);
        assert!(governance
            .security()
            .get_recent_events(100)
            .iter()
            .any(|e| e.kind == SecurityEventKind::DeviceChange));
        governance.shutdown(Duration::from_secs(1)).await?;
        Ok(())
    }
}
