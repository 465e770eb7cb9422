/*!
 * Authorized port access.
 *
 * [`PortService`] is the only path from a governor or an external caller to
 * a port's lifecycle and I/O. Every call is authorized first, within the
 * configured bound; a refusal is audited by the security governor and never
 * reaches the port.
 *
 * A rate-limit or blacklist refusal of a token bound to the port also
 * blocks the port, until that token's blacklist runs out or an
 * administrator lifts it. Callers without a valid token share one budget
 * and can never block a port.
 */
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use tracing::{debug, info, warn, Instrument};

use portwarden_core::logging::operation_span;
use portwarden_core::types::Id;
use portwarden_devices::{
    PortOptions, PortOptionsPatch, PortStateMachine, PortStatus, SharedPortRegistry,
};
use portwarden_security::{
    authorize_within, Authorizer, DenyReason, Operation, SecurityError, SecurityEvent,
    SecurityEventKind, SecurityGovernor, SecurityLevel, ThreatLevel, TokenPermissions,
};

use crate::coordination::ResourceArbiter;
use crate::error::Result;

/// Authorized front of the port registry
#[derive(Debug)]
pub struct PortService {
    registry: SharedPortRegistry,
    security: Arc<SecurityGovernor>,
    authorizer: Arc<dyn Authorizer>,
    arbiter: Option<Arc<ResourceArbiter>>,
    authorization_timeout: Duration,
    grant_timeout: Duration,
    /// Ports blocked for a rate-limited peer, with that peer's key
    blocks: Mutex<HashMap<Id, String>>,
}

impl PortService {
    /// Create a service authorizing through `security`
    pub fn new(
        registry: SharedPortRegistry,
        security: Arc<SecurityGovernor>,
        authorization_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            authorizer: security.clone(),
            security,
            arbiter: None,
            authorization_timeout,
            grant_timeout: Duration::from_secs(5),
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Authorize through a different authorizer, e.g. a remote one
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Serialize writes on shared RS-485 buses through `arbiter`
    pub fn with_arbiter(mut self, arbiter: Arc<ResourceArbiter>, grant_timeout: Duration) -> Self {
        self.arbiter = Some(arbiter);
        self.grant_timeout = grant_timeout;
        self
    }

    /// Underlying registry
    pub fn registry(&self) -> &SharedPortRegistry {
        &self.registry
    }

    /// Security governor
    pub fn security(&self) -> &Arc<SecurityGovernor> {
        &self.security
    }

    async fn gate(
        &self,
        token: Option<&str>,
        operation: Operation,
        port_id: &Id,
    ) -> Result<(Arc<PortStateMachine>, TokenPermissions)> {
        match authorize_within(
            self.authorizer.as_ref(),
            self.authorization_timeout,
            token,
            operation,
            port_id,
        )
        .instrument(operation_span(&operation.to_string(), "port-service"))
        .await
        {
            Ok(permissions) => {
                let port = self.registry.registry().get(port_id)?;
                debug!("Authorized {} on {}", operation, port_id);
                Ok((port, permissions))
            }
            Err(e) => {
                warn!("Refused {} on {}: {}", operation, port_id, e);
                if e.deny_reason().is_some_and(|r| r.is_rate_limit())
                    && self.security.is_authenticated_for(token, port_id)
                {
                    self.block_for(port_id, SecurityGovernor::peer_key(token), &e.to_string());
                }
                Err(e.into())
            }
        }
    }

    fn block_for(&self, port_id: &Id, peer: String, reason: &str) {
        let Ok(port) = self.registry.registry().get(port_id) else {
            return;
        };
        match port.block(reason) {
            Ok(()) => {
                if let Ok(mut blocks) = self.blocks.lock() {
                    blocks.insert(port_id.clone(), peer);
                }
            }
            Err(e) => warn!("Failed to block {}: {}", port_id, e),
        }
    }

    /// Unblock every port whose offending peer has served its blacklist,
    /// returning how many were lifted
    pub fn lift_expired_blocks(&self) -> usize {
        let expired: Vec<Id> = match self.blocks.lock() {
            Ok(mut blocks) => {
                let expired: Vec<Id> = blocks
                    .iter()
                    .filter(|(_, peer)| !self.security.is_blacklisted(peer))
                    .map(|(port_id, _)| port_id.clone())
                    .collect();
                for port_id in &expired {
                    blocks.remove(port_id);
                }
                expired
            }
            Err(_) => return 0,
        };

        let mut lifted = 0;
        for port_id in expired {
            let Ok(port) = self.registry.registry().get(&port_id) else {
                continue;
            };
            match port.unblock() {
                Ok(restored) => {
                    info!("Blacklist served, {} restored to {}", port_id, restored);
                    lifted += 1;
                }
                Err(e) => warn!("Failed to unblock {}: {}", port_id, e),
            }
        }
        lifted
    }

    /// Open a port
    pub async fn open(&self, token: Option<&str>, port_id: &Id, options: PortOptions) -> Result<()> {
        let (port, _) = self.gate(token, Operation::Configure, port_id).await?;
        Ok(port.open(options).await?)
    }

    /// Close a port
    pub async fn close(&self, token: Option<&str>, port_id: &Id) -> Result<()> {
        let (port, _) = self.gate(token, Operation::Configure, port_id).await?;
        Ok(port.close().await?)
    }

    /// Apply a partial option update
    pub async fn update_options(
        &self,
        token: Option<&str>,
        port_id: &Id,
        patch: &PortOptionsPatch,
    ) -> Result<Arc<PortOptions>> {
        let (port, _) = self.gate(token, Operation::Configure, port_id).await?;
        Ok(port.update_options(patch).await?)
    }

    /// Write all of `data`.
    ///
    /// A port on a shared RS-485 bus transmits only while holding the
    /// bus grant.
    pub async fn write(&self, token: Option<&str>, port_id: &Id, data: &[u8]) -> Result<usize> {
        let (port, _) = self.gate(token, Operation::Write, port_id).await?;
        let bus = port.options()?.rs485.as_ref().and_then(|t| t.bus.clone());
        let _grant = match (&self.arbiter, bus) {
            (Some(arbiter), Some(bus)) => {
                Some(arbiter.acquire(&bus, port_id, self.grant_timeout).await?)
            }
            _ => None,
        };
        Ok(port.write(data).await?)
    }

    /// Attach the single reader
    pub async fn read(
        &self,
        token: Option<&str>,
        port_id: &Id,
    ) -> Result<BoxStream<'static, portwarden_devices::Result<Bytes>>> {
        let (port, _) = self.gate(token, Operation::Read, port_id).await?;
        Ok(port.read()?)
    }

    /// Discard transport buffers
    pub async fn flush(&self, token: Option<&str>, port_id: &Id) -> Result<()> {
        let (port, _) = self.gate(token, Operation::Write, port_id).await?;
        Ok(port.flush().await?)
    }

    /// Wait for pending output
    pub async fn drain(&self, token: Option<&str>, port_id: &Id) -> Result<()> {
        let (port, _) = self.gate(token, Operation::Write, port_id).await?;
        Ok(port.drain().await?)
    }

    /// Lift a security block; needs an administrative token
    pub async fn unblock(&self, token: Option<&str>, port_id: &Id) -> Result<PortStatus> {
        let (port, permissions) = self.gate(token, Operation::Configure, port_id).await?;
        if permissions.security_level < SecurityLevel::Administrative {
            self.security.record(
                SecurityEvent::new(
                    SecurityEventKind::PermissionDenied,
                    ThreatLevel::Medium,
                    format!("unblock needs administrative level, token has {:?}", permissions.security_level),
                )
                .with_port(port_id.clone()),
            );
            return Err(SecurityError::authorization(
                "unblock",
                port_id,
                DenyReason::NotPermitted,
            )
            .into());
        }
        if let Ok(mut blocks) = self.blocks.lock() {
            blocks.remove(port_id);
        }
        Ok(port.unblock()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::ArbiterPolicy;
    use crate::error::Error;
    use futures::StreamExt;
    use portwarden_core::config::{ArbitrationStrategy, SecurityConfig};
    use portwarden_core::event::SharedEventBus;
    use portwarden_devices::mock::MockTransport;
    use portwarden_devices::{PortCapabilities, PortInfo, PortType};

    struct Fixture {
        service: PortService,
        security: Arc<SecurityGovernor>,
        transport: Arc<MockTransport>,
    }

    fn fixture(config: SecurityConfig) -> Result<Fixture> {
        let registry = SharedPortRegistry::new();
        let transport = Arc::new(MockTransport::new());
        registry.registry().register(PortStateMachine::new(
            PortInfo::new("COM3", "COM3", PortType::UsbSerial),
            PortCapabilities::default(),
            transport.clone(),
            SharedEventBus::new(),
        ))?;
        let security = Arc::new(SecurityGovernor::new(&config)?);
        let service = PortService::new(registry, security.clone(), Duration::from_millis(200));
        Ok(Fixture {
            service,
            security,
            transport,
        })
    }

    #[tokio::test]
    async fn test_read_only_token_on_com3() -> Result<()> {
        let f = fixture(SecurityConfig::default())?;
        let port = Id::from("COM3");
        let admin = f
            .security
            .generate_token_pair(TokenPermissions::full("COM3"), None)?;
        let reader = f
            .security
            .generate_token_pair(TokenPermissions::read_only("COM3"), None)?;

        f.service
            .open(Some(&admin.local_token), &port, PortOptions::default())
            .await?;
        f.transport.push_incoming(&b"ok"[..]);

        let mut stream = f.service.read(Some(&reader.local_token), &port).await?;
        let chunk = stream.next().await.ok_or_else(|| Error::governor("stream ended"))??;
        assert_eq!(&chunk[..], b"ok");

        let err = f
            .service
            .write(Some(&reader.local_token), &port, b"no")
            .await
            .unwrap_err();
        assert_eq!(err.deny_reason(), Some(DenyReason::NotPermitted));
        assert!(f.transport.writes().is_empty());

        let err = f
            .service
            .update_options(Some(&reader.local_token), &port, &PortOptionsPatch::baud_rate(115_200))
            .await
            .unwrap_err();
        assert!(err.is_denied());

        let denied = f
            .security
            .get_recent_events(10)
            .iter()
            .filter(|e| e.kind == SecurityEventKind::PermissionDenied)
            .count();
        assert_eq!(denied, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_token_never_reaches_port() -> Result<()> {
        let f = fixture(SecurityConfig::default())?;
        let port = Id::from("COM3");

        assert!(f.service.open(None, &port, PortOptions::default()).await.is_err());
        assert!(f.service.open(Some(""), &port, PortOptions::default()).await.is_err());
        assert_eq!(f.transport.open_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_rate_limit_blocks_port() -> Result<()> {
        let f = fixture(SecurityConfig {
            requests_per_minute: 2,
            ..SecurityConfig::default()
        })?;
        let port = Id::from("COM3");
        let pair = f
            .security
            .generate_token_pair(TokenPermissions::full("COM3"), None)?;
        let token = Some(pair.local_token.as_str());

        f.service.open(token, &port, PortOptions::default()).await?;
        f.service.flush(token, &port).await?;
        let err = f.service.drain(token, &port).await.unwrap_err();
        assert_eq!(err.deny_reason(), Some(DenyReason::RateLimited));

        let blocked = f.service.registry().registry().get(&port)?;
        assert_eq!(blocked.status()?, PortStatus::Blocked);
        Ok(())
    }

    #[tokio::test]
    async fn test_tokenless_flood_leaves_port_usable() -> Result<()> {
        let f = fixture(SecurityConfig {
            requests_per_minute: 2,
            ..SecurityConfig::default()
        })?;
        let port = Id::from("COM3");
        let pair = f
            .security
            .generate_token_pair(TokenPermissions::full("COM3"), None)?;
        let token = Some(pair.local_token.as_str());
        f.service.open(token, &port, PortOptions::default()).await?;

        let mut rate_limited = 0;
        for _ in 0..10 {
            let err = f
                .service
                .open(None, &port, PortOptions::default())
                .await
                .unwrap_err();
            if err.deny_reason().is_some_and(|r| r.is_rate_limit()) {
                rate_limited += 1;
            }
        }
        assert_eq!(rate_limited, 8);

        let status = f.service.registry().registry().get(&port)?.status()?;
        assert_eq!(status, PortStatus::Open);
        assert_eq!(f.service.write(token, &port, b"still here").await?, 10);
        assert_eq!(f.transport.open_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_foreign_token_cannot_block_port() -> Result<()> {
        let f = fixture(SecurityConfig {
            requests_per_minute: 1,
            ..SecurityConfig::default()
        })?;
        let port = Id::from("COM3");
        let foreign = f
            .security
            .generate_token_pair(TokenPermissions::full("COM4"), None)?;

        for _ in 0..3 {
            assert!(f.service.flush(Some(&foreign.local_token), &port).await.is_err());
        }
        let status = f.service.registry().registry().get(&port)?.status()?;
        assert_eq!(status, PortStatus::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn test_block_lifts_when_blacklist_expires() -> Result<()> {
        let f = fixture(SecurityConfig {
            requests_per_minute: 2,
            blacklist_duration_secs: 1,
            ..SecurityConfig::default()
        })?;
        let port = Id::from("COM3");
        let pair = f
            .security
            .generate_token_pair(TokenPermissions::full("COM3"), None)?;
        let token = Some(pair.local_token.as_str());

        f.service.open(token, &port, PortOptions::default()).await?;
        f.service.flush(token, &port).await?;
        assert!(f.service.drain(token, &port).await.is_err());
        let machine = f.service.registry().registry().get(&port)?;
        assert_eq!(machine.status()?, PortStatus::Blocked);

        // Still serving the blacklist
        assert_eq!(f.service.lift_expired_blocks(), 0);
        assert_eq!(machine.status()?, PortStatus::Blocked);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(f.service.lift_expired_blocks(), 1);
        assert_eq!(machine.status()?, PortStatus::Open);
        assert_eq!(f.service.lift_expired_blocks(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_unblock_needs_administrative_level() -> Result<()> {
        let f = fixture(SecurityConfig::default())?;
        let port = Id::from("COM3");
        let elevated = f.security.generate_token_pair(
            TokenPermissions::full("COM3").with_level(SecurityLevel::Elevated),
            None,
        )?;
        let admin = f.security.generate_token_pair(
            TokenPermissions::full("COM3").with_level(SecurityLevel::Administrative),
            None,
        )?;
        f.service.registry().registry().get(&port)?.block("test")?;

        let err = f
            .service
            .unblock(Some(&elevated.local_token), &port)
            .await
            .unwrap_err();
        assert!(err.is_denied());

        let restored = f.service.unblock(Some(&admin.local_token), &port).await?;
        assert_eq!(restored, PortStatus::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn test_bus_write_holds_arbiter_grant() -> Result<()> {
        use portwarden_devices::capability::{GpioAccess, Rs485Support};
        use portwarden_devices::mock::MockGpio;
        use portwarden_devices::Rs485Timing;

        let registry = SharedPortRegistry::new();
        let transport = Arc::new(MockTransport::new());
        let caps = PortCapabilities {
            rs485: Rs485Support::GpioDirection,
            gpio: GpioAccess::Full,
            ..PortCapabilities::default()
        };
        registry.registry().register(
            PortStateMachine::new(
                PortInfo::new("node-1", "/dev/ttyAMA0", PortType::Rs485),
                caps,
                transport.clone(),
                SharedEventBus::new(),
            )
            .with_gpio(Arc::new(MockGpio::new())),
        )?;
        let security = Arc::new(SecurityGovernor::new(&SecurityConfig::default())?);
        let arbiter = Arc::new(ResourceArbiter::new(ArbiterPolicy {
            strategy: ArbitrationStrategy::Priority,
            starvation: Duration::from_secs(2),
        }));
        let service = PortService::new(registry, security.clone(), Duration::from_millis(200))
            .with_arbiter(arbiter.clone(), Duration::from_millis(100));

        let port = Id::from("node-1");
        let pair = security.generate_token_pair(TokenPermissions::full("node-1"), None)?;
        let token = Some(pair.local_token.as_str());
        let options = PortOptions {
            rs485: Some(Rs485Timing::default().on_bus("bus-a")),
            ..PortOptions::default()
        };
        service.open(token, &port, options).await?;

        // Another holder keeps the bus: the write must time out waiting
        let held = arbiter
            .acquire("bus-a", &Id::from("node-0"), Duration::from_millis(10))
            .await?;
        let err = service.write(token, &port, b"ping").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(transport.writes().is_empty());

        drop(held);
        assert_eq!(service.write(token, &port, b"ping").await?, 4);
        Ok(())
    }
}
