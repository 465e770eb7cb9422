/*!
 * Security Governor.
 *
 * The single gate every port-touching or network-exposing operation passes
 * through. Authorization fails closed, and every call, granted or not,
 * lands in the audit trail.
 */
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use portwarden_core::config::SecurityConfig;
use portwarden_core::event::DEFAULT_CHANNEL_CAPACITY;
use portwarden_core::types::Id;
use portwarden_core::utils::bounded;

use crate::error::{Result, SecurityError};
use crate::event::{SecurityEvent, SecurityEventKind, SecurityEventLog, ThreatLevel};
use crate::rate_limit::{PeerRateLimiter, RateDecision};
use crate::threat::ThreatAssessment;
use crate::token::{
    fingerprint, Operation, TokenManager, TokenPair, TokenPermissions, TokenRejection, TokenSummary,
};

/// Why an operation was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The token itself is unusable
    Token(TokenRejection),
    /// The token is bound to another port
    WrongPort,
    /// The permission flag for the operation is not set
    NotPermitted,
    /// This request exceeded the peer's budget
    RateLimited,
    /// The peer is serving a blacklist period
    Blacklisted,
    /// The authorization round-trip timed out
    TimedOut,
}

impl DenyReason {
    /// Whether the denial comes from request volume rather than credentials
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, DenyReason::RateLimited | DenyReason::Blacklisted)
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::Token(rejection) => write!(f, "{}", rejection),
            DenyReason::WrongPort => write!(f, "token bound to another port"),
            DenyReason::NotPermitted => write!(f, "permission not granted"),
            DenyReason::RateLimited => write!(f, "rate limit exceeded"),
            DenyReason::Blacklisted => write!(f, "peer blacklisted"),
            DenyReason::TimedOut => write!(f, "authorization timed out"),
        }
    }
}

/// Result of an authorization check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationDecision {
    /// Allowed under these permissions
    Granted(TokenPermissions),
    /// Refused
    Denied(DenyReason),
}

impl AuthorizationDecision {
    /// Whether the operation may proceed
    pub fn is_granted(&self) -> bool {
        matches!(self, AuthorizationDecision::Granted(_))
    }

    /// Denial reason, if denied
    pub fn reason(&self) -> Option<DenyReason> {
        match self {
            AuthorizationDecision::Granted(_) => None,
            AuthorizationDecision::Denied(reason) => Some(*reason),
        }
    }
}

/// An authorization round-trip that may be slow.
///
/// Callers wrap it with [`authorize_within`] so a stalled authorizer denies
/// instead of hanging.
#[async_trait]
pub trait Authorizer: Send + Sync + Debug {
    /// Decide whether `token` may perform `op` on `port`
    async fn authorize(&self, token: Option<&str>, op: Operation, port: &Id) -> AuthorizationDecision;

    /// Append to the audit trail
    fn audit(&self, event: SecurityEvent);
}

/// Authorize with a bound, mapping denials and timeouts to errors
pub async fn authorize_within(
    authorizer: &dyn Authorizer,
    timeout: Duration,
    token: Option<&str>,
    op: Operation,
    port: &Id,
) -> Result<TokenPermissions> {
    let limit = bounded(timeout);
    match tokio::time::timeout(limit, authorizer.authorize(token, op, port)).await {
        Ok(AuthorizationDecision::Granted(permissions)) => Ok(permissions),
        Ok(AuthorizationDecision::Denied(reason)) => {
            Err(SecurityError::authorization(op, port, reason))
        }
        Err(_) => {
            let mut event = SecurityEvent::new(
                SecurityEventKind::PermissionDenied,
                ThreatLevel::Medium,
                format!("{} on {}: {}", op, port, DenyReason::TimedOut),
            )
            .with_port(port.clone());
            if let Some(token) = token {
                event = event.with_token(fingerprint(token));
            }
            authorizer.audit(event);
            Err(SecurityError::AuthorizationTimeout(limit))
        }
    }
}

/// Security Governor: token lifecycle, authorization, audit and threat view
#[derive(Debug)]
pub struct SecurityGovernor {
    tokens: TokenManager,
    log: SecurityEventLog,
    limiter: PeerRateLimiter,
    threat_window: Duration,
    events: broadcast::Sender<SecurityEvent>,
}

const ANONYMOUS_PEER: &str = "anonymous";

/// Rate-limit peers quiet for this long are forgotten by the sweep
const PEER_IDLE: Duration = Duration::from_secs(120);

impl SecurityGovernor {
    /// Create a governor from configuration, opening the audit file if one is set
    pub fn new(config: &SecurityConfig) -> Result<Self> {
        let log = match &config.audit_log {
            Some(path) => SecurityEventLog::with_audit_file(config.event_log_capacity, path)?,
            None => SecurityEventLog::new(config.event_log_capacity),
        };
        let (events, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        info!("Security governor started");
        Ok(Self {
            tokens: TokenManager::new(config.token_expiry()),
            log,
            limiter: PeerRateLimiter::per_minute(
                config.requests_per_minute,
                config.blacklist_duration(),
            ),
            threat_window: config.threat_window(),
            events,
        })
    }

    /// Token store
    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Append an event to the audit trail and broadcast it
    pub fn record(&self, event: SecurityEvent) -> u64 {
        if event.threat_level >= ThreatLevel::High {
            warn!("Security event {:?}: {}", event.kind, event.details);
        } else {
            debug!("Security event {:?}: {}", event.kind, event.details);
        }
        let _ = self.events.send(event.clone());
        self.log.append(event)
    }

    /// Live feed of security events (drop-oldest for slow receivers)
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.events.subscribe()
    }

    /// Issue a renewable token pair
    pub fn generate_token_pair(
        &self,
        permissions: TokenPermissions,
        expires_in: Option<Duration>,
    ) -> Result<TokenPair> {
        let port = permissions.port_id.clone();
        let pair = self.tokens.generate_token_pair(permissions, expires_in)?;
        self.record(
            SecurityEvent::new(
                SecurityEventKind::TokenCreated,
                ThreatLevel::Low,
                format!("expires {}", pair.expires_at),
            )
            .with_port(port)
            .with_token(fingerprint(&pair.local_token)),
        );
        Ok(pair)
    }

    /// Rate-limit key for a caller: the token fingerprint, or one shared
    /// key for callers without a token
    pub fn peer_key(token: Option<&str>) -> String {
        match token {
            Some(t) if !t.is_empty() => fingerprint(t),
            _ => ANONYMOUS_PEER.to_string(),
        }
    }

    /// Whether the peer behind `key` is serving a blacklist period
    pub fn is_blacklisted(&self, key: &str) -> bool {
        self.limiter.is_blacklisted(key)
    }

    /// Whether `token` names a live pair bound to `port`, regardless of
    /// the operation
    pub fn is_authenticated_for(&self, token: Option<&str>, port: &Id) -> bool {
        self.tokens.check(token).is_ok_and(|perms| &perms.port_id == port)
    }

    /// Decide and audit; fails closed
    pub fn decide(&self, token: Option<&str>, op: Operation, port: &Id) -> AuthorizationDecision {
        let peer = Self::peer_key(token);

        let decision = match self.limiter.check(&peer) {
            RateDecision::Exceeded => AuthorizationDecision::Denied(DenyReason::RateLimited),
            RateDecision::Blacklisted => AuthorizationDecision::Denied(DenyReason::Blacklisted),
            RateDecision::Allowed => match self.tokens.check(token) {
                Err(rejection) => AuthorizationDecision::Denied(DenyReason::Token(rejection)),
                Ok(perms) if &perms.port_id != port => {
                    AuthorizationDecision::Denied(DenyReason::WrongPort)
                }
                Ok(perms) if !perms.allows(op) => {
                    AuthorizationDecision::Denied(DenyReason::NotPermitted)
                }
                Ok(perms) => AuthorizationDecision::Granted(perms),
            },
        };

        let (kind, level, detail) = match &decision {
            AuthorizationDecision::Granted(_) => {
                if let Some(t) = token {
                    self.tokens.touch(t);
                }
                (SecurityEventKind::AccessGranted, ThreatLevel::Low, format!("{} on {}", op, port))
            }
            AuthorizationDecision::Denied(reason) => {
                let (kind, level) = match reason {
                    DenyReason::Token(_) => (SecurityEventKind::AuthenticationFailed, ThreatLevel::Medium),
                    DenyReason::WrongPort | DenyReason::NotPermitted | DenyReason::TimedOut => {
                        (SecurityEventKind::PermissionDenied, ThreatLevel::Medium)
                    }
                    DenyReason::RateLimited => (SecurityEventKind::RateLimitExceeded, ThreatLevel::High),
                    DenyReason::Blacklisted => (SecurityEventKind::PermissionDenied, ThreatLevel::High),
                };
                (kind, level, format!("{} on {}: {}", op, port, reason))
            }
        };

        let mut event = SecurityEvent::new(kind, level, detail).with_port(port.clone());
        if peer != ANONYMOUS_PEER {
            event = event.with_token(peer);
        }
        self.record(event);
        decision
    }

    /// Whether `token` may perform `op` on `port`
    pub fn authorize(&self, token: Option<&str>, op: Operation, port: &Id) -> bool {
        self.decide(token, op, port).is_granted()
    }

    /// Mutual credential check
    pub fn authenticate(&self, local_token: &str, peer_token: &str) -> bool {
        let ok = self.tokens.authenticate(local_token, peer_token);
        let (kind, level) = if ok {
            (SecurityEventKind::AuthenticationSucceeded, ThreatLevel::Low)
        } else {
            (SecurityEventKind::AuthenticationFailed, ThreatLevel::Medium)
        };
        self.record(
            SecurityEvent::new(kind, level, "mutual authentication")
                .with_token(fingerprint(local_token)),
        );
        ok
    }

    /// Extend a token pair by its original grant
    pub fn renew_token(&self, local_token: &str) -> Result<TokenPair> {
        let outcome = self.tokens.renew_token(local_token);
        let event = match &outcome {
            Ok(pair) => SecurityEvent::new(
                SecurityEventKind::TokenRenewed,
                ThreatLevel::Low,
                format!("expires {}", pair.expires_at),
            ),
            Err(e) => SecurityEvent::new(
                SecurityEventKind::AuthenticationFailed,
                ThreatLevel::Medium,
                format!("renew refused: {}", e),
            ),
        };
        self.record(event.with_token(fingerprint(local_token)));
        outcome
    }

    /// Revoke a token pair
    pub fn revoke_token(&self, local_token: &str) -> Result<()> {
        let permissions = self.tokens.revoke_token(local_token)?;
        self.record(
            SecurityEvent::new(SecurityEventKind::TokenRevoked, ThreatLevel::Low, "revoked")
                .with_port(permissions.port_id)
                .with_token(fingerprint(local_token)),
        );
        Ok(())
    }

    /// Permissions bound to a token pair
    pub fn get_permissions(&self, local_token: &str) -> Option<TokenPermissions> {
        self.tokens.get_permissions(local_token)
    }

    /// Fingerprinted listing of every token pair
    pub fn list_tokens(&self) -> Result<Vec<TokenSummary>> {
        self.tokens.list_tokens()
    }

    /// The `limit` most recent security events, oldest first
    pub fn get_recent_events(&self, limit: usize) -> Vec<SecurityEvent> {
        self.log.recent(limit)
    }

    /// Threat level over the configured window
    pub fn get_threat_assessment(&self) -> ThreatAssessment {
        let now = chrono::Utc::now();
        let since = now
            - chrono::Duration::from_std(self.threat_window)
                .unwrap_or_else(|_| chrono::Duration::days(1));
        let events = self.log.since(since);
        ThreatAssessment::assess(&events, self.threat_window, now)
    }

    /// Remove expired and revoked pairs, returning how many were dropped
    pub fn sweep_expired(&self) -> Result<usize> {
        let swept = self.tokens.sweep_expired()?;
        for (fp, permissions) in &swept {
            self.record(
                SecurityEvent::new(SecurityEventKind::TokenExpired, ThreatLevel::Low, "swept")
                    .with_port(permissions.port_id.clone())
                    .with_token(fp.clone()),
            );
        }
        Ok(swept.len())
    }

    /// Forget idle rate-limit peers, returning how many were dropped
    pub fn sweep_rate_limits(&self) -> usize {
        let dropped = self.limiter.sweep(PEER_IDLE);
        if dropped > 0 {
            debug!("Forgot {} idle rate-limit peers", dropped);
        }
        dropped
    }
}

#[async_trait]
impl Authorizer for SecurityGovernor {
    async fn authorize(&self, token: Option<&str>, op: Operation, port: &Id) -> AuthorizationDecision {
        self.decide(token, op, port)
    }

    fn audit(&self, event: SecurityEvent) {
        self.record(event);
    }
}

#[async_trait]
impl<A: Authorizer + ?Sized> Authorizer for Arc<A> {
    async fn authorize(&self, token: Option<&str>, op: Operation, port: &Id) -> AuthorizationDecision {
        (**self).authorize(token, op, port).await
    }

    fn audit(&self, event: SecurityEvent) {
        (**self).audit(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::SecurityLevel;

    fn governor() -> SecurityGovernor {
        SecurityGovernor::new(&SecurityConfig::default()).unwrap()
    }

    #[test]
    fn test_com3_read_only_scenario() -> Result<()> {
        let sg = governor();
        let pair = sg.generate_token_pair(
            TokenPermissions::read_only("COM3"),
            Some(Duration::from_millis(60_000)),
        )?;
        let com3: Id = "COM3".into();

        assert!(!sg.authorize(Some(&pair.local_token), Operation::Write, &com3));
        assert!(sg.authorize(Some(&pair.local_token), Operation::Read, &com3));
        Ok(())
    }

    #[test]
    fn test_authorize_fails_closed_for_every_bad_token() -> Result<()> {
        let sg = governor();
        let expired = sg.generate_token_pair(TokenPermissions::full("COM1"), Some(Duration::ZERO))?;
        let revoked = sg.generate_token_pair(TokenPermissions::full("COM1"), None)?;
        sg.revoke_token(&revoked.local_token)?;

        let tokens: [Option<&str>; 4] = [
            None,
            Some(""),
            Some(&expired.local_token),
            Some(&revoked.local_token),
        ];
        let ports: [Id; 3] = ["COM1".into(), "COM2".into(), "ttyUSB0".into()];

        let before = sg.get_recent_events(usize::MAX).len();
        let mut calls = 0;
        for token in tokens {
            for op in [Operation::Read, Operation::Write, Operation::Configure] {
                for port in &ports {
                    assert!(!sg.authorize(token, op, port));
                    calls += 1;
                }
            }
        }
        assert_eq!(sg.get_recent_events(usize::MAX).len() - before, calls);
        Ok(())
    }

    #[test]
    fn test_wrong_port_and_missing_flag_are_permission_denied() -> Result<()> {
        let sg = governor();
        let pair = sg.generate_token_pair(
            TokenPermissions::read_only("COM3").with_level(SecurityLevel::Elevated),
            None,
        )?;

        let decision = sg.decide(Some(&pair.local_token), Operation::Read, &"COM4".into());
        assert_eq!(decision, AuthorizationDecision::Denied(DenyReason::WrongPort));

        let decision = sg.decide(Some(&pair.local_token), Operation::Configure, &"COM3".into());
        assert_eq!(decision, AuthorizationDecision::Denied(DenyReason::NotPermitted));

        let last = sg.get_recent_events(1);
        assert_eq!(last[0].kind, SecurityEventKind::PermissionDenied);
        assert_eq!(last[0].token, Some(fingerprint(&pair.local_token)));
        Ok(())
    }

    #[test_log::test]
    fn test_rate_limit_blacklists_peer() -> Result<()> {
        let config = SecurityConfig {
            requests_per_minute: 2,
            ..SecurityConfig::default()
        };
        let sg = SecurityGovernor::new(&config)?;
        let pair = sg.generate_token_pair(TokenPermissions::full("COM1"), None)?;
        let port: Id = "COM1".into();

        assert!(sg.authorize(Some(&pair.local_token), Operation::Read, &port));
        assert!(sg.authorize(Some(&pair.local_token), Operation::Read, &port));
        assert_eq!(
            sg.decide(Some(&pair.local_token), Operation::Read, &port),
            AuthorizationDecision::Denied(DenyReason::RateLimited)
        );
        assert_eq!(
            sg.decide(Some(&pair.local_token), Operation::Read, &port),
            AuthorizationDecision::Denied(DenyReason::Blacklisted)
        );

        let assessment = sg.get_threat_assessment();
        assert_eq!(assessment.rate_limit_hits, 1);
        assert_eq!(assessment.level, ThreatLevel::Medium);
        Ok(())
    }

    #[test]
    fn test_anonymous_callers_share_one_peer_key() -> Result<()> {
        let config = SecurityConfig {
            requests_per_minute: 1,
            ..SecurityConfig::default()
        };
        let sg = SecurityGovernor::new(&config)?;
        let pair = sg.generate_token_pair(TokenPermissions::full("COM1"), None)?;
        let port: Id = "COM1".into();

        assert_eq!(SecurityGovernor::peer_key(None), SecurityGovernor::peer_key(Some("")));
        sg.decide(None, Operation::Read, &port);
        sg.decide(Some(""), Operation::Read, &port);
        assert!(sg.is_blacklisted(&SecurityGovernor::peer_key(None)));

        // A real token keeps its own budget
        assert!(!sg.is_blacklisted(&SecurityGovernor::peer_key(Some(&pair.local_token))));
        assert!(sg.authorize(Some(&pair.local_token), Operation::Read, &port));
        assert!(sg.is_authenticated_for(Some(&pair.local_token), &port));
        assert!(!sg.is_authenticated_for(Some(&pair.local_token), &"COM2".into()));
        assert!(!sg.is_authenticated_for(None, &port));

        // Blacklisted peers survive the idle sweep
        assert_eq!(sg.sweep_rate_limits(), 0);
        Ok(())
    }

    #[test]
    fn test_renew_and_sweep_are_audited() -> Result<()> {
        let sg = governor();
        let pair = sg.generate_token_pair(TokenPermissions::full("COM1"), None)?;
        sg.renew_token(&pair.local_token)?;
        sg.generate_token_pair(TokenPermissions::full("COM2"), Some(Duration::ZERO))?;

        assert_eq!(sg.sweep_expired()?, 1);
        let kinds: Vec<_> = sg.get_recent_events(2).into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![SecurityEventKind::TokenCreated, SecurityEventKind::TokenExpired]
        );
        Ok(())
    }

    #[test]
    fn test_authenticate_is_audited() -> Result<()> {
        let sg = governor();
        let pair = sg.generate_token_pair(TokenPermissions::full("COM1"), None)?;
        assert!(sg.authenticate(&pair.local_token, &pair.peer_token));
        assert!(!sg.authenticate(&pair.local_token, "forged"));
        assert_eq!(sg.get_threat_assessment().auth_failures, 1);
        Ok(())
    }

    #[derive(Debug)]
    struct Stalled(SecurityGovernor);

    #[async_trait]
    impl Authorizer for Stalled {
        async fn authorize(&self, _: Option<&str>, _: Operation, _: &Id) -> AuthorizationDecision {
            tokio::time::sleep(Duration::from_secs(5)).await;
            AuthorizationDecision::Granted(TokenPermissions::full("COM1"))
        }

        fn audit(&self, event: SecurityEvent) {
            self.0.record(event);
        }
    }

    #[tokio::test]
    async fn test_authorize_within_times_out_closed() {
        let stalled = Stalled(governor());
        let result = authorize_within(
            &stalled,
            Duration::from_millis(20),
            Some("token"),
            Operation::Write,
            &"COM1".into(),
        )
        .await;

        assert!(matches!(result, Err(SecurityError::AuthorizationTimeout(_))));
        assert_eq!(stalled.0.get_recent_events(1)[0].kind, SecurityEventKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_authorize_within_maps_denial() -> Result<()> {
        let sg = Arc::new(governor());
        let pair = sg.generate_token_pair(TokenPermissions::read_only("COM3"), None)?;
        let port: Id = "COM3".into();

        let granted = authorize_within(
            &sg,
            Duration::from_secs(1),
            Some(&pair.local_token),
            Operation::Read,
            &port,
        )
        .await?;
        assert!(granted.read);

        let denied = authorize_within(
            &sg,
            Duration::from_secs(1),
            Some(&pair.local_token),
            Operation::Write,
            &port,
        )
        .await;
        assert!(matches!(denied, Err(SecurityError::Authorization { .. })));
        Ok(())
    }
}
