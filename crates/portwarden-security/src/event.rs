/*!
 * Security audit trail.
 *
 * Every authorization decision, token lifecycle change, boundary check and
 * governance change becomes a [`SecurityEvent`]. Events are append-only: the
 * in-memory ring evicts the oldest entry when full, and the optional
 * JSON-lines file keeps everything.
 */
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use portwarden_core::types::{BoundedLog, Id, Timestamp};

use crate::error::{Result, SecurityError};

/// Severity attached to a security event or assessment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    /// Routine
    Low,
    /// Worth a look
    Medium,
    /// Likely hostile or broken
    High,
    /// Act now
    Critical,
}

/// What a security event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    /// A token pair was issued
    TokenCreated,
    /// A token pair was renewed
    TokenRenewed,
    /// A token pair was revoked
    TokenRevoked,
    /// A token pair was swept after expiry
    TokenExpired,
    /// A credential check failed
    AuthenticationFailed,
    /// A mutual credential check passed
    AuthenticationSucceeded,
    /// An operation was authorized
    AccessGranted,
    /// A valid token lacked the permission or targeted another port
    PermissionDenied,
    /// A peer exceeded its request budget
    RateLimitExceeded,
    /// A port appeared or disappeared
    DeviceChange,
    /// Governance parameters changed or a change was rejected
    ConfigurationChange,
    /// A bind address fell outside the private-network boundary
    BoundaryViolation,
    /// An operator override admitted a disallowed bind address
    BoundaryOverride,
}

/// An entry in the security audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Event id
    pub id: Id,
    /// When it happened
    pub timestamp: Timestamp,
    /// What happened
    pub kind: SecurityEventKind,
    /// Port concerned, if any
    pub port: Option<Id>,
    /// Fingerprint of the token concerned, never the token itself
    pub token: Option<String>,
    /// Free-form details
    pub details: String,
    /// Severity
    pub threat_level: ThreatLevel,
}

impl SecurityEvent {
    /// Create an event stamped now
    pub fn new<S: Into<String>>(kind: SecurityEventKind, threat_level: ThreatLevel, details: S) -> Self {
        Self {
            id: Id::new(),
            timestamp: chrono::Utc::now(),
            kind,
            port: None,
            token: None,
            details: details.into(),
            threat_level,
        }
    }

    /// Attach the port concerned
    pub fn with_port(mut self, port: Id) -> Self {
        self.port = Some(port);
        self
    }

    /// Attach a token fingerprint
    pub fn with_token(mut self, fingerprint: String) -> Self {
        self.token = Some(fingerprint);
        self
    }
}

/// Bounded in-memory audit ring with an optional JSON-lines sink
#[derive(Debug)]
pub struct SecurityEventLog {
    ring: Mutex<BoundedLog<SecurityEvent>>,
    sink: Option<Mutex<LineWriter<File>>>,
}

impl SecurityEventLog {
    /// Memory-only log
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(BoundedLog::with_capacity(capacity)),
            sink: None,
        }
    }

    /// Log that also appends every event to `path`
    pub fn with_audit_file<P: AsRef<Path>>(capacity: usize, path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            ring: Mutex::new(BoundedLog::with_capacity(capacity)),
            sink: Some(Mutex::new(LineWriter::new(file))),
        })
    }

    /// Append an event, returning its sequence number.
    ///
    /// A failing audit file is reported through tracing; the in-memory
    /// record is kept either way.
    pub fn append(&self, event: SecurityEvent) -> u64 {
        if let Err(e) = self.write_sink(&event) {
            warn!("Security audit file write failed: {}", e);
        }
        let mut ring = self.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ring.push(event)
    }

    fn write_sink(&self, event: &SecurityEvent) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let line = serde_json::to_string(event).map_err(|e| SecurityError::Audit(e.to_string()))?;
        let mut writer = sink
            .lock()
            .map_err(|_| SecurityError::Audit("audit sink lock poisoned".to_string()))?;
        writeln!(writer, "{}", line)?;
        Ok(())
    }

    /// The `limit` most recent events, oldest first
    pub fn recent(&self, limit: usize) -> Vec<SecurityEvent> {
        self.ring
            .lock()
            .map(|ring| ring.recent(limit))
            .unwrap_or_default()
    }

    /// Events newer than `since`, oldest first
    pub fn since(&self, since: Timestamp) -> Vec<SecurityEvent> {
        self.ring
            .lock()
            .map(|ring| ring.iter().filter(|e| e.timestamp >= since).cloned().collect())
            .unwrap_or_default()
    }

    /// Number of events currently held in memory
    pub fn len(&self) -> usize {
        self.ring.lock().map(|ring| ring.len()).unwrap_or(0)
    }

    /// Whether the ring is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use tempfile::tempdir;

    #[test]
    fn test_ring_keeps_most_recent() {
        let log = SecurityEventLog::new(2);
        for kind in [
            SecurityEventKind::TokenCreated,
            SecurityEventKind::AccessGranted,
            SecurityEventKind::TokenRevoked,
        ] {
            log.append(SecurityEvent::new(kind, ThreatLevel::Low, ""));
        }

        let kinds: Vec<_> = log.recent(10).into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![SecurityEventKind::AccessGranted, SecurityEventKind::TokenRevoked]
        );
    }

    #[test]
    fn test_audit_file_gets_one_json_line_per_event() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("audit.jsonl");
        let log = SecurityEventLog::with_audit_file(1, &path)?;

        log.append(
            SecurityEvent::new(SecurityEventKind::PermissionDenied, ThreatLevel::Medium, "write")
                .with_port("COM3".into())
                .with_token("abcd".into()),
        );
        log.append(SecurityEvent::new(
            SecurityEventKind::BoundaryOverride,
            ThreatLevel::Critical,
            "8.8.8.8",
        ));

        let lines: Vec<String> = BufReader::new(File::open(&path)?)
            .lines()
            .collect::<std::io::Result<_>>()?;
        assert_eq!(lines.len(), 2);

        let first: SecurityEvent =
            serde_json::from_str(&lines[0]).map_err(|e| SecurityError::Audit(e.to_string()))?;
        assert_eq!(first.kind, SecurityEventKind::PermissionDenied);
        assert_eq!(first.port.as_ref().map(|p| p.as_str()), Some("COM3"));
        assert!(lines[1].contains("\"boundary_override\""));
        assert_eq!(log.len(), 1);
        Ok(())
    }
}
