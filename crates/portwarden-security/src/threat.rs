/*!
 * Threat assessment derived from the recent audit trail.
 *
 * | level    | auth failures | rate-limit hits | device changes |
 * |----------|---------------|-----------------|----------------|
 * | critical | ≥ 50          | ≥ 10            |                |
 * | high     | ≥ 20          | ≥ 5             | ≥ 10           |
 * | medium   | ≥ 5           | ≥ 1             | ≥ 3            |
 *
 * The overall level is the highest level reached by any column. The result
 * is informational; nothing is blocked on it.
 */
use std::time::Duration;

use serde::{Deserialize, Serialize};

use portwarden_core::types::Timestamp;

use crate::event::{SecurityEvent, SecurityEventKind, ThreatLevel};

/// Snapshot of recent security activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatAssessment {
    /// Overall level
    pub level: ThreatLevel,
    /// Failed credential checks in the window
    pub auth_failures: usize,
    /// Rate-limit violations in the window
    pub rate_limit_hits: usize,
    /// Ports appearing or disappearing in the window
    pub device_changes: usize,
    /// Window length in seconds
    pub window_secs: u64,
    /// When the assessment was made
    pub assessed_at: Timestamp,
}

fn auth_level(count: usize) -> ThreatLevel {
    match count {
        n if n >= 50 => ThreatLevel::Critical,
        n if n >= 20 => ThreatLevel::High,
        n if n >= 5 => ThreatLevel::Medium,
        _ => ThreatLevel::Low,
    }
}

fn rate_level(count: usize) -> ThreatLevel {
    match count {
        n if n >= 10 => ThreatLevel::Critical,
        n if n >= 5 => ThreatLevel::High,
        n if n >= 1 => ThreatLevel::Medium,
        _ => ThreatLevel::Low,
    }
}

fn device_level(count: usize) -> ThreatLevel {
    match count {
        n if n >= 10 => ThreatLevel::High,
        n if n >= 3 => ThreatLevel::Medium,
        _ => ThreatLevel::Low,
    }
}

impl ThreatAssessment {
    /// Assess the events that fall within `window` before `now`
    pub fn assess<'a, I>(events: I, window: Duration, now: Timestamp) -> Self
    where
        I: IntoIterator<Item = &'a SecurityEvent>,
    {
        let cutoff = now
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(1));

        let (mut auth_failures, mut rate_limit_hits, mut device_changes) = (0, 0, 0);
        for event in events.into_iter().filter(|e| e.timestamp >= cutoff) {
            match event.kind {
                SecurityEventKind::AuthenticationFailed => auth_failures += 1,
                SecurityEventKind::RateLimitExceeded => rate_limit_hits += 1,
                SecurityEventKind::DeviceChange => device_changes += 1,
                _ => {}
            }
        }

        let level = auth_level(auth_failures)
            .max(rate_level(rate_limit_hits))
            .max(device_level(device_changes));

        Self {
            level,
            auth_failures,
            rate_limit_hits,
            device_changes,
            window_secs: window.as_secs(),
            assessed_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(kind: SecurityEventKind, n: usize) -> Vec<SecurityEvent> {
        (0..n)
            .map(|_| SecurityEvent::new(kind, ThreatLevel::Medium, ""))
            .collect()
    }

    fn level_of(kind: SecurityEventKind, n: usize) -> ThreatLevel {
        let evs = events(kind, n);
        ThreatAssessment::assess(&evs, Duration::from_secs(300), chrono::Utc::now()).level
    }

    #[test]
    fn test_threshold_table() {
        use SecurityEventKind::*;

        assert_eq!(level_of(AuthenticationFailed, 4), ThreatLevel::Low);
        assert_eq!(level_of(AuthenticationFailed, 5), ThreatLevel::Medium);
        assert_eq!(level_of(AuthenticationFailed, 20), ThreatLevel::High);
        assert_eq!(level_of(AuthenticationFailed, 50), ThreatLevel::Critical);

        assert_eq!(level_of(RateLimitExceeded, 0), ThreatLevel::Low);
        assert_eq!(level_of(RateLimitExceeded, 1), ThreatLevel::Medium);
        assert_eq!(level_of(RateLimitExceeded, 5), ThreatLevel::High);
        assert_eq!(level_of(RateLimitExceeded, 10), ThreatLevel::Critical);

        assert_eq!(level_of(DeviceChange, 2), ThreatLevel::Low);
        assert_eq!(level_of(DeviceChange, 3), ThreatLevel::Medium);
        assert_eq!(level_of(DeviceChange, 50), ThreatLevel::High);

        assert_eq!(level_of(AccessGranted, 500), ThreatLevel::Low);
    }

    #[test]
    fn test_old_events_fall_out_of_window() {
        let mut evs = events(SecurityEventKind::AuthenticationFailed, 30);
        let old = chrono::Utc::now() - chrono::Duration::minutes(10);
        for e in evs.iter_mut().take(28) {
            e.timestamp = old;
        }

        let assessment =
            ThreatAssessment::assess(&evs, Duration::from_secs(300), chrono::Utc::now());
        assert_eq!(assessment.auth_failures, 2);
        assert_eq!(assessment.level, ThreatLevel::Low);
        assert_eq!(assessment.window_secs, 300);
    }
}
