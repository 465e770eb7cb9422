/*!
 * Per-peer rate limiting with a blacklist.
 *
 * Request budgets are GCRA quotas from a keyed `governor` limiter. A peer
 * that exceeds its quota is refused outright until its blacklist period
 * runs out, whatever the quota would say.
 */
use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ::governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tracing::debug;

/// Outcome of a rate check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Within budget
    Allowed,
    /// This request exceeded the budget; the peer is now blacklisted
    Exceeded,
    /// The peer is serving a blacklist period
    Blacklisted,
}

/// Quota limiter keyed by peer
pub struct PeerRateLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
    blacklist: Duration,
    blacklisted_until: DashMap<String, Instant>,
    last_seen: DashMap<String, Instant>,
}

impl std::fmt::Debug for PeerRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRateLimiter")
            .field("blacklist", &self.blacklist)
            .field("peers", &self.last_seen.len())
            .field("blacklisted", &self.blacklisted_until.len())
            .finish()
    }
}

fn non_zero(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN)
}

impl PeerRateLimiter {
    /// Allow `limit` requests per `window`, refilling evenly across it;
    /// offenders are refused for `blacklist`
    pub fn new(limit: u32, window: Duration, blacklist: Duration) -> Self {
        let burst = non_zero(limit);
        let quota = Quota::with_period(window / burst.get())
            .map(|q| q.allow_burst(burst))
            .unwrap_or_else(|| Quota::per_second(burst));
        Self::with_quota(quota, blacklist)
    }

    /// `requests_per_minute` budget
    pub fn per_minute(requests_per_minute: u32, blacklist: Duration) -> Self {
        Self::with_quota(Quota::per_minute(non_zero(requests_per_minute)), blacklist)
    }

    fn with_quota(quota: Quota, blacklist: Duration) -> Self {
        Self {
            limiter: RateLimiter::keyed(quota),
            blacklist,
            blacklisted_until: DashMap::new(),
            last_seen: DashMap::new(),
        }
    }

    /// Count a request from `peer`
    pub fn check(&self, peer: &str) -> RateDecision {
        self.check_at(peer, Instant::now())
    }

    /// Blacklist bookkeeping runs on `now`; the quota itself runs on the
    /// limiter's clock
    fn check_at(&self, peer: &str, now: Instant) -> RateDecision {
        self.last_seen.insert(peer.to_string(), now);

        if let Some(until) = self.blacklisted_until.get(peer).map(|u| *u) {
            if now < until {
                return RateDecision::Blacklisted;
            }
            self.blacklisted_until.remove(peer);
            debug!("Blacklist for {} expired", peer);
        }

        match self.limiter.check_key(&peer.to_string()) {
            Ok(()) => RateDecision::Allowed,
            Err(_) => {
                self.blacklisted_until
                    .insert(peer.to_string(), now + self.blacklist);
                RateDecision::Exceeded
            }
        }
    }

    /// Whether `peer` is currently blacklisted
    pub fn is_blacklisted(&self, peer: &str) -> bool {
        self.is_blacklisted_at(peer, Instant::now())
    }

    fn is_blacklisted_at(&self, peer: &str, now: Instant) -> bool {
        self.blacklisted_until
            .get(peer)
            .is_some_and(|until| now < *until)
    }

    /// Number of peers currently tracked
    pub fn peer_count(&self) -> usize {
        self.last_seen.len()
    }

    /// Drop peers idle for `max_idle` whose blacklist has run out, returning
    /// how many were forgotten
    pub fn sweep(&self, max_idle: Duration) -> usize {
        self.sweep_at(max_idle, Instant::now())
    }

    fn sweep_at(&self, max_idle: Duration, now: Instant) -> usize {
        self.blacklisted_until.retain(|_, until| now < *until);
        let before = self.last_seen.len();
        self.last_seen.retain(|peer, seen| {
            now.saturating_duration_since(*seen) < max_idle
                || self.blacklisted_until.contains_key(peer)
        });
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        before - self.last_seen.len()
    }

    /// Forget a peer's blacklist and activity
    pub fn forget(&self, peer: &str) {
        self.blacklisted_until.remove(peer);
        self.last_seen.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_then_blacklist() {
        let limiter = PeerRateLimiter::per_minute(3, Duration::from_secs(300));
        let now = Instant::now();

        for _ in 0..3 {
            assert_eq!(limiter.check_at("peer-a", now), RateDecision::Allowed);
        }
        assert_eq!(limiter.check_at("peer-a", now), RateDecision::Exceeded);
        assert_eq!(limiter.check_at("peer-a", now), RateDecision::Blacklisted);
        assert!(limiter.is_blacklisted("peer-a"));

        // Other peers have their own budget
        assert_eq!(limiter.check_at("peer-b", now), RateDecision::Allowed);
        assert_eq!(limiter.peer_count(), 2);
    }

    #[test]
    fn test_quota_refills() {
        let limiter = PeerRateLimiter::new(2, Duration::from_millis(100), Duration::from_secs(300));

        assert_eq!(limiter.check("p"), RateDecision::Allowed);
        assert_eq!(limiter.check("p"), RateDecision::Allowed);
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(limiter.check("p"), RateDecision::Allowed);
    }

    #[test]
    fn test_blacklist_expires() {
        let limiter = PeerRateLimiter::new(1, Duration::from_millis(50), Duration::from_secs(5));
        let start = Instant::now();

        assert_eq!(limiter.check_at("p", start), RateDecision::Allowed);
        assert_eq!(limiter.check_at("p", start), RateDecision::Exceeded);
        std::thread::sleep(Duration::from_millis(80));

        // The quota has refilled but the blacklist still holds
        assert_eq!(
            limiter.check_at("p", start + Duration::from_secs(4)),
            RateDecision::Blacklisted
        );
        assert!(limiter.is_blacklisted_at("p", start + Duration::from_secs(4)));
        assert!(!limiter.is_blacklisted_at("p", start + Duration::from_secs(6)));
        assert_eq!(
            limiter.check_at("p", start + Duration::from_secs(6)),
            RateDecision::Allowed
        );
    }

    #[test]
    fn test_sweep_drops_idle_peers() {
        let limiter = PeerRateLimiter::per_minute(1, Duration::from_secs(600));
        let start = Instant::now();

        assert_eq!(limiter.check_at("idle-a", start), RateDecision::Allowed);
        assert_eq!(limiter.check_at("idle-b", start), RateDecision::Allowed);
        assert_eq!(limiter.check_at("offender", start), RateDecision::Allowed);
        assert_eq!(limiter.check_at("offender", start), RateDecision::Exceeded);
        assert_eq!(limiter.peer_count(), 3);

        // Nobody is idle yet
        assert_eq!(limiter.sweep_at(Duration::from_secs(120), start), 0);

        // Idle peers go; the blacklisted one stays until its period ends
        let later = start + Duration::from_secs(300);
        assert_eq!(limiter.sweep_at(Duration::from_secs(120), later), 2);
        assert_eq!(limiter.peer_count(), 1);
        assert!(limiter.is_blacklisted_at("offender", later));

        let much_later = start + Duration::from_secs(900);
        assert_eq!(limiter.sweep_at(Duration::from_secs(120), much_later), 1);
        assert_eq!(limiter.peer_count(), 0);
    }

    #[test]
    fn test_forget_clears_blacklist() {
        let limiter = PeerRateLimiter::per_minute(1, Duration::from_secs(300));
        limiter.check("p");
        limiter.check("p");
        assert!(limiter.is_blacklisted("p"));

        limiter.forget("p");
        assert!(!limiter.is_blacklisted("p"));
        assert_eq!(limiter.peer_count(), 0);
    }
}
