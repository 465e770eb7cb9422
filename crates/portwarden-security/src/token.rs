/*!
 * Token Manager.
 *
 * Issues mutual token pairs bound 1:1 to a permission set. The local token
 * is the secret presented on every operation; the peer token is what the
 * remote side proves it holds during [`TokenManager::authenticate`].
 * Secrets never leave this module except in the freshly issued
 * [`TokenPair`]; listings and audit events carry a fingerprint instead.
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::{Choice, ConstantTimeEq};
use tracing::debug;

use portwarden_core::error::Error as CoreError;
use portwarden_core::types::{Id, Timestamp};

use crate::error::{Result, SecurityError};

/// Token entropy in bytes
pub const TOKEN_BYTES: usize = 32;

/// Length of the hex fingerprint shown in listings and audit events
pub const FINGERPRINT_LEN: usize = 16;

/// Operation a token may be authorized for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Receive bytes
    Read,
    /// Send bytes, flush or drain
    Write,
    /// Open, close or change options
    Configure,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Read => write!(f, "read"),
            Operation::Write => write!(f, "write"),
            Operation::Configure => write!(f, "configure"),
        }
    }
}

/// Trust tier recorded with a permission set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// Remote peers
    #[default]
    Standard,
    /// Internal governors
    Elevated,
    /// Operators
    Administrative,
}

/// Permissions bound to a token pair at creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPermissions {
    /// The only port this token may touch
    pub port_id: Id,
    /// May read
    pub read: bool,
    /// May write
    pub write: bool,
    /// May configure
    pub configure: bool,
    /// Trust tier
    pub security_level: SecurityLevel,
}

impl TokenPermissions {
    /// No permissions on `port_id`
    pub fn none<I: Into<Id>>(port_id: I) -> Self {
        Self {
            port_id: port_id.into(),
            read: false,
            write: false,
            configure: false,
            security_level: SecurityLevel::Standard,
        }
    }

    /// Read-only access to `port_id`
    pub fn read_only<I: Into<Id>>(port_id: I) -> Self {
        Self {
            read: true,
            ..Self::none(port_id)
        }
    }

    /// Full access to `port_id`
    pub fn full<I: Into<Id>>(port_id: I) -> Self {
        Self {
            read: true,
            write: true,
            configure: true,
            ..Self::none(port_id)
        }
    }

    /// Set the trust tier
    pub fn with_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }

    /// Whether the permission flag for `op` is set
    pub fn allows(&self, op: Operation) -> bool {
        match op {
            Operation::Read => self.read,
            Operation::Write => self.write,
            Operation::Configure => self.configure,
        }
    }
}

/// A freshly issued or renewed credential pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    /// Secret presented with every operation
    pub local_token: String,
    /// Secret the peer proves it holds
    pub peer_token: String,
    /// Issue time
    pub created_at: Timestamp,
    /// Expiry time
    pub expires_at: Timestamp,
    /// Whether renew is allowed
    pub renewable: bool,
    /// Last successful use
    pub last_used: Option<Timestamp>,
}

impl TokenPair {
    /// Whether the pair has expired at `now`
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// Listing entry; carries no secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSummary {
    /// Fingerprint of the local token
    pub fingerprint: String,
    /// Bound permissions
    pub permissions: TokenPermissions,
    /// Issue time
    pub created_at: Timestamp,
    /// Expiry time
    pub expires_at: Timestamp,
    /// Whether renew is allowed
    pub renewable: bool,
    /// Whether the pair has been revoked
    pub revoked: bool,
    /// Last successful use
    pub last_used: Option<Timestamp>,
}

/// Why a token cannot be used right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenRejection {
    /// No token was presented
    Missing,
    /// No pair matches
    Unknown,
    /// The pair expired
    Expired,
    /// The pair was revoked
    Revoked,
}

impl fmt::Display for TokenRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenRejection::Missing => write!(f, "missing token"),
            TokenRejection::Unknown => write!(f, "unknown token"),
            TokenRejection::Expired => write!(f, "expired token"),
            TokenRejection::Revoked => write!(f, "revoked token"),
        }
    }
}

#[derive(Debug, Clone)]
struct TokenRecord {
    pair: TokenPair,
    permissions: TokenPermissions,
    grant: chrono::Duration,
    revoked: bool,
}

/// SHA-256 fingerprint of a token, safe to log
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut hexed = hex::encode(digest);
    hexed.truncate(FINGERPRINT_LEN);
    hexed
}

/// Compare two secrets without leaking where they differ
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    ct_eq(a, b).into()
}

fn ct_eq(a: &str, b: &str) -> Choice {
    let max_len = a.len().max(b.len());
    let mut a_padded = vec![0u8; max_len];
    let mut b_padded = vec![0xFFu8; max_len];
    a_padded[..a.len()].copy_from_slice(a.as_bytes());
    b_padded[..b.len()].copy_from_slice(b.as_bytes());
    a.len().ct_eq(&b.len()) & a_padded.ct_eq(&b_padded)
}

fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

/// Issues, checks, renews and revokes token pairs
#[derive(Debug)]
pub struct TokenManager {
    tokens: RwLock<HashMap<String, TokenRecord>>,
    default_expiry: Duration,
}

impl TokenManager {
    /// Create a manager whose pairs expire after `default_expiry` unless told otherwise
    pub fn new(default_expiry: Duration) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            default_expiry,
        }
    }

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, TokenRecord>>> {
        self.tokens
            .read()
            .map_err(|_| CoreError::runtime("Failed to acquire read lock on token table").into())
    }

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, TokenRecord>>> {
        self.tokens
            .write()
            .map_err(|_| CoreError::runtime("Failed to acquire write lock on token table").into())
    }

    /// Issue a renewable pair bound to `permissions`
    pub fn generate_token_pair(
        &self,
        permissions: TokenPermissions,
        expires_in: Option<Duration>,
    ) -> Result<TokenPair> {
        self.issue(permissions, expires_in, true)
    }

    /// Issue a pair, choosing whether it may be renewed
    pub fn issue(
        &self,
        permissions: TokenPermissions,
        expires_in: Option<Duration>,
        renewable: bool,
    ) -> Result<TokenPair> {
        let grant = to_chrono(expires_in.unwrap_or(self.default_expiry));
        let created_at = chrono::Utc::now();
        let pair = TokenPair {
            local_token: random_token(),
            peer_token: random_token(),
            created_at,
            expires_at: created_at.checked_add_signed(grant).unwrap_or(created_at),
            renewable,
            last_used: None,
        };

        debug!(
            "Issued token {} for port {}",
            fingerprint(&pair.local_token),
            permissions.port_id
        );
        self.write_lock()?.insert(
            pair.local_token.clone(),
            TokenRecord {
                pair: pair.clone(),
                permissions,
                grant,
                revoked: false,
            },
        );
        Ok(pair)
    }

    /// Look up a usable pair and return its permissions
    pub fn check(&self, local_token: Option<&str>) -> std::result::Result<TokenPermissions, TokenRejection> {
        let token = match local_token {
            Some(token) if !token.is_empty() => token,
            _ => return Err(TokenRejection::Missing),
        };
        let tokens = self.tokens.read().map_err(|_| TokenRejection::Unknown)?;
        let record = tokens.get(token).ok_or(TokenRejection::Unknown)?;
        if record.revoked {
            return Err(TokenRejection::Revoked);
        }
        if record.pair.is_expired_at(chrono::Utc::now()) {
            return Err(TokenRejection::Expired);
        }
        Ok(record.permissions.clone())
    }

    /// Record a successful use
    pub fn touch(&self, local_token: &str) {
        if let Ok(mut tokens) = self.tokens.write() {
            if let Some(record) = tokens.get_mut(local_token) {
                record.pair.last_used = Some(chrono::Utc::now());
            }
        }
    }

    /// Mutual check: both secrets must belong to the same usable pair.
    ///
    /// Every stored pair is compared so the time taken does not depend on
    /// which pair, if any, matches.
    pub fn authenticate(&self, local_token: &str, peer_token: &str) -> bool {
        let Ok(tokens) = self.tokens.read() else {
            return false;
        };
        let now = chrono::Utc::now();
        let mut matched = Choice::from(0u8);
        for record in tokens.values() {
            let usable = Choice::from(u8::from(!record.revoked && !record.pair.is_expired_at(now)));
            matched |= ct_eq(&record.pair.local_token, local_token)
                & ct_eq(&record.pair.peer_token, peer_token)
                & usable;
        }
        matched.into()
    }

    /// Extend an unexpired, unrevoked, renewable pair by its original grant
    pub fn renew_token(&self, local_token: &str) -> Result<TokenPair> {
        let mut tokens = self.write_lock()?;
        let record = tokens.get_mut(local_token).ok_or(SecurityError::UnknownToken)?;
        if record.revoked {
            return Err(SecurityError::TokenRevoked);
        }
        if record.pair.is_expired_at(chrono::Utc::now()) {
            return Err(SecurityError::TokenExpired);
        }
        if !record.pair.renewable {
            return Err(SecurityError::NotRenewable);
        }
        record.pair.expires_at = record
            .pair
            .expires_at
            .checked_add_signed(record.grant)
            .unwrap_or(record.pair.expires_at);
        Ok(record.pair.clone())
    }

    /// Revoke a pair immediately and permanently
    pub fn revoke_token(&self, local_token: &str) -> Result<TokenPermissions> {
        let mut tokens = self.write_lock()?;
        let record = tokens.get_mut(local_token).ok_or(SecurityError::UnknownToken)?;
        record.revoked = true;
        Ok(record.permissions.clone())
    }

    /// Permissions bound to a pair, whatever its state
    pub fn get_permissions(&self, local_token: &str) -> Option<TokenPermissions> {
        self.read_lock()
            .ok()?
            .get(local_token)
            .map(|record| record.permissions.clone())
    }

    /// Every pair, fingerprinted
    pub fn list_tokens(&self) -> Result<Vec<TokenSummary>> {
        let tokens = self.read_lock()?;
        let mut summaries: Vec<TokenSummary> = tokens
            .iter()
            .map(|(token, record)| TokenSummary {
                fingerprint: fingerprint(token),
                permissions: record.permissions.clone(),
                created_at: record.pair.created_at,
                expires_at: record.pair.expires_at,
                renewable: record.pair.renewable,
                revoked: record.revoked,
                last_used: record.pair.last_used,
            })
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        Ok(summaries)
    }

    /// Drop expired and revoked pairs, returning the fingerprints removed
    pub fn sweep_expired(&self) -> Result<Vec<(String, TokenPermissions)>> {
        let now = chrono::Utc::now();
        let mut tokens = self.write_lock()?;
        let stale: Vec<String> = tokens
            .iter()
            .filter(|(_, record)| record.revoked || record.pair.is_expired_at(now))
            .map(|(token, _)| token.clone())
            .collect();

        Ok(stale
            .into_iter()
            .filter_map(|token| {
                tokens
                    .remove(&token)
                    .map(|record| (fingerprint(&token), record.permissions))
            })
            .collect())
    }

    /// Number of stored pairs
    pub fn len(&self) -> usize {
        self.read_lock().map(|tokens| tokens.len()).unwrap_or(0)
    }

    /// Whether no pairs are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TokenManager {
        TokenManager::new(Duration::from_secs(3600))
    }

    #[test]
    fn test_tokens_are_256_bit_hex_and_distinct() -> Result<()> {
        let tm = manager();
        let pair = tm.generate_token_pair(TokenPermissions::full("COM1"), None)?;
        assert_eq!(pair.local_token.len(), TOKEN_BYTES * 2);
        assert!(pair.local_token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(pair.local_token, pair.peer_token);

        let other = tm.generate_token_pair(TokenPermissions::full("COM1"), None)?;
        assert_ne!(pair.local_token, other.local_token);
        assert_eq!(
            pair.expires_at - pair.created_at,
            chrono::Duration::seconds(3600)
        );
        Ok(())
    }

    #[test]
    fn test_check_rejections() -> Result<()> {
        let tm = manager();
        assert_eq!(tm.check(None), Err(TokenRejection::Missing));
        assert_eq!(tm.check(Some("")), Err(TokenRejection::Missing));
        assert_eq!(tm.check(Some("feed")), Err(TokenRejection::Unknown));

        let expired = tm.generate_token_pair(TokenPermissions::full("COM1"), Some(Duration::ZERO))?;
        assert_eq!(tm.check(Some(&expired.local_token)), Err(TokenRejection::Expired));

        let revoked = tm.generate_token_pair(TokenPermissions::full("COM1"), None)?;
        tm.revoke_token(&revoked.local_token)?;
        assert_eq!(tm.check(Some(&revoked.local_token)), Err(TokenRejection::Revoked));
        Ok(())
    }

    #[test]
    fn test_authenticate_requires_matching_pair() -> Result<()> {
        let tm = manager();
        let a = tm.generate_token_pair(TokenPermissions::full("COM1"), None)?;
        let b = tm.generate_token_pair(TokenPermissions::full("COM2"), None)?;

        assert!(tm.authenticate(&a.local_token, &a.peer_token));
        assert!(!tm.authenticate(&a.local_token, &b.peer_token));
        assert!(!tm.authenticate(&a.local_token, ""));

        tm.revoke_token(&a.local_token)?;
        assert!(!tm.authenticate(&a.local_token, &a.peer_token));
        Ok(())
    }

    #[test]
    fn test_renew_extends_by_original_grant() -> Result<()> {
        let tm = manager();
        let perms = TokenPermissions::read_only("COM3");
        let pair = tm.generate_token_pair(perms.clone(), Some(Duration::from_secs(60)))?;

        let renewed = tm.renew_token(&pair.local_token)?;
        assert_eq!(
            renewed.expires_at - pair.expires_at,
            chrono::Duration::seconds(60)
        );
        assert_eq!(tm.get_permissions(&pair.local_token), Some(perms));
        Ok(())
    }

    #[test]
    fn test_renew_fails_when_expired_revoked_or_fixed() -> Result<()> {
        let tm = manager();

        let expired = tm.generate_token_pair(TokenPermissions::full("COM1"), Some(Duration::ZERO))?;
        assert!(matches!(
            tm.renew_token(&expired.local_token),
            Err(SecurityError::TokenExpired)
        ));

        let revoked = tm.generate_token_pair(TokenPermissions::full("COM1"), None)?;
        tm.revoke_token(&revoked.local_token)?;
        assert!(matches!(
            tm.renew_token(&revoked.local_token),
            Err(SecurityError::TokenRevoked)
        ));

        let fixed = tm.issue(TokenPermissions::full("COM1"), None, false)?;
        assert!(matches!(
            tm.renew_token(&fixed.local_token),
            Err(SecurityError::NotRenewable)
        ));

        assert!(matches!(tm.renew_token("nope"), Err(SecurityError::UnknownToken)));
        Ok(())
    }

    #[test]
    fn test_listing_never_exposes_secrets() -> Result<()> {
        let tm = manager();
        let pair = tm.generate_token_pair(TokenPermissions::full("COM1"), None)?;

        let listed = tm.list_tokens()?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].fingerprint, fingerprint(&pair.local_token));
        assert_eq!(listed[0].fingerprint.len(), FINGERPRINT_LEN);
        let rendered = format!("{:?}", listed);
        assert!(!rendered.contains(&pair.local_token));
        assert!(!rendered.contains(&pair.peer_token));
        Ok(())
    }

    #[test]
    fn test_sweep_removes_expired_and_revoked() -> Result<()> {
        let tm = manager();
        tm.generate_token_pair(TokenPermissions::full("COM1"), Some(Duration::ZERO))?;
        let revoked = tm.generate_token_pair(TokenPermissions::full("COM2"), None)?;
        tm.revoke_token(&revoked.local_token)?;
        let live = tm.generate_token_pair(TokenPermissions::full("COM3"), None)?;

        assert_eq!(tm.sweep_expired()?.len(), 2);
        assert_eq!(tm.len(), 1);
        assert!(tm.check(Some(&live.local_token)).is_ok());
        Ok(())
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(constant_time_eq("", ""));
    }
}
