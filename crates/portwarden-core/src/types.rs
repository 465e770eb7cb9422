/*!
 * Core data types for Portwarden.
 *
 * This module defines identifiers and the bounded append-only log used for
 * PSRLV histories and the security audit trail.
 */
use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wall-clock timestamp used across records
pub type Timestamp = DateTime<Utc>;

/// A unique identifier for Portwarden resources
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(String);

impl Id {
    /// Create a new ID with a random UUID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an ID from a string
    pub fn from_string<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the ID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&String> for Id {
    fn from(s: &String) -> Self {
        Self::from_string(s)
    }
}

impl From<&Id> for Id {
    fn from(id: &Id) -> Self {
        id.clone()
    }
}

impl From<Uuid> for Id {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.to_string())
    }
}

/// An entry in a [`BoundedLog`] together with its sequence number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequenced<T> {
    /// Monotonic sequence number, starting at 1
    pub seq: u64,
    /// The stored record
    pub record: T,
}

/// Append-only ring buffer with monotonic sequence numbers.
///
/// Once full, the oldest entry is evicted on every append. Sequence numbers
/// keep growing so readers can resume with [`BoundedLog::since`].
#[derive(Debug, Clone)]
pub struct BoundedLog<T> {
    entries: VecDeque<Sequenced<T>>,
    capacity: usize,
    next_seq: u64,
}

impl<T: Clone> BoundedLog<T> {
    /// Create a log retaining at most `capacity` entries (minimum 1)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            next_seq: 1,
        }
    }

    /// Append a record and return its sequence number
    pub fn push(&mut self, record: T) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(Sequenced { seq, record });
        seq
    }

    /// Records with a sequence number strictly greater than `seq`
    pub fn since(&self, seq: u64) -> Vec<Sequenced<T>> {
        self.entries.iter().filter(|e| e.seq > seq).cloned().collect()
    }

    /// The `limit` most recent records, oldest first
    pub fn recent(&self, limit: usize) -> Vec<T> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).map(|e| e.record.clone()).collect()
    }

    /// The most recent record
    pub fn last(&self) -> Option<&T> {
        self.entries.back().map(|e| &e.record)
    }

    /// Sequence number of the most recent record, 0 when empty
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Iterate over retained records, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|e| &e.record)
    }

    /// Number of retained records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no records are retained
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of retained records
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
