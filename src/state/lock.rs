//! State locking for concurrent access protection.
//!
//! Two runs against the same stack must not interleave writes, so `apply`,
//! `destroy` and `refresh` hold a lock for their whole duration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HalldyllError, Result, StateError};

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300;

/// Information about a state lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }

    /// Parses a stored lock.
    pub(crate) fn decode(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| {
            HalldyllError::State(StateError::corrupted(format!("Failed to parse lock: {e}")))
        })
    }

    /// Serializes the lock for storage.
    pub(crate) fn encode(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            HalldyllError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })
    }

    /// Fails with `LockedByOther` unless this lock has expired.
    pub(crate) fn ensure_expired(&self) -> Result<()> {
        if self.is_expired() {
            Ok(())
        } else {
            Err(HalldyllError::State(StateError::LockedByOther {
                holder: self.holder.clone(),
                since: self.acquired_at.to_rfc3339(),
            }))
        }
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(
        |_| String::from("unknown"),
        |h| h.to_string_lossy().to_string(),
    );

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

/// Uses `holder`, or a generated id when it is empty.
pub(crate) fn holder_or_generated(holder: &str) -> String {
    if holder.is_empty() {
        generate_holder_id()
    } else {
        holder.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_creation() {
        let lock = LockInfo::new("test-holder");
        assert_eq!(lock.holder, "test-holder");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > 0);
        assert!(lock.ensure_expired().is_err());
    }

    #[test]
    fn test_expired_lock_can_be_taken() {
        let mut lock = LockInfo::new("old-holder");
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), 0);
        assert!(lock.ensure_expired().is_ok());
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);

        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
        assert_eq!(holder_or_generated("me"), "me");
        assert!(holder_or_generated("").contains(&pid));
    }
}
