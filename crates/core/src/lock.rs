//! Lock keys and acquisition options for cross-process critical sections.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Validated, non-blank name of a distributed lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LockKey(String);

impl LockKey {
    pub fn new(key: impl Into<String>) -> DomainResult<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(DomainError::InvalidLockKey(
                "lock key must not be blank".to_string(),
            ));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for LockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for LockKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LockKey> for String {
    fn from(value: LockKey) -> Self {
        value.0
    }
}

/// How long to wait for, and how long to hold, a distributed lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// Bounded wait per acquisition attempt.
    pub wait: Duration,
    /// Lease after which the lock frees itself even if never released.
    pub lease: Duration,
    /// Additional attempts after the first one times out.
    pub retry: u32,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::quick()
    }
}

impl LockOptions {
    pub fn new(wait: Duration, lease: Duration, retry: u32) -> Self {
        Self { wait, lease, retry }
    }

    /// Short uniqueness checks (nickname / e-mail claims at sign-up).
    pub fn quick() -> Self {
        Self::new(Duration::from_millis(300), Duration::from_millis(2000), 2)
    }

    /// Profile modifications that may touch several tables.
    pub fn extended() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_millis(5000), 3)
    }

    /// Total number of acquisition attempts.
    pub fn attempts(&self) -> u32 {
        self.retry.saturating_add(1)
    }
}

/// Key builders for the write paths that must be serialized across processes.
pub mod keys {
    /// Nickname change / claim.
    pub fn nickname(nickname: &str) -> String {
        format!("lock:nickname:{nickname}")
    }

    pub fn signup_email(email: &str) -> String {
        format!("lock:signup:email:{email}")
    }

    pub fn signup_nickname(nickname: &str) -> String {
        format!("lock:signup:nickname:{nickname}")
    }

    /// Any modification of one user's profile.
    pub fn user_modify(user_id: i64) -> String {
        format!("lock:user:modify:{user_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_keys_are_rejected() {
        assert!(LockKey::new("").is_err());
        assert!(LockKey::new("   ").is_err());
        assert_eq!(LockKey::new("lock:a").unwrap().as_str(), "lock:a");
    }

    #[test]
    fn key_deserialization_validates() {
        let ok: LockKey = serde_json::from_str("\"lock:nickname:neo\"").unwrap();
        assert_eq!(ok.as_str(), "lock:nickname:neo");
        assert!(serde_json::from_str::<LockKey>("\" \"").is_err());
    }

    #[test]
    fn key_builders_namespace_their_argument() {
        assert_eq!(keys::nickname("neo"), "lock:nickname:neo");
        assert_eq!(keys::signup_email("a@b.c"), "lock:signup:email:a@b.c");
        assert_eq!(keys::signup_nickname("neo"), "lock:signup:nickname:neo");
        assert_eq!(keys::user_modify(7), "lock:user:modify:7");
    }

    #[test]
    fn attempts_counts_the_first_try() {
        assert_eq!(LockOptions::quick().attempts(), 3);
        assert_eq!(LockOptions::extended().attempts(), 4);
    }
}
