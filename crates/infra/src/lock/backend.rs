//! Lock backend port and the process-local adapter.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use dataracy_core::{LockKey, LockOwner};

/// A granted lease on a lock key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: LockKey,
    pub owner: LockOwner,
    pub acquired_at: Instant,
    pub lease: Duration,
}

impl LockHandle {
    pub fn expires_at(&self) -> Instant {
        self.acquired_at + self.lease
    }

    /// An expired lease counts as released.
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockBackendError {
    #[error("lock backend connection error: {0}")]
    Connection(String),
    #[error("lock backend command error: {0}")]
    Command(String),
}

/// Shared lock service.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Try to take `key` for `owner`, waiting at most `wait`. The lock frees
    /// itself after `lease` unless released earlier. `None` when the key
    /// stayed held by someone else for the whole wait.
    async fn try_acquire(
        &self,
        key: &LockKey,
        owner: LockOwner,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockHandle>, LockBackendError>;

    /// Release the lock if `handle.owner` still holds it. Returns whether a
    /// lock was actually released; releasing a lock that expired or belongs
    /// to someone else is a no-op.
    async fn release(&self, handle: &LockHandle) -> Result<bool, LockBackendError>;
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    owner: LockOwner,
    expires_at: Instant,
}

/// Process-local lock backend for tests and single-node development.
///
/// Waiters are woken on release and otherwise re-check when the current
/// lease or their own wait runs out.
#[derive(Debug, Default)]
pub struct InMemoryLockBackend {
    leases: Mutex<HashMap<String, Lease>>,
    released: Notify,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `key`, if its lease is still running.
    pub fn holder(&self, key: &LockKey) -> Option<LockOwner> {
        let leases = self.leases().ok()?;
        leases
            .get(key.as_str())
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.owner)
    }

    fn leases(&self) -> Result<MutexGuard<'_, HashMap<String, Lease>>, LockBackendError> {
        self.leases
            .lock()
            .map_err(|_| LockBackendError::Command("lock table mutex poisoned".to_string()))
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(
        &self,
        key: &LockKey,
        owner: LockOwner,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockHandle>, LockBackendError> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.released.notified();
            let wake_at = {
                let mut leases = self.leases()?;
                let now = Instant::now();
                match leases.get(key.as_str()) {
                    Some(current) if current.expires_at > now => {
                        if now >= deadline {
                            return Ok(None);
                        }
                        current.expires_at.min(deadline)
                    }
                    _ => {
                        leases.insert(
                            key.as_str().to_string(),
                            Lease {
                                owner,
                                expires_at: now + lease,
                            },
                        );
                        return Ok(Some(LockHandle {
                            key: key.clone(),
                            owner,
                            acquired_at: now,
                            lease,
                        }));
                    }
                }
            };

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn release(&self, handle: &LockHandle) -> Result<bool, LockBackendError> {
        let released = {
            let mut leases = self.leases()?;
            match leases.get(handle.key.as_str()) {
                Some(current) if current.owner == handle.owner => {
                    let live = current.expires_at > Instant::now();
                    leases.remove(handle.key.as_str());
                    live
                }
                _ => false,
            }
        };
        if released {
            self.released.notify_waiters();
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(name: &str) -> LockKey {
        LockKey::new(name).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn second_owner_times_out_while_lease_runs() {
        let backend = InMemoryLockBackend::new();
        let first = backend
            .try_acquire(&key("k"), LockOwner::new(), Duration::ZERO, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(first.is_some());

        let started = Instant::now();
        let second = backend
            .try_acquire(&key("k"), LockOwner::new(), Duration::from_millis(300), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(second.is_none());
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_is_woken_by_release() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let held = backend
            .try_acquire(&key("k"), LockOwner::new(), Duration::ZERO, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let waiter = {
            let backend = backend.clone();
            tokio::spawn(async move {
                backend
                    .try_acquire(&key("k"), LockOwner::new(), Duration::from_secs(10), Duration::from_secs(1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(backend.release(&held).await.unwrap());

        let acquired = waiter.await.unwrap().unwrap().unwrap();
        assert!(acquired.acquired_at < held.acquired_at + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_free_and_cannot_be_released_by_old_owner() {
        let backend = InMemoryLockBackend::new();
        let old = backend
            .try_acquire(&key("k"), LockOwner::new(), Duration::ZERO, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!old.is_valid_at(Instant::now()));
        let new = backend
            .try_acquire(&key("k"), LockOwner::new(), Duration::ZERO, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        assert!(!backend.release(&old).await.unwrap());
        assert_eq!(backend.holder(&key("k")), Some(new.owner));
        assert!(backend.release(&new).await.unwrap());
        assert_eq!(backend.holder(&key("k")), None);
    }
}
