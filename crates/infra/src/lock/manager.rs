//! Cross-process mutual exclusion with bounded wait, lease expiry and retry.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;

use dataracy_core::{LockKey, LockOptions, LockOwner};
use dataracy_observability::lock as log;

use super::backend::{LockBackend, LockBackendError, LockHandle};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Lock failures. Always distinct from the guarded action's own errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// Every attempt timed out while someone else held the key.
    #[error("resource '{key}' is being modified by another request, try again shortly ({attempts} attempts)")]
    AcquisitionFailed { key: String, attempts: u32 },
    #[error("interrupted while waiting for lock '{key}'")]
    Interrupted { key: String },
    #[error("invalid lock key: {0}")]
    InvalidKey(String),
    #[error(transparent)]
    Backend(#[from] LockBackendError),
}

/// Runs actions while holding a named distributed lock.
#[derive(Clone)]
pub struct DistributedLockManager {
    backend: Arc<dyn LockBackend>,
    retry_delay: Duration,
    interrupt: Option<watch::Receiver<bool>>,
}

impl DistributedLockManager {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self {
            backend,
            retry_delay: DEFAULT_RETRY_DELAY,
            interrupt: None,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Abort pending acquisitions once `signal` turns `true`.
    pub fn with_interrupt(mut self, signal: watch::Receiver<bool>) -> Self {
        self.interrupt = Some(signal);
        self
    }

    /// Acquire `key`, making up to `options.attempts()` bounded attempts with
    /// `retry_delay` in between.
    pub async fn acquire(&self, key: &LockKey, options: &LockOptions) -> Result<HeldLock, LockError> {
        let attempts = options.attempts();
        let owner = LockOwner::new();

        for attempt in 1..=attempts {
            let handle = tokio::select! {
                biased;
                _ = interrupted(self.interrupt.clone()) => {
                    log::interrupted(key.as_str());
                    return Err(LockError::Interrupted { key: key.to_string() });
                }
                result = self.backend.try_acquire(key, owner, options.wait, options.lease) => {
                    result.map_err(|err| {
                        log::backend_failed(key.as_str(), &err);
                        LockError::from(err)
                    })?
                }
            };

            if let Some(handle) = handle {
                log::acquired(key.as_str(), attempt);
                return Ok(HeldLock {
                    handle: Some(handle),
                    backend: self.backend.clone(),
                });
            }

            log::attempt_failed(key.as_str(), attempt, attempts);
            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = interrupted(self.interrupt.clone()) => {
                        log::interrupted(key.as_str());
                        return Err(LockError::Interrupted { key: key.to_string() });
                    }
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
        }

        log::retry_exceeded(key.as_str(), attempts);
        Err(LockError::AcquisitionFailed {
            key: key.to_string(),
            attempts,
        })
    }

    /// Run `action` while holding `key`.
    ///
    /// The lock is released after the action returns, fails or panics; a
    /// panic resumes after the release. The action's own error comes back
    /// unchanged, lock failures come back through `E::from`.
    pub async fn execute<T, E, F, Fut>(&self, key: &str, options: LockOptions, action: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let key = LockKey::new(key).map_err(|e| E::from(LockError::InvalidKey(e.to_string())))?;
        self.execute_with_key(&key, options, action).await
    }

    pub async fn execute_with_key<T, E, F, Fut>(
        &self,
        key: &LockKey,
        options: LockOptions,
        action: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let started = log::started(key.as_str());
        let held = self.acquire(key, &options).await.map_err(E::from)?;

        let outcome = AssertUnwindSafe(async { action().await }).catch_unwind().await;
        held.release().await;

        match outcome {
            Ok(Ok(value)) => {
                log::succeeded(key.as_str(), started);
                Ok(value)
            }
            Ok(Err(err)) => {
                log::action_failed(key.as_str());
                Err(err)
            }
            Err(panic) => {
                log::action_panicked(key.as_str());
                std::panic::resume_unwind(panic)
            }
        }
    }
}

impl std::fmt::Debug for DistributedLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLockManager")
            .field("retry_delay", &self.retry_delay)
            .field("interruptible", &self.interrupt.is_some())
            .finish_non_exhaustive()
    }
}

/// Resolves once the interrupt signal is raised; never without a signal.
async fn interrupted(signal: Option<watch::Receiver<bool>>) {
    match signal {
        Some(mut rx) => {
            if rx.wait_for(|raised| *raised).await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

/// A lock held by this process.
///
/// Release explicitly with [`HeldLock::release`]. If dropped while still
/// held (e.g. the owning future was cancelled), release is spawned on the
/// current runtime; the lease bounds the hold time either way.
pub struct HeldLock {
    handle: Option<LockHandle>,
    backend: Arc<dyn LockBackend>,
}

impl HeldLock {
    pub fn handle(&self) -> Option<&LockHandle> {
        self.handle.as_ref()
    }

    /// Release the lock. Failures are logged; the lease expires regardless.
    pub async fn release(mut self) -> bool {
        match self.handle.take() {
            Some(handle) => release(self.backend.as_ref(), &handle).await,
            None => false,
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let backend = self.backend.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                release(backend.as_ref(), &handle).await;
            });
        }
    }
}

impl std::fmt::Debug for HeldLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeldLock").field("handle", &self.handle).finish()
    }
}

async fn release(backend: &dyn LockBackend, handle: &LockHandle) -> bool {
    match backend.release(handle).await {
        Ok(true) => {
            log::released(handle.key.as_str());
            true
        }
        Ok(false) => {
            log::release_skipped(handle.key.as_str());
            false
        }
        Err(err) => {
            log::release_failed(handle.key.as_str(), &err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::backend::InMemoryLockBackend;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, PartialEq)]
    enum AppError {
        Lock(LockError),
        Duplicate(&'static str),
    }

    impl From<LockError> for AppError {
        fn from(err: LockError) -> Self {
            AppError::Lock(err)
        }
    }

    fn manager(backend: &Arc<InMemoryLockBackend>) -> DistributedLockManager {
        DistributedLockManager::new(backend.clone())
    }

    fn key(name: &str) -> LockKey {
        LockKey::new(name).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_executions_on_one_key_never_overlap() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let inside = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicUsize::new(0));
        let options = LockOptions::new(Duration::from_secs(5), Duration::from_secs(30), 0);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = manager(&backend);
            let inside = inside.clone();
            let counter = counter.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .execute("lock:nickname:neo", options, move || async move {
                        assert!(!inside.swap(true, Ordering::SeqCst), "critical sections overlapped");
                        let seen = counter.load(Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        counter.store(seen + 1, Ordering::SeqCst);
                        inside.store(false, Ordering::SeqCst);
                        Ok::<_, AppError>(())
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn unreleased_lock_blocks_until_its_lease_expires() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let lease = Duration::from_secs(2);
        let crashed = backend
            .try_acquire(&key("lock:user:modify:1"), LockOwner::new(), Duration::ZERO, lease)
            .await
            .unwrap()
            .unwrap();

        // Shorter than the lease: every attempt fails.
        let impatient = LockOptions::new(Duration::from_millis(300), lease, 2);
        let err = manager(&backend)
            .execute("lock:user:modify:1", impatient, || async { Ok::<_, AppError>(()) })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AppError::Lock(LockError::AcquisitionFailed {
                key: "lock:user:modify:1".to_string(),
                attempts: 3,
            })
        );
        assert!(crashed.is_valid_at(Instant::now()));

        // Long enough to outlast the lease.
        let patient = LockOptions::new(Duration::from_secs(5), lease, 0);
        let start = Instant::now();
        manager(&backend)
            .execute("lock:user:modify:1", patient, || async { Ok::<_, AppError>(()) })
            .await
            .unwrap();
        assert!(Instant::now() >= crashed.expires_at());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_spaced_by_the_retry_delay() {
        let backend = Arc::new(InMemoryLockBackend::new());
        backend
            .try_acquire(&key("k"), LockOwner::new(), Duration::ZERO, Duration::from_secs(60))
            .await
            .unwrap();

        let start = Instant::now();
        let err = manager(&backend)
            .with_retry_delay(Duration::from_millis(100))
            .acquire(&key("k"), &LockOptions::new(Duration::from_millis(300), Duration::from_secs(1), 2))
            .await
            .unwrap_err();

        assert!(matches!(err, LockError::AcquisitionFailed { attempts: 3, .. }));
        // Three waits of 300ms and two pauses of 100ms.
        assert!(start.elapsed() >= Duration::from_millis(1100));
        assert!(start.elapsed() < Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn action_error_passes_through_after_release() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let err = manager(&backend)
            .execute("lock:signup:email:a@b.c", LockOptions::quick(), || async {
                Err::<(), _>(AppError::Duplicate("email already registered"))
            })
            .await
            .unwrap_err();

        assert_eq!(err, AppError::Duplicate("email already registered"));
        assert_eq!(backend.holder(&key("lock:signup:email:a@b.c")), None);
    }

    #[tokio::test]
    async fn panicking_action_still_releases() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let manager = manager(&backend);

        let result = AssertUnwindSafe(manager.execute("lock:nickname:neo", LockOptions::quick(), || async {
            if true {
                panic!("boom");
            }
            Ok::<(), AppError>(())
        }))
        .catch_unwind()
        .await;

        assert!(result.is_err());
        assert_eq!(backend.holder(&key("lock:nickname:neo")), None);
    }

    #[tokio::test]
    async fn blank_key_fails_without_touching_the_backend() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let ran = AtomicBool::new(false);
        let err = manager(&backend)
            .execute("  ", LockOptions::quick(), || async {
                ran.store(true, Ordering::SeqCst);
                Ok::<_, AppError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Lock(LockError::InvalidKey(_))));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_while_waiting_is_propagated() {
        let backend = Arc::new(InMemoryLockBackend::new());
        backend
            .try_acquire(&key("k"), LockOwner::new(), Duration::ZERO, Duration::from_secs(60))
            .await
            .unwrap();
        let (signal, rx) = watch::channel(false);
        let manager = manager(&backend).with_interrupt(rx);

        let waiting = tokio::spawn(async move {
            manager
                .acquire(&key("k"), &LockOptions::new(Duration::from_secs(10), Duration::from_secs(1), 5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.send(true).unwrap();

        let err = waiting.await.unwrap().unwrap_err();
        assert_eq!(err, LockError::Interrupted { key: "k".to_string() });
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_lock_is_released_in_the_background() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let held = manager(&backend)
            .acquire(&key("k"), &LockOptions::quick())
            .await
            .unwrap();
        assert!(backend.holder(&key("k")).is_some());

        drop(held);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.holder(&key("k")), None);
    }
}
