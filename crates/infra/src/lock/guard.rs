//! Declarative lock guards: a named key builder plus options, wrapped around
//! a body.

use std::future::Future;
use std::sync::Arc;

use dataracy_core::{LockKey, LockOptions};
use dataracy_observability::lock as log;

use super::manager::{DistributedLockManager, LockError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockKeyError {
    #[error("lock key argument '{0}' is missing")]
    MissingArgument(&'static str),
    #[error("lock key evaluated to a blank string")]
    Blank,
}

impl From<LockKeyError> for LockError {
    fn from(err: LockKeyError) -> Self {
        LockError::InvalidKey(err.to_string())
    }
}

type KeyBuilder<A> = dyn Fn(&A) -> Result<String, LockKeyError> + Send + Sync;

/// Serializes every call whose arguments map to the same key.
pub struct LockGuard<A: ?Sized> {
    name: &'static str,
    key: Box<KeyBuilder<A>>,
    options: LockOptions,
    manager: Arc<DistributedLockManager>,
}

impl<A: ?Sized> LockGuard<A> {
    pub fn new<K>(name: &'static str, manager: Arc<DistributedLockManager>, options: LockOptions, key: K) -> Self
    where
        K: Fn(&A) -> Result<String, LockKeyError> + Send + Sync + 'static,
    {
        Self {
            name,
            key: Box::new(key),
            options,
            manager,
        }
    }

    pub fn with_options(mut self, options: LockOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn options(&self) -> LockOptions {
        self.options
    }

    pub fn key_for(&self, args: &A) -> Result<LockKey, LockKeyError> {
        let raw = (self.key)(args)?;
        LockKey::new(raw).map_err(|_| LockKeyError::Blank)
    }

    /// Run `body` under the lock derived from `args`.
    ///
    /// A key that cannot be built fails before any lock is attempted.
    pub async fn call<T, E, F, Fut>(&self, args: &A, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let key = self.key_for(args).map_err(|err| {
            log::key_rejected(self.name, &err);
            E::from(LockError::from(err))
        })?;
        self.manager.execute_with_key(&key, self.options, body).await
    }
}

impl<A: ?Sized> std::fmt::Debug for LockGuard<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Run `body` while holding `key`.
pub async fn with_lock<T, E, F, Fut>(
    manager: &DistributedLockManager,
    key: &str,
    options: LockOptions,
    body: F,
) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<LockError>,
{
    manager.execute(key, options, body).await
}

/// Guards for the account write paths that must not interleave.
pub mod presets {
    use super::*;
    use dataracy_core::keys;

    pub fn nickname(manager: Arc<DistributedLockManager>) -> LockGuard<str> {
        LockGuard::new("nickname", manager, LockOptions::quick(), |nickname: &str| {
            Ok(keys::nickname(required("nickname", nickname)?))
        })
    }

    pub fn signup_email(manager: Arc<DistributedLockManager>) -> LockGuard<str> {
        LockGuard::new("signup_email", manager, LockOptions::quick(), |email: &str| {
            Ok(keys::signup_email(required("email", email)?))
        })
    }

    pub fn signup_nickname(manager: Arc<DistributedLockManager>) -> LockGuard<str> {
        LockGuard::new("signup_nickname", manager, LockOptions::quick(), |nickname: &str| {
            Ok(keys::signup_nickname(required("nickname", nickname)?))
        })
    }

    pub fn user_modify(manager: Arc<DistributedLockManager>) -> LockGuard<i64> {
        LockGuard::new("user_modify", manager, LockOptions::extended(), |user_id: &i64| {
            Ok(keys::user_modify(*user_id))
        })
    }

    fn required<'a>(name: &'static str, value: &'a str) -> Result<&'a str, LockKeyError> {
        if value.trim().is_empty() {
            return Err(LockKeyError::MissingArgument(name));
        }
        Ok(value)
    }
}
