//! Distributed locks for cross-process critical sections.
//!
//! - `LockBackend`: the shared lock service (in-memory, or Redis with the
//!   `redis` feature)
//! - `DistributedLockManager`: bounded wait, lease, retry and release around
//!   an action
//! - `LockGuard` / `with_lock`: key builders and option presets wrapped around
//!   a body

pub mod backend;
pub mod guard;
pub mod manager;
#[cfg(feature = "redis")]
pub mod redis;

pub use backend::{InMemoryLockBackend, LockBackend, LockBackendError, LockHandle};
pub use guard::{presets, with_lock, LockGuard, LockKeyError};
pub use manager::{DistributedLockManager, HeldLock, LockError, DEFAULT_RETRY_DELAY};
#[cfg(feature = "redis")]
pub use self::redis::RedisLockBackend;
