//! Redis-backed lock backend.
//!
//! - **Acquire**: `SET key owner NX PX lease`, polled until the wait runs out
//! - **Release**: compare-and-delete script, so only the owner can delete the
//!   key and an expired lock taken over by someone else is left alone
//! - **Lease**: Redis expires the key, which frees locks of crashed holders
//! - **Connection**: one `ConnectionManager`, which reconnects after a dropped
//!   socket or a Redis restart

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::instrument;

use dataracy_core::{LockKey, LockOwner};

use super::backend::{LockBackend, LockBackendError, LockHandle};

/// Delay between `SET NX` attempts while waiting.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub struct RedisLockBackend {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    key_prefix: Option<String>,
    poll_interval: Duration,
    release_script: redis::Script,
}

impl RedisLockBackend {
    /// Create a backend for `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// The connection is opened lazily on first use.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LockBackendError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockBackendError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            key_prefix: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            release_script: redis::Script::new(RELEASE_SCRIPT),
        })
    }

    pub fn with_key_prefix(mut self, prefix: Option<String>) -> Self {
        self.key_prefix = prefix;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn redis_key(&self, key: &LockKey) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}{key}"),
            None => key.as_str().to_string(),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, LockBackendError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                self.client
                    .get_connection_manager()
                    .await
                    .map_err(|e| LockBackendError::Connection(e.to_string()))
            })
            .await?;
        Ok(conn.clone())
    }
}

impl std::fmt::Debug for RedisLockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockBackend")
            .field("connected", &self.conn.initialized())
            .field("key_prefix", &self.key_prefix)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    #[instrument(skip(self, key), fields(key = %key), err)]
    async fn try_acquire(
        &self,
        key: &LockKey,
        owner: LockOwner,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockHandle>, LockBackendError> {
        let mut conn = self.connection().await?;
        let redis_key = self.redis_key(key);
        let owner_value = owner.to_string();
        let lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX).max(1);
        let deadline = Instant::now() + wait;

        loop {
            let started = Instant::now();
            let reply: Option<String> = redis::cmd("SET")
                .arg(&redis_key)
                .arg(&owner_value)
                .arg("NX")
                .arg("PX")
                .arg(lease_ms)
                .query_async(&mut conn)
                .await
                .map_err(|e| LockBackendError::Command(format!("SET NX failed: {e}")))?;

            if reply.is_some() {
                return Ok(Some(LockHandle {
                    key: key.clone(),
                    owner,
                    acquired_at: started,
                    lease,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    #[instrument(skip(self, handle), fields(key = %handle.key), err)]
    async fn release(&self, handle: &LockHandle) -> Result<bool, LockBackendError> {
        let mut conn = self.connection().await?;
        let deleted: i64 = self
            .release_script
            .key(self.redis_key(&handle.key))
            .arg(handle.owner.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockBackendError::Command(format!("release script failed: {e}")))?;
        Ok(deleted == 1)
    }
}
