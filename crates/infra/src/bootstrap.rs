//! Wiring of stores, workers and locks from configuration.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::config::{InfraConfig, LockConfig, ProjectionConfig};
use crate::lock::{DistributedLockManager, LockBackend};
use crate::tasks::{AggregateSource, PostgresTaskStore, ProjectionExecutor, ProjectionTaskStore, SearchIndex};
use crate::workers::ProjectionClaimer;

/// Install the process-wide tracing subscriber in the configured format.
pub fn init_logging(config: &InfraConfig) {
    dataracy_observability::init_with(config.log_format);
}

/// Connect to Postgres and make sure the task table exists.
pub async fn connect_task_store(config: &InfraConfig) -> anyhow::Result<PostgresTaskStore> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to use the Postgres task store")?;

    let pool = PgPool::connect(database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresTaskStore::new(pool).with_claim_lease(config.projection.claim_lease);
    store
        .ensure_schema()
        .await
        .context("failed to create the projection task schema")?;

    tracing::info!(claim_lease_secs = config.projection.claim_lease.as_secs(), "projection task store ready");
    Ok(store)
}

/// Build a claimer whose executor follows `config`'s retry policy and timeout.
pub fn projection_claimer(
    config: ProjectionConfig,
    store: Arc<dyn ProjectionTaskStore>,
    source: Arc<dyn AggregateSource>,
    index: Arc<dyn SearchIndex>,
    clock: Arc<dyn Clock>,
) -> ProjectionClaimer {
    let executor = ProjectionExecutor::new(store.clone(), source, index, clock.clone())
        .with_policy(config.retry.clone())
        .with_index_timeout(config.index_timeout);
    ProjectionClaimer::new(store, executor, clock, config)
}

pub fn lock_manager(
    config: &LockConfig,
    backend: Arc<dyn LockBackend>,
    interrupt: Option<watch::Receiver<bool>>,
) -> DistributedLockManager {
    let manager = DistributedLockManager::new(backend).with_retry_delay(config.retry_delay);
    match interrupt {
        Some(signal) => manager.with_interrupt(signal),
        None => manager,
    }
}

/// Lock manager backed by the Redis instance at `config.redis_url`.
#[cfg(feature = "redis")]
pub fn redis_lock_manager(
    config: &LockConfig,
    interrupt: Option<watch::Receiver<bool>>,
) -> anyhow::Result<DistributedLockManager> {
    let backend = crate::lock::RedisLockBackend::new(&config.redis_url)
        .with_context(|| format!("invalid REDIS_URL '{}'", config.redis_url))?
        .with_key_prefix(config.key_prefix.clone());
    Ok(lock_manager(config, Arc::new(backend), interrupt))
}
