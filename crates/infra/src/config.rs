//! Configuration loading and representation.
//!
//! Every value has a default; environment variables override them. Parsing
//! goes through a lookup function so tests never touch the process
//! environment.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dataracy_core::{LockOptions, RetryPolicy};
use dataracy_observability::LogFormat;

use crate::tasks::{DEFAULT_CLAIM_LEASE, DEFAULT_INDEX_TIMEOUT};

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

/// Projection claimer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Worker name used in logs.
    pub name: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Tasks of one batch executed at the same time; 1 runs them in order.
    pub max_concurrent: usize,
    pub claim_lease: Duration,
    pub index_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            name: "projection-worker".to_string(),
            poll_interval: Duration::from_secs(3),
            batch_size: 100,
            max_concurrent: 1,
            claim_lease: DEFAULT_CLAIM_LEASE,
            index_timeout: DEFAULT_INDEX_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl ProjectionConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let env = Env(&lookup);

        let config = Self {
            name: env.string("PROJECTION_WORKER_NAME").unwrap_or(defaults.name),
            poll_interval: env
                .millis("PROJECTION_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.poll_interval),
            batch_size: env.parse("PROJECTION_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            max_concurrent: env
                .parse("PROJECTION_MAX_CONCURRENT")?
                .unwrap_or(defaults.max_concurrent),
            claim_lease: env
                .secs("PROJECTION_CLAIM_LEASE_SECS")?
                .unwrap_or(defaults.claim_lease),
            index_timeout: env
                .millis("PROJECTION_INDEX_TIMEOUT_MS")?
                .unwrap_or(defaults.index_timeout),
            retry: RetryPolicy {
                max_attempts: env
                    .parse("PROJECTION_MAX_ATTEMPTS")?
                    .unwrap_or(defaults.retry.max_attempts),
                base_delay: env
                    .millis("PROJECTION_BACKOFF_BASE_MS")?
                    .unwrap_or(defaults.retry.base_delay),
                max_delay: env
                    .millis("PROJECTION_BACKOFF_MAX_MS")?
                    .unwrap_or(defaults.retry.max_delay),
                ..defaults.retry
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("PROJECTION_BATCH_SIZE", self.batch_size as u64)?;
        positive("PROJECTION_MAX_CONCURRENT", self.max_concurrent as u64)?;
        positive("PROJECTION_MAX_ATTEMPTS", u64::from(self.retry.max_attempts))?;
        positive("PROJECTION_POLL_INTERVAL_MS", self.poll_interval.as_millis() as u64)?;
        positive("PROJECTION_CLAIM_LEASE_SECS", self.claim_lease.as_secs())?;
        Ok(())
    }
}

/// Distributed lock settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Options used when a caller does not pass its own.
    pub options: LockOptions,
    /// Pause between acquisition attempts.
    pub retry_delay: Duration,
    pub redis_url: String,
    /// Prepended to every key stored in Redis.
    pub key_prefix: Option<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            options: LockOptions::default(),
            retry_delay: Duration::from_millis(100),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            key_prefix: None,
        }
    }
}

impl LockConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let env = Env(&lookup);

        Ok(Self {
            options: LockOptions {
                wait: env.millis("LOCK_WAIT_MS")?.unwrap_or(defaults.options.wait),
                lease: env.millis("LOCK_LEASE_MS")?.unwrap_or(defaults.options.lease),
                retry: env.parse("LOCK_RETRY")?.unwrap_or(defaults.options.retry),
            },
            retry_delay: env
                .millis("LOCK_RETRY_DELAY_MS")?
                .unwrap_or(defaults.retry_delay),
            redis_url: env.string("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: env.string("LOCK_KEY_PREFIX"),
        })
    }
}

/// Everything the infrastructure layer needs at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfraConfig {
    pub database_url: Option<String>,
    pub log_format: LogFormat,
    pub projection: ProjectionConfig,
    pub lock: LockConfig,
}

impl InfraConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: Env(&lookup).string("DATABASE_URL"),
            log_format: Env(&lookup).parse("LOG_FORMAT")?.unwrap_or_default(),
            projection: ProjectionConfig::from_lookup(&lookup)?,
            lock: LockConfig::from_lookup(&lookup)?,
        })
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, var: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(var)
            .map(|value| {
                value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                    var: var.to_string(),
                    value: value.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn millis(&self, var: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(var)?.map(Duration::from_millis))
    }

    fn secs(&self, var: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(var)?.map(Duration::from_secs))
    }
}

fn positive(var: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            var: var.to_string(),
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}
