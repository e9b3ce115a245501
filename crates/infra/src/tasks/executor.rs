//! Executes one claimed projection task and records its outcome.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::json;
use tracing::instrument;

use dataracy_core::{AggregateRef, RetryPolicy, Transition};
use dataracy_observability::projection as log;

use super::ports::{AggregateSource, IndexError, SearchIndex, SourceError};
use super::store::{ClaimedTask, ProjectionTaskStore, TaskStoreError};
use crate::clock::Clock;

/// Upper bound on one projection (source read plus index write).
pub const DEFAULT_INDEX_TIMEOUT: Duration = Duration::from_secs(10);

/// Why projecting an aggregate failed. Every variant is retried until the
/// attempt ceiling is reached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectionError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("projection timed out after {0:?}")]
    Timeout(Duration),
    #[error("projection panicked: {0}")]
    Panicked(String),
}

/// What happened to one claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Retrying { next_run_at: DateTime<Utc> },
    Dead,
    /// The claim was superseded; the result was discarded.
    Stale,
}

/// Projects aggregates into the search index.
#[derive(Clone)]
pub struct ProjectionExecutor {
    store: Arc<dyn ProjectionTaskStore>,
    source: Arc<dyn AggregateSource>,
    index: Arc<dyn SearchIndex>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    index_timeout: Duration,
}

impl ProjectionExecutor {
    pub fn new(
        store: Arc<dyn ProjectionTaskStore>,
        source: Arc<dyn AggregateSource>,
        index: Arc<dyn SearchIndex>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            source,
            index,
            clock,
            policy: RetryPolicy::default(),
            index_timeout: DEFAULT_INDEX_TIMEOUT,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_index_timeout(mut self, timeout: Duration) -> Self {
        self.index_timeout = timeout;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn index_timeout(&self) -> Duration {
        self.index_timeout
    }

    /// Bring the index document of `aggregate` in line with its current state.
    ///
    /// Live aggregates are upserted in full. Deleted or vanished aggregates
    /// are hidden with `deleted = true`; if the index never had the document
    /// there is nothing to hide.
    pub async fn project(&self, aggregate: AggregateRef) -> Result<(), ProjectionError> {
        tokio::time::timeout(self.index_timeout, self.sync_document(aggregate))
            .await
            .map_err(|_| ProjectionError::Timeout(self.index_timeout))?
    }

    async fn sync_document(&self, aggregate: AggregateRef) -> Result<(), ProjectionError> {
        match self.source.load(aggregate).await? {
            Some(state) if !state.deleted => {
                self.index.index(aggregate, &state.document).await?;
            }
            _ => match self.index.update(aggregate, &json!({ "deleted": true })).await {
                Ok(()) | Err(IndexError::DocumentMissing(_)) => {}
                Err(err) => return Err(err.into()),
            },
        }
        Ok(())
    }

    /// Run one claimed task and commit its transition.
    ///
    /// Projection failures never surface as errors; they become RETRYING or
    /// DEAD. Only a failure to record the transition is returned, in which
    /// case the task becomes due again once its claim lease expires.
    #[instrument(
        skip(self, claimed),
        fields(task_id = %claimed.task.id, aggregate = %claimed.task.aggregate, attempt = claimed.task.attempts)
    )]
    pub async fn execute(&self, claimed: &ClaimedTask) -> Result<TaskOutcome, TaskStoreError> {
        let task = &claimed.task;
        let index_name = task.aggregate.kind.index_name();

        // Earlier claims ended without a recorded outcome (crash or lost
        // write) and used up the last attempt.
        let transition = if task.attempts > self.policy.max_attempts {
            Transition::Dead {
                error: format!(
                    "claimed {} times without a recorded outcome (max {})",
                    task.attempts, self.policy.max_attempts
                ),
                at: self.clock.now(),
            }
        } else {
            let result = AssertUnwindSafe(self.project(task.aggregate))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(ProjectionError::Panicked(panic_message(panic.as_ref()).to_string())));
            let now = self.clock.now();
            match &result {
                Ok(()) => Transition::succeeded(now),
                Err(err) => Transition::failed(task, &err.to_string(), &self.policy, now),
            }
        };

        match self
            .store
            .record_transition(task.id, claimed.token, &transition)
            .await
        {
            Ok(()) => {}
            Err(TaskStoreError::StaleClaim(id)) => {
                log::stale_claim(&id, &"task re-claimed or already terminal");
                return Ok(TaskOutcome::Stale);
            }
            Err(err) => {
                log::transition_failed(&task.id, &err);
                return Err(err);
            }
        }

        let outcome = match transition {
            Transition::Done { .. } => {
                log::task_done(index_name, &task.id, &task.aggregate, task.attempts);
                TaskOutcome::Done
            }
            Transition::Retry {
                next_run_at, error, ..
            } => {
                log::task_retrying(
                    index_name,
                    &task.id,
                    &task.aggregate,
                    task.attempts,
                    &next_run_at,
                    &error,
                );
                TaskOutcome::Retrying { next_run_at }
            }
            Transition::Dead { error, .. } => {
                log::task_dead(index_name, &task.id, &task.aggregate, task.attempts, &error);
                TaskOutcome::Dead
            }
        };
        Ok(outcome)
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

impl std::fmt::Debug for ProjectionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionExecutor")
            .field("policy", &self.policy)
            .field("index_timeout", &self.index_timeout)
            .finish_non_exhaustive()
    }
}
