//! Projection task storage: the port and the in-memory adapter.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dataracy_core::{
    ClaimToken, DomainError, NewProjectionTask, ProjectionTask, TaskId, TaskStatus, Transition,
};

/// How long a claim keeps its tasks away from other claimers.
///
/// If the claiming process dies, the tasks become due again once this
/// elapses.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(300);

/// A task handed to one claimer, together with the token that proves
/// ownership when recording its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub task: ProjectionTask,
    pub token: ClaimToken,
}

impl ClaimedTask {
    pub fn id(&self) -> TaskId {
        self.task.id
    }
}

/// Durable table of projection tasks.
#[async_trait]
pub trait ProjectionTaskStore: Send + Sync {
    /// Insert a PENDING task.
    async fn enqueue(&self, task: NewProjectionTask) -> Result<TaskId, TaskStoreError>;

    /// Insert several PENDING tasks atomically.
    async fn enqueue_batch(
        &self,
        tasks: Vec<NewProjectionTask>,
    ) -> Result<Vec<TaskId>, TaskStoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<ProjectionTask>, TaskStoreError>;

    /// Atomically claim up to `limit` tasks whose status is in `eligible` and
    /// whose `next_run_at <= now`, ordered by `next_run_at` then id.
    ///
    /// Tasks held by a concurrent claim are skipped, never waited on. Each
    /// claimed task has its `attempts` incremented.
    async fn find_batch_for_work(
        &self,
        now: DateTime<Utc>,
        eligible: &[TaskStatus],
        limit: usize,
    ) -> Result<Vec<ClaimedTask>, TaskStoreError>;

    /// Record the outcome of a claimed execution.
    ///
    /// Fails with [`TaskStoreError::StaleClaim`] when the task has since been
    /// re-claimed under another token or is already terminal.
    async fn record_transition(
        &self,
        id: TaskId,
        token: ClaimToken,
        transition: &Transition,
    ) -> Result<(), TaskStoreError>;

    /// Tasks with `status`, oldest first.
    async fn list_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<ProjectionTask>, TaskStoreError>;

    /// Schedule a fresh PENDING task for the aggregate of a DEAD task.
    ///
    /// The dead task itself stays DEAD.
    async fn requeue_dead(&self, id: TaskId, now: DateTime<Utc>) -> Result<TaskId, TaskStoreError>;

    async fn stats(&self) -> Result<TaskStats, TaskStoreError>;
}

/// Task store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("stale claim on task {0}")]
    StaleClaim(TaskId),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl TaskStoreError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TaskStoreError::Unavailable(_) | TaskStoreError::Storage(_))
    }
}

/// Task counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TaskStats {
    pub pending: u64,
    pub retrying: u64,
    pub done: u64,
    pub dead: u64,
}

impl TaskStats {
    pub fn total(&self) -> u64 {
        self.pending + self.retrying + self.done + self.dead
    }

    fn count(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Retrying => self.retrying += 1,
            TaskStatus::Done => self.done += 1,
            TaskStatus::Dead => self.dead += 1,
        }
    }
}

#[derive(Debug, Default)]
struct Tasks {
    next_id: i64,
    rows: BTreeMap<TaskId, ProjectionTask>,
}

impl Tasks {
    fn insert(&mut self, new: NewProjectionTask, now: DateTime<Utc>) -> TaskId {
        self.next_id += 1;
        let id = TaskId::new(self.next_id);
        self.rows.insert(id, ProjectionTask::from_new(id, new, now));
        id
    }
}

/// In-memory task store for tests/dev.
///
/// One mutex serializes every operation, which gives the claim the same
/// effect as skip-locked row locking: a task is handed to at most one claim.
#[derive(Debug)]
pub struct InMemoryTaskStore {
    tasks: Mutex<Tasks>,
    claim_lease: Duration,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_claim_lease(DEFAULT_CLAIM_LEASE)
    }

    pub fn with_claim_lease(claim_lease: Duration) -> Self {
        Self {
            tasks: Mutex::new(Tasks::default()),
            claim_lease,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tasks>, TaskStoreError> {
        self.tasks
            .lock()
            .map_err(|_| TaskStoreError::Storage("task table mutex poisoned".to_string()))
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProjectionTaskStore for InMemoryTaskStore {
    async fn enqueue(&self, task: NewProjectionTask) -> Result<TaskId, TaskStoreError> {
        let mut tasks = self.lock()?;
        Ok(tasks.insert(task, Utc::now()))
    }

    async fn enqueue_batch(
        &self,
        new_tasks: Vec<NewProjectionTask>,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        let mut tasks = self.lock()?;
        let now = Utc::now();
        Ok(new_tasks
            .into_iter()
            .map(|task| tasks.insert(task, now))
            .collect())
    }

    async fn get(&self, id: TaskId) -> Result<Option<ProjectionTask>, TaskStoreError> {
        let tasks = self.lock()?;
        Ok(tasks.rows.get(&id).cloned())
    }

    async fn find_batch_for_work(
        &self,
        now: DateTime<Utc>,
        eligible: &[TaskStatus],
        limit: usize,
    ) -> Result<Vec<ClaimedTask>, TaskStoreError> {
        if limit == 0 || eligible.is_empty() {
            return Ok(Vec::new());
        }

        let mut tasks = self.lock()?;
        let mut due: Vec<(DateTime<Utc>, TaskId)> = tasks
            .rows
            .values()
            .filter(|t| t.is_claimable(now, eligible))
            .map(|t| (t.next_run_at, t.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let token = ClaimToken::new();
        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(task) = tasks.rows.get_mut(&id) {
                task.mark_claimed(token, now, self.claim_lease);
                claimed.push(ClaimedTask {
                    task: task.clone(),
                    token,
                });
            }
        }
        Ok(claimed)
    }

    async fn record_transition(
        &self,
        id: TaskId,
        token: ClaimToken,
        transition: &Transition,
    ) -> Result<(), TaskStoreError> {
        let mut tasks = self.lock()?;
        let task = tasks.rows.get_mut(&id).ok_or(TaskStoreError::NotFound(id))?;
        if task.claimed_by != Some(token) || task.status.is_terminal() {
            return Err(TaskStoreError::StaleClaim(id));
        }
        // Apply to a copy so a rejected transition leaves the row untouched.
        let mut updated = task.clone();
        updated.apply(transition)?;
        *task = updated;
        Ok(())
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<ProjectionTask>, TaskStoreError> {
        let tasks = self.lock()?;
        let mut result: Vec<_> = tasks
            .rows
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        result.sort_by_key(|t| (t.created_at, t.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn requeue_dead(&self, id: TaskId, now: DateTime<Utc>) -> Result<TaskId, TaskStoreError> {
        let mut tasks = self.lock()?;
        let dead = tasks.rows.get(&id).ok_or(TaskStoreError::NotFound(id))?;
        if dead.status != TaskStatus::Dead {
            return Err(TaskStoreError::Invalid(format!(
                "task {id} is {}, only DEAD tasks can be requeued",
                dead.status
            )));
        }
        let aggregate = dead.aggregate;
        Ok(tasks.insert(NewProjectionTask::due_at(aggregate, now), now))
    }

    async fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        let tasks = self.lock()?;
        let mut stats = TaskStats::default();
        for task in tasks.rows.values() {
            stats.count(task.status);
        }
        Ok(stats)
    }
}
