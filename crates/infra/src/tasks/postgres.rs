//! Postgres-backed projection task store.
//!
//! ## Claiming
//!
//! `find_batch_for_work` runs one statement inside a transaction:
//!
//! ```sql
//! WITH due AS (SELECT id ... ORDER BY next_run_at, id LIMIT $n FOR UPDATE SKIP LOCKED)
//! UPDATE projection_tasks ... FROM due ... RETURNING ...
//! ```
//!
//! Rows locked by a concurrent claimer are skipped rather than waited on. The
//! update stamps `claimed_by` and `claim_expires_at`, so once the transaction
//! commits the rows stay invisible to other claimers until the claim lease
//! runs out. Outcomes are written back one task at a time, guarded by
//! `claimed_by`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | TaskStoreError |
//! |------------|----------------|
//! | Io, Tls, PoolTimedOut, PoolClosed | `Unavailable` |
//! | Database, decode failures, other | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{instrument, Span};

use async_trait::async_trait;
use dataracy_core::{
    AggregateKind, AggregateRef, ClaimToken, DomainError, NewProjectionTask, ProjectionTask,
    TaskId, TaskStatus, Transition,
};

use super::store::{ClaimedTask, ProjectionTaskStore, TaskStats, TaskStoreError, DEFAULT_CLAIM_LEASE};

const TASK_COLUMNS: &str = "id, aggregate_kind, aggregate_id, status, next_run_at, attempts, \
     last_error, claimed_by, claim_expires_at, created_at, updated_at";

/// Postgres-backed projection task store.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
    claim_lease: Duration,
}

impl PostgresTaskStore {
    /// DDL for the `projection_tasks` table; idempotent.
    pub const SCHEMA: &'static str = include_str!("../../migrations/0001_projection_tasks.sql");

    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }

    pub fn with_claim_lease(mut self, claim_lease: Duration) -> Self {
        self.claim_lease = claim_lease;
        self
    }

    /// Create the table and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), TaskStoreError> {
        sqlx::raw_sql(Self::SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn exists(&self, id: TaskId) -> Result<bool, TaskStoreError> {
        let row = sqlx::query("SELECT 1 FROM projection_tasks WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("exists", e))?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl ProjectionTaskStore for PostgresTaskStore {
    #[instrument(skip(self, task), fields(aggregate = %task.aggregate), err)]
    async fn enqueue(&self, task: NewProjectionTask) -> Result<TaskId, TaskStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO projection_tasks (aggregate_kind, aggregate_id, next_run_at)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(task.aggregate.kind.as_str())
        .bind(task.aggregate.id)
        .bind(task.next_run_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("enqueue", e))?;
        Ok(TaskId::new(id))
    }

    #[instrument(skip(self, tasks), fields(count = tasks.len()), err)]
    async fn enqueue_batch(
        &self,
        tasks: Vec<NewProjectionTask>,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("enqueue_batch", e))?;

        let mut ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            let row = sqlx::query(
                r#"
                INSERT INTO projection_tasks (aggregate_kind, aggregate_id, next_run_at)
                VALUES ($1, $2, $3)
                RETURNING id
                "#,
            )
            .bind(task.aggregate.kind.as_str())
            .bind(task.aggregate.id)
            .bind(task.next_run_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("enqueue_batch", e))?;
            let id: i64 = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("enqueue_batch", e))?;
            ids.push(TaskId::new(id));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("enqueue_batch", e))?;
        Ok(ids)
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn get(&self, id: TaskId) -> Result<Option<ProjectionTask>, TaskStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM projection_tasks WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| ProjectionTask::try_from(TaskRow::from_pg(&r)?))
            .transpose()
    }

    #[instrument(skip(self, eligible), fields(claimed = tracing::field::Empty), err)]
    async fn find_batch_for_work(
        &self,
        now: DateTime<Utc>,
        eligible: &[TaskStatus],
        limit: usize,
    ) -> Result<Vec<ClaimedTask>, TaskStoreError> {
        if limit == 0 || eligible.is_empty() {
            return Ok(Vec::new());
        }

        let statuses: Vec<String> = eligible.iter().map(|s| s.as_str().to_string()).collect();
        let token = ClaimToken::new();
        let lease = chrono::Duration::from_std(self.claim_lease)
            .map_err(|e| TaskStoreError::Invalid(format!("claim lease out of range: {e}")))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("find_batch_for_work", e))?;

        let rows = sqlx::query(&format!(
            r#"
            WITH due AS (
                SELECT id
                FROM projection_tasks
                WHERE status = ANY($1)
                  AND next_run_at <= $2
                  AND (claim_expires_at IS NULL OR claim_expires_at <= $2)
                ORDER BY next_run_at ASC, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE projection_tasks t
            SET attempts = t.attempts + 1,
                claimed_by = $4,
                claim_expires_at = $5,
                updated_at = $2
            FROM due
            WHERE t.id = due.id
            RETURNING {}
            "#,
            prefixed_columns("t")
        ))
        .bind(statuses)
        .bind(now)
        .bind(limit)
        .bind(token.as_uuid())
        .bind(now + lease)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("find_batch_for_work", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("find_batch_for_work", e))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let task: ProjectionTask = TaskRow::from_pg(&row)?.try_into()?;
            claimed.push(ClaimedTask { task, token });
        }
        // RETURNING does not preserve the CTE's order.
        claimed.sort_by_key(|c| (c.task.next_run_at, c.task.id));

        Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }

    #[instrument(skip(self, transition), fields(task_id = %id, to = %transition.target()), err)]
    async fn record_transition(
        &self,
        id: TaskId,
        token: ClaimToken,
        transition: &Transition,
    ) -> Result<(), TaskStoreError> {
        transition.validate()?;

        let (next_run_at, last_error, at) = match transition {
            Transition::Done { at } => (None, None, *at),
            Transition::Retry {
                next_run_at,
                error,
                at,
            } => (Some(*next_run_at), Some(error.as_str()), *at),
            Transition::Dead { error, at } => (None, Some(error.as_str()), *at),
        };

        let result = sqlx::query(
            r#"
            UPDATE projection_tasks
            SET status = $3,
                next_run_at = COALESCE($4, next_run_at),
                last_error = COALESCE($5, last_error),
                claim_expires_at = NULL,
                updated_at = $6
            WHERE id = $1
              AND claimed_by = $2
              AND status IN ('PENDING', 'RETRYING')
            "#,
        )
        .bind(id.get())
        .bind(token.as_uuid())
        .bind(transition.target().as_str())
        .bind(next_run_at)
        .bind(last_error)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_transition", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        if self.exists(id).await? {
            Err(TaskStoreError::StaleClaim(id))
        } else {
            Err(TaskStoreError::NotFound(id))
        }
    }

    #[instrument(skip(self), fields(status = %status), err)]
    async fn list_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<ProjectionTask>, TaskStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM projection_tasks WHERE status = $1 \
             ORDER BY created_at ASC, id ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_status", e))?;

        rows.iter()
            .map(|r| ProjectionTask::try_from(TaskRow::from_pg(r)?))
            .collect()
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn requeue_dead(&self, id: TaskId, now: DateTime<Utc>) -> Result<TaskId, TaskStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO projection_tasks (aggregate_kind, aggregate_id, next_run_at, created_at, updated_at)
            SELECT aggregate_kind, aggregate_id, $2, $2, $2
            FROM projection_tasks
            WHERE id = $1 AND status = 'DEAD'
            RETURNING id
            "#,
        )
        .bind(id.get())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_dead", e))?;

        if let Some(row) = row {
            let fresh: i64 = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("requeue_dead", e))?;
            return Ok(TaskId::new(fresh));
        }
        if self.exists(id).await? {
            Err(TaskStoreError::Invalid(format!(
                "task {id} is not DEAD, only DEAD tasks can be requeued"
            )))
        } else {
            Err(TaskStoreError::NotFound(id))
        }
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM projection_tasks GROUP BY status",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = TaskStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let n = u64::try_from(n).unwrap_or(0);
            match status.parse::<TaskStatus>()? {
                TaskStatus::Pending => stats.pending = n,
                TaskStatus::Retrying => stats.retrying = n,
                TaskStatus::Done => stats.done = n,
                TaskStatus::Dead => stats.dead = n,
            }
        }
        Ok(stats)
    }
}

fn prefixed_columns(alias: &str) -> String {
    TASK_COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TaskStoreError {
    match err {
        sqlx::Error::Io(e) => TaskStoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => TaskStoreError::Unavailable(format!("tls error in {operation}: {e}")),
        sqlx::Error::PoolTimedOut => {
            TaskStoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            TaskStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::Database(db_err) => TaskStoreError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        other => TaskStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct TaskRow {
    id: i64,
    aggregate_kind: String,
    aggregate_id: i64,
    status: String,
    next_run_at: DateTime<Utc>,
    attempts: i32,
    last_error: Option<String>,
    claimed_by: Option<uuid::Uuid>,
    claim_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for TaskRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            id: row.try_get("id")?,
            aggregate_kind: row.try_get("aggregate_kind")?,
            aggregate_id: row.try_get("aggregate_id")?,
            status: row.try_get("status")?,
            next_run_at: row.try_get("next_run_at")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            claimed_by: row.try_get("claimed_by")?,
            claim_expires_at: row.try_get("claim_expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TaskRow {
    fn from_pg(row: &sqlx::postgres::PgRow) -> Result<Self, TaskStoreError> {
        <Self as sqlx::FromRow<_>>::from_row(row).map_err(|e| {
            TaskStoreError::Storage(format!("failed to deserialize task row: {e}"))
        })
    }
}

impl TryFrom<TaskRow> for ProjectionTask {
    type Error = TaskStoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let kind: AggregateKind = row.aggregate_kind.parse()?;
        let attempts = u32::try_from(row.attempts).map_err(|_| {
            DomainError::validation(format!("negative attempts on task {}", row.id))
        })?;
        Ok(ProjectionTask {
            id: TaskId::new(row.id),
            aggregate: AggregateRef::new(kind, row.aggregate_id),
            status: row.status.parse()?,
            next_run_at: row.next_run_at,
            attempts,
            last_error: row.last_error,
            claimed_by: row.claimed_by.map(ClaimToken::from_uuid),
            claim_expires_at: row.claim_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
