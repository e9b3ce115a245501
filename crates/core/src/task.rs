//! Projection task model and its status state machine.
//!
//! A projection task is a unit of deferred work: "re-index this aggregate into
//! the search store". Tasks are inserted by the write side alongside the
//! primary write, claimed in batches by the projection worker and moved to a
//! terminal status once indexing succeeds or the retry budget is spent.
//!
//! ```text
//! PENDING/RETRYING --[claimed]--> in flight (not persisted)
//! in flight --[success]--> DONE
//! in flight --[failure, attempts < max]--> RETRYING (next_run_at = now + backoff)
//! in flight --[failure, attempts >= max]--> DEAD
//! ```

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{AggregateRef, ClaimToken, TaskId};
use crate::retry::RetryPolicy;

/// Longest diagnostic kept in `last_error`.
pub const LAST_ERROR_MAX_CHARS: usize = 2000;

/// Persisted status of a projection task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Retrying,
    Done,
    Dead,
}

impl TaskStatus {
    /// Statuses a claimer picks work from.
    pub const ELIGIBLE: [TaskStatus; 2] = [TaskStatus::Pending, TaskStatus::Retrying];

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Dead)
    }

    pub fn is_eligible(self) -> bool {
        !self.is_terminal()
    }

    /// Whether the state machine has an edge `self -> next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending | TaskStatus::Retrying, TaskStatus::Done) => true,
            (TaskStatus::Pending | TaskStatus::Retrying, TaskStatus::Retrying) => true,
            (TaskStatus::Pending | TaskStatus::Retrying, TaskStatus::Dead) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Retrying => "RETRYING",
            TaskStatus::Done => "DONE",
            TaskStatus::Dead => "DEAD",
        }
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "RETRYING" => Ok(TaskStatus::Retrying),
            "DONE" => Ok(TaskStatus::Done),
            "DEAD" => Ok(TaskStatus::Dead),
            other => Err(DomainError::validation(format!(
                "unknown task status '{other}'"
            ))),
        }
    }
}

/// A task about to be inserted; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProjectionTask {
    pub aggregate: AggregateRef,
    pub next_run_at: DateTime<Utc>,
}

impl NewProjectionTask {
    /// A task that is due immediately.
    pub fn new(aggregate: AggregateRef) -> Self {
        Self {
            aggregate,
            next_run_at: Utc::now(),
        }
    }

    /// A task that becomes due at `at`.
    pub fn due_at(aggregate: AggregateRef, at: DateTime<Utc>) -> Self {
        Self {
            aggregate,
            next_run_at: at,
        }
    }
}

/// A persisted projection task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionTask {
    pub id: TaskId,
    pub aggregate: AggregateRef,
    pub status: TaskStatus,
    pub next_run_at: DateTime<Utc>,
    /// Number of claimed executions so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Token of the most recent claim.
    pub claimed_by: Option<ClaimToken>,
    /// While set and in the future, the task belongs to the claim in `claimed_by`.
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectionTask {
    /// Materialize a freshly inserted task.
    pub fn from_new(id: TaskId, new: NewProjectionTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            aggregate: new.aggregate,
            status: TaskStatus::Pending,
            next_run_at: new.next_run_at,
            attempts: 0,
            last_error: None,
            claimed_by: None,
            claim_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Eligible status and due, ignoring any claim.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_eligible() && self.next_run_at <= now
    }

    /// Held by a claim that has not yet expired.
    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.claim_expires_at.is_some_and(|until| until > now)
    }

    /// Whether a claim at `now` for `eligible` statuses would pick this task.
    pub fn is_claimable(&self, now: DateTime<Utc>, eligible: &[TaskStatus]) -> bool {
        eligible.contains(&self.status) && self.is_due(now) && !self.is_claimed(now)
    }

    /// Record a claim: one more attempt, owned by `token` until `now + lease`.
    pub fn mark_claimed(&mut self, token: ClaimToken, now: DateTime<Utc>, lease: Duration) {
        self.attempts += 1;
        self.claimed_by = Some(token);
        self.claim_expires_at = Some(now + to_chrono(lease));
        self.updated_at = now;
    }

    /// Apply a transition, enforcing the state machine.
    pub fn apply(&mut self, transition: &Transition) -> DomainResult<()> {
        let target = transition.target();
        if !self.status.can_transition_to(target) {
            return Err(DomainError::illegal_transition(self.status, target));
        }

        transition.validate()?;

        match transition {
            Transition::Done { at } => {
                self.updated_at = *at;
            }
            Transition::Retry {
                next_run_at,
                error,
                at,
            } => {
                self.next_run_at = *next_run_at;
                self.last_error = Some(error.clone());
                self.updated_at = *at;
            }
            Transition::Dead { error, at } => {
                self.last_error = Some(error.clone());
                self.updated_at = *at;
            }
        }

        self.status = target;
        self.claim_expires_at = None;
        Ok(())
    }
}

/// Outcome of one claimed execution, as recorded in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "to", rename_all = "snake_case")]
pub enum Transition {
    Done {
        at: DateTime<Utc>,
    },
    Retry {
        next_run_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },
    Dead {
        error: String,
        at: DateTime<Utc>,
    },
}

impl Transition {
    pub fn target(&self) -> TaskStatus {
        match self {
            Transition::Done { .. } => TaskStatus::Done,
            Transition::Retry { .. } => TaskStatus::Retrying,
            Transition::Dead { .. } => TaskStatus::Dead,
        }
    }

    /// Checks that do not depend on the task's current state.
    pub fn validate(&self) -> DomainResult<()> {
        if let Transition::Retry { next_run_at, at, .. } = self {
            if next_run_at <= at {
                return Err(DomainError::validation(
                    "retry must be scheduled strictly in the future",
                ));
            }
        }
        Ok(())
    }

    pub fn succeeded(at: DateTime<Utc>) -> Self {
        Transition::Done { at }
    }

    /// Transition for a failed execution of `task` (already claimed, so
    /// `task.attempts` counts the attempt that just failed).
    pub fn failed(task: &ProjectionTask, error: &str, policy: &RetryPolicy, now: DateTime<Utc>) -> Self {
        let error = truncate_error(error);
        if policy.should_retry(task.attempts) {
            let delay = policy.jittered_delay(task.attempts, &mut rand::thread_rng());
            Transition::Retry {
                next_run_at: now + to_chrono(delay),
                error,
                at: now,
            }
        } else {
            Transition::Dead { error, at: now }
        }
    }
}

/// Cut a diagnostic down to [`LAST_ERROR_MAX_CHARS`] characters.
pub fn truncate_error(msg: &str) -> String {
    match msg.char_indices().nth(LAST_ERROR_MAX_CHARS) {
        Some((idx, _)) => msg[..idx].to_string(),
        None => msg.to_string(),
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    // Out-of-range durations saturate at a century.
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn task(status: TaskStatus, attempts: u32) -> ProjectionTask {
        let mut t = ProjectionTask::from_new(
            TaskId::new(1),
            NewProjectionTask::due_at(AggregateRef::project(10), at(0)),
            at(0),
        );
        t.status = status;
        t.attempts = attempts;
        t
    }

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        for from in [TaskStatus::Done, TaskStatus::Dead] {
            for to in [
                TaskStatus::Pending,
                TaskStatus::Retrying,
                TaskStatus::Done,
                TaskStatus::Dead,
            ] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
        assert!(!TaskStatus::Retrying.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn apply_rejects_leaving_done() {
        let mut t = task(TaskStatus::Done, 1);
        let err = t.apply(&Transition::succeeded(at(5))).unwrap_err();
        assert_eq!(
            err,
            DomainError::illegal_transition(TaskStatus::Done, TaskStatus::Done)
        );
    }

    #[test]
    fn claim_increments_attempts_and_hides_task() {
        let mut t = task(TaskStatus::Pending, 0);
        assert!(t.is_claimable(at(1), &TaskStatus::ELIGIBLE));

        t.mark_claimed(ClaimToken::new(), at(1), Duration::from_secs(60));
        assert_eq!(t.attempts, 1);
        assert!(!t.is_claimable(at(2), &TaskStatus::ELIGIBLE));
        assert!(t.is_claimable(at(61), &TaskStatus::ELIGIBLE));
    }

    #[test]
    fn failure_below_ceiling_retries_in_the_future() {
        let policy = RetryPolicy::default().without_jitter();
        let t = task(TaskStatus::Pending, 1);

        let transition = Transition::failed(&t, "boom", &policy, at(10));
        assert_eq!(
            transition,
            Transition::Retry {
                next_run_at: at(11),
                error: "boom".to_string(),
                at: at(10),
            }
        );
    }

    #[test]
    fn failure_at_ceiling_is_dead() {
        let policy = RetryPolicy::default();
        let mut t = task(TaskStatus::Retrying, policy.max_attempts - 1);
        t.mark_claimed(ClaimToken::new(), at(1), Duration::from_secs(60));

        let transition = Transition::failed(&t, "still down", &policy, at(2));
        assert_eq!(transition.target(), TaskStatus::Dead);

        t.apply(&transition).unwrap();
        assert_eq!(t.status, TaskStatus::Dead);
        assert_eq!(t.attempts, policy.max_attempts);
        assert!(!t.is_claimable(at(10_000), &TaskStatus::ELIGIBLE));
    }

    #[test]
    fn last_error_is_truncated() {
        let long = "é".repeat(LAST_ERROR_MAX_CHARS + 10);
        let t = task(TaskStatus::Pending, 1);
        let transition = Transition::failed(&t, &long, &RetryPolicy::default(), at(1));
        let Transition::Retry { error, .. } = transition else {
            panic!("expected retry");
        };
        assert_eq!(error.chars().count(), LAST_ERROR_MAX_CHARS);
    }

    proptest! {
        /// A task failing on every attempt has strictly increasing
        /// `next_run_at` across RETRYING transitions and dies exactly on the
        /// last allowed attempt.
        #[test]
        fn repeated_failures_back_off_then_die(
            max_attempts in 1u32..12,
            base_ms in 0u64..5_000,
            lag_ms in prop::collection::vec(0i64..10_000, 12),
        ) {
            let policy = RetryPolicy::exponential(
                max_attempts,
                Duration::from_millis(base_ms),
                Duration::from_secs(120),
            );
            let mut t = task(TaskStatus::Pending, 0);
            let mut now = at(0);
            let mut previous_run_at: Option<DateTime<Utc>> = None;

            for lag in lag_ms {
                if t.status.is_terminal() {
                    break;
                }
                // A claim only ever happens once the task is due.
                now = now.max(t.next_run_at) + chrono::Duration::milliseconds(lag);
                t.mark_claimed(ClaimToken::new(), now, Duration::from_secs(300));
                let transition = Transition::failed(&t, "down", &policy, now);
                t.apply(&transition).unwrap();

                if t.status == TaskStatus::Retrying {
                    if let Some(prev) = previous_run_at {
                        prop_assert!(t.next_run_at > prev);
                    }
                    prop_assert!(t.next_run_at > now);
                    previous_run_at = Some(t.next_run_at);
                }
            }

            prop_assert_eq!(t.status, TaskStatus::Dead);
            prop_assert_eq!(t.attempts, max_attempts);
        }
    }
}
