//! `dataracy-core`: domain building blocks for search-index projection and
//! cross-process locking.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the projection task state machine, retry policy and lock
//! options. Storage, lock backends and workers live in `dataracy-infra`.

pub mod error;
pub mod id;
pub mod lock;
pub mod retry;
pub mod task;

pub use error::{DomainError, DomainResult};
pub use id::{AggregateKind, AggregateRef, ClaimToken, LockOwner, TaskId};
pub use lock::{keys, LockKey, LockOptions};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use task::{NewProjectionTask, ProjectionTask, TaskStatus, Transition};
