//! Domain error model.

use thiserror::Error;

use crate::task::TaskStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, invariants).
/// Infrastructure concerns belong to the store and lock error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A projection task was asked to move along an edge the state machine
    /// does not have (e.g. anything leaving DONE or DEAD).
    #[error("illegal task transition: {from} -> {to}")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },

    /// A lock key was empty or blank.
    #[error("invalid lock key: {0}")]
    InvalidLockKey(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn illegal_transition(from: TaskStatus, to: TaskStatus) -> Self {
        Self::IllegalTransition { from, to }
    }
}
