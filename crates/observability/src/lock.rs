//! Lock lifecycle events, emitted under the `dataracy::lock` target.

use core::fmt::Display;
use std::time::Instant;

use ::tracing::{debug, error, info, warn};

const TARGET: &str = "dataracy::lock";

/// Start of a guarded operation; returns the instant used for elapsed time.
pub fn started(key: &str) -> Instant {
    debug!(target: TARGET, key, "lock operation started");
    Instant::now()
}

pub fn acquired(key: &str, attempt: u32) {
    debug!(target: TARGET, key, attempt, "lock acquired");
}

pub fn attempt_failed(key: &str, attempt: u32, max_attempts: u32) {
    info!(target: TARGET, key, attempt, max_attempts, "lock not acquired within wait time");
}

pub fn retry_exceeded(key: &str, attempts: u32) {
    warn!(target: TARGET, key, attempts, "lock retries exhausted");
}

/// A guard could not build its key; no lock was attempted.
pub fn key_rejected(guard: &str, err: &dyn Display) {
    warn!(target: TARGET, guard, error = %err, "lock key evaluation failed");
}

pub fn interrupted(key: &str) {
    warn!(target: TARGET, key, "lock acquisition interrupted");
}

pub fn backend_failed(key: &str, err: &dyn Display) {
    error!(target: TARGET, key, error = %err, "lock backend failure");
}

/// The guarded action returned its own error; the lock was still released.
pub fn action_failed(key: &str) {
    warn!(target: TARGET, key, "guarded action failed");
}

pub fn action_panicked(key: &str) {
    error!(target: TARGET, key, "guarded action panicked; lock released before unwinding");
}

pub fn succeeded(key: &str, started: Instant) {
    info!(
        target: TARGET,
        key,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "guarded action completed"
    );
}

pub fn released(key: &str) {
    debug!(target: TARGET, key, "lock released");
}

/// The lease had already lapsed (or was taken over) by the time of release.
pub fn release_skipped(key: &str) {
    warn!(target: TARGET, key, "lock no longer held at release; lease expired");
}

pub fn release_failed(key: &str, err: &dyn Display) {
    error!(target: TARGET, key, error = %err, "lock release failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn retry_exhaustion_is_logged_with_key() {
        retry_exceeded("lock:nickname:neo", 3);
        assert!(logs_contain("lock retries exhausted"));
        assert!(logs_contain("lock:nickname:neo"));
    }

    #[traced_test]
    #[test]
    fn success_reports_elapsed_time() {
        let start = started("lock:user:modify:1");
        succeeded("lock:user:modify:1", start);
        assert!(logs_contain("elapsed_ms"));
    }
}
