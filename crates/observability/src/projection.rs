//! Projection worker events, emitted under the `dataracy::projection` target.
//!
//! `index` is the search index the task writes to, so failures can be grouped
//! per index in log search.

use core::fmt::Display;

use ::tracing::{debug, error, info, warn};

const TARGET: &str = "dataracy::projection";

pub fn batch_claimed(worker: &str, claimed: usize) {
    if claimed > 0 {
        info!(target: TARGET, worker, claimed, "claimed projection batch");
    } else {
        debug!(target: TARGET, worker, "no projection tasks due");
    }
}

pub fn claim_failed(worker: &str, err: &dyn Display) {
    error!(target: TARGET, worker, error = %err, "projection claim failed; retrying next tick");
}

pub fn tick_panicked(worker: &str, reason: &str) {
    error!(target: TARGET, worker, reason, "projection tick panicked; loop continues");
}

pub fn task_done(index: &str, task_id: &dyn Display, aggregate: &dyn Display, attempts: u32) {
    debug!(
        target: TARGET,
        index,
        task_id = %task_id,
        aggregate = %aggregate,
        attempts,
        "projection applied"
    );
}

pub fn task_retrying(
    index: &str,
    task_id: &dyn Display,
    aggregate: &dyn Display,
    attempts: u32,
    next_run_at: &dyn Display,
    err: &dyn Display,
) {
    warn!(
        target: TARGET,
        index,
        task_id = %task_id,
        aggregate = %aggregate,
        attempts,
        next_run_at = %next_run_at,
        error = %err,
        "projection failed; scheduled retry"
    );
}

/// Terminal failure; needs manual intervention.
pub fn task_dead(index: &str, task_id: &dyn Display, aggregate: &dyn Display, attempts: u32, err: &dyn Display) {
    error!(
        target: TARGET,
        index,
        task_id = %task_id,
        aggregate = %aggregate,
        attempts,
        error = %err,
        "projection dead after max attempts"
    );
}

pub fn stale_claim(task_id: &dyn Display, err: &dyn Display) {
    warn!(target: TARGET, task_id = %task_id, error = %err, "projection result discarded; claim is stale");
}

pub fn transition_failed(task_id: &dyn Display, err: &dyn Display) {
    error!(
        target: TARGET,
        task_id = %task_id,
        error = %err,
        "failed to record projection status; task will be re-claimed after its claim lease"
    );
}
