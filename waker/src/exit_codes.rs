//! Stable exit codes for `waker` CLI commands.

use crate::cycle::CycleError;
use crate::io::state_store::StoreError;
use crate::orchestrator::EnqueueError;

/// Command succeeded (a cycle committed, a task was enqueued, ...).
pub const OK: i32 = 0;
/// Invalid config, arguments or task, or malformed persisted state.
pub const INVALID: i32 = 1;
/// The cycle failed because the state store was unavailable.
pub const CYCLE_FAILED: i32 = 2;
/// The cycle was skipped after exhausting its commit retries.
pub const CYCLE_SKIPPED: i32 = 3;

pub fn for_store_error(err: &StoreError) -> i32 {
    match err {
        StoreError::Unavailable(_) => CYCLE_FAILED,
        StoreError::VersionConflict { .. } => CYCLE_SKIPPED,
        StoreError::NotFound { .. } | StoreError::Malformed(_) | StoreError::InvalidCommit(_) => {
            INVALID
        }
    }
}

pub fn for_cycle_error(err: &CycleError) -> i32 {
    match err {
        CycleError::Store(store) => for_store_error(store),
        CycleError::ConflictRetriesExhausted { .. } => CYCLE_SKIPPED,
    }
}

pub fn for_enqueue_error(err: &EnqueueError) -> i32 {
    match err {
        EnqueueError::InvalidTask(_) => INVALID,
        EnqueueError::Store(store) => for_store_error(store),
        EnqueueError::ConflictRetriesExhausted { .. } => CYCLE_SKIPPED,
    }
}

/// Exit code for an error chain, found by downcasting to the typed errors.
pub fn for_error(err: &anyhow::Error) -> i32 {
    if let Some(cycle) = err.downcast_ref::<CycleError>() {
        return for_cycle_error(cycle);
    }
    if let Some(enqueue) = err.downcast_ref::<EnqueueError>() {
        return for_enqueue_error(enqueue);
    }
    if let Some(store) = err.downcast_ref::<StoreError>() {
        return for_store_error(store);
    }
    INVALID
}
