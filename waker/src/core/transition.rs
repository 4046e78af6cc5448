//! Orchestrator-owned task state transitions.
//!
//! ```text
//! pending -> in_progress -> completed
//!                        -> pending   (failure, attempts below ceiling)
//!                        -> failed    (failure, ceiling reached; terminal)
//! ```

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::backlog::TaskBacklog;
use crate::core::types::{Task, TaskStatus};

/// A transition that the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task '{id}' cannot move from {from} to {to}")]
pub struct TransitionError {
    pub id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

fn illegal(task: &Task, to: TaskStatus) -> TransitionError {
    TransitionError {
        id: task.id.clone(),
        from: task.status,
        to,
    }
}

/// Clamp to `created_at` so a clock step backwards cannot break ordering.
fn touch(task: &mut Task, now: DateTime<Utc>) {
    task.updated_at = now.max(task.created_at);
}

/// Mark a pending task as in progress.
pub fn begin_attempt(task: &mut Task, now: DateTime<Utc>) -> Result<(), TransitionError> {
    match task.status {
        TaskStatus::Pending => {
            task.status = TaskStatus::InProgress;
            touch(task, now);
            Ok(())
        }
        TaskStatus::InProgress | TaskStatus::Completed | TaskStatus::Failed => {
            Err(illegal(task, TaskStatus::InProgress))
        }
    }
}

/// Complete an in-progress task.
pub fn record_success(
    task: &mut Task,
    result: Option<String>,
    now: DateTime<Utc>,
) -> Result<TaskStatus, TransitionError> {
    match task.status {
        TaskStatus::InProgress => {
            task.status = TaskStatus::Completed;
            task.result = result;
            touch(task, now);
            Ok(task.status)
        }
        TaskStatus::Pending | TaskStatus::Completed | TaskStatus::Failed => {
            Err(illegal(task, TaskStatus::Completed))
        }
    }
}

/// Record a failed attempt of an in-progress task.
///
/// The attempt counter always moves forward. The task returns to `pending`
/// while `attempt_count < retry_ceiling` and is terminally `failed` once it
/// reaches the ceiling.
pub fn record_failure(
    task: &mut Task,
    error: String,
    retry_ceiling: u32,
    now: DateTime<Utc>,
) -> Result<TaskStatus, TransitionError> {
    match task.status {
        TaskStatus::InProgress => {
            task.attempt_count = task.attempt_count.saturating_add(1);
            task.last_error = Some(error);
            touch(task, now);
            task.status = if task.attempt_count >= retry_ceiling {
                TaskStatus::Failed
            } else {
                TaskStatus::Pending
            };
            Ok(task.status)
        }
        TaskStatus::Pending | TaskStatus::Completed | TaskStatus::Failed => {
            Err(illegal(task, TaskStatus::Failed))
        }
    }
}

/// Return tasks left `in_progress` by an interrupted writer to `pending`.
///
/// Returns the ids that were reset, in backlog order. Attempt counters are
/// left untouched: an attempt that never committed does not count.
pub fn reconcile_interrupted(backlog: &mut TaskBacklog, now: DateTime<Utc>) -> Vec<String> {
    let mut reset = Vec::new();
    for task in backlog.iter_mut() {
        if task.status == TaskStatus::InProgress {
            task.status = TaskStatus::Pending;
            touch(task, now);
            reset.push(task.id.clone());
        }
    }
    reset
}
