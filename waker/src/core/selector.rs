//! Deterministic task selection for a wake cycle.

use std::cmp::Reverse;

use crate::core::backlog::TaskBacklog;
use crate::core::types::{Task, TaskStatus};

/// Pick up to `cap` pending tasks: highest priority first, then oldest
/// (`created_at`, then creation `seq`).
///
/// Returns task ids in execution order.
pub fn select_pending(backlog: &TaskBacklog, cap: usize) -> Vec<String> {
    let mut pending: Vec<&Task> = backlog
        .iter()
        .filter(|task| task.status == TaskStatus::Pending)
        .collect();
    pending.sort_by_key(|task| (Reverse(task.priority.rank()), task.created_at, task.seq));
    pending
        .into_iter()
        .take(cap)
        .map(|task| task.id.clone())
        .collect()
}

/// True if a task exhausted its retries and needs operator attention.
pub fn needs_attention(task: &Task) -> bool {
    task.status == TaskStatus::Failed
}
