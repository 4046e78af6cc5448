//! Read-only status projection over a committed agent document.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::history::recent;
use crate::core::selector::needs_attention;
use crate::core::state::AgentState;
use crate::core::types::{TaskStatus, WakeRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// A terminally failed task surfaced for operator attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttentionItem {
    pub id: String,
    pub name: String,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

/// Totals across every marketplace in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EarningsSummary {
    pub total_earned_usd: f64,
    pub total_pending_usd: f64,
    pub total_jobs_completed: u64,
    pub marketplaces: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusProjection {
    pub version: u64,
    pub wake_count: u64,
    pub last_wake_at: Option<DateTime<Utc>>,
    pub health: Health,
    pub tasks: TaskCounts,
    pub attention: Vec<AttentionItem>,
    pub recent_history: Vec<WakeRecord>,
    pub earnings: EarningsSummary,
}

/// Compute the status payload from a committed state.
///
/// `recent_history` bounds how many wake records are included.
pub fn project_status(state: &AgentState, recent_history: usize) -> StatusProjection {
    let tasks = TaskCounts {
        pending: state.tasks.count(TaskStatus::Pending),
        in_progress: state.tasks.count(TaskStatus::InProgress),
        completed: state.tasks.count(TaskStatus::Completed),
        failed: state.tasks.count(TaskStatus::Failed),
        total: state.tasks.len(),
    };

    let attention: Vec<AttentionItem> = state
        .tasks
        .iter()
        .filter(|task| needs_attention(task))
        .map(|task| AttentionItem {
            id: task.id.clone(),
            name: task.name.clone(),
            attempt_count: task.attempt_count,
            last_error: task.last_error.clone(),
        })
        .collect();

    let last_wake_failed = state
        .history
        .back()
        .is_some_and(|record| record.tasks_failed > 0);
    let health = if attention.is_empty() && !last_wake_failed {
        Health::Healthy
    } else {
        Health::Degraded
    };

    let earnings = EarningsSummary {
        total_earned_usd: state.ledger.values().map(|m| m.earned_usd).sum(),
        total_pending_usd: state.ledger.values().map(|m| m.pending_usd).sum(),
        total_jobs_completed: state.ledger.values().map(|m| m.jobs_completed).sum(),
        marketplaces: state.ledger.len(),
    };

    StatusProjection {
        version: state.version,
        wake_count: state.wake_count,
        last_wake_at: state.last_wake_at,
        health,
        tasks,
        attention,
        recent_history: recent(&state.history, recent_history),
        earnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{MarketplaceSummary, Priority};
    use crate::test_support::{record, state_with_tasks, task, ts};

    #[test]
    fn zero_state_projects_healthy_and_empty() {
        let status = project_status(&AgentState::zero(), 10);
        assert_eq!(status.wake_count, 0);
        assert_eq!(status.last_wake_at, None);
        assert_eq!(status.health, Health::Healthy);
        assert_eq!(status.tasks.total, 0);
        assert!(status.recent_history.is_empty());
        assert_eq!(status.earnings.marketplaces, 0);
    }

    #[test]
    fn counts_tasks_and_surfaces_terminal_failures() {
        let mut done = task("done", Priority::Normal, 1);
        done.status = TaskStatus::Completed;
        let mut dead = task("dead", Priority::High, 2);
        dead.status = TaskStatus::Failed;
        dead.attempt_count = 3;
        dead.last_error = Some("timeout".to_string());
        let state = state_with_tasks(vec![task("open", Priority::Low, 0), done, dead]);

        let status = project_status(&state, 10);
        assert_eq!(status.tasks.pending, 1);
        assert_eq!(status.tasks.completed, 1);
        assert_eq!(status.tasks.failed, 1);
        assert_eq!(status.tasks.total, 3);
        assert_eq!(status.health, Health::Degraded);
        assert_eq!(status.attention.len(), 1);
        assert_eq!(status.attention[0].id, "dead");
        assert_eq!(status.attention[0].last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn limits_recent_history_and_totals_ledger() {
        let mut state = AgentState::zero();
        state.wake_count = 4;
        state.last_wake_at = Some(ts(4));
        state.history = (1..=4).map(record).collect();
        for (name, earned, jobs) in [("clawgig", 18.5, 2), ("superteam", 0.0, 4)] {
            state.ledger.insert(
                name.to_string(),
                MarketplaceSummary {
                    earned_usd: earned,
                    pending_usd: 10.0,
                    jobs_completed: jobs,
                    fetched_at: ts(1),
                },
            );
        }

        let status = project_status(&state, 2);
        let cycles: Vec<u64> = status.recent_history.iter().map(|r| r.cycle_number).collect();
        assert_eq!(cycles, vec![3, 4]);
        assert_eq!(status.earnings.total_earned_usd, 18.5);
        assert_eq!(status.earnings.total_pending_usd, 20.0);
        assert_eq!(status.earnings.total_jobs_completed, 6);
        assert_eq!(status.earnings.marketplaces, 2);
        assert_eq!(status.health, Health::Healthy);
    }

    #[test]
    fn projection_does_not_mutate_state() {
        let state = state_with_tasks(vec![task("a", Priority::Normal, 0)]);
        let before = state.clone();
        let _ = project_status(&state, 5);
        assert_eq!(state, before);
    }
}
