//! The durable agent aggregate.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::backlog::TaskBacklog;
use crate::core::types::{MarketplaceSummary, Priority, Task, TaskAction, TaskStatus, WakeRecord};

/// Schema version written into every persisted document.
pub const SCHEMA_VERSION: u32 = 1;

/// The single durable document owned by one agent instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub schema_version: u32,
    /// Commit counter used for optimistic concurrency (0 = never committed).
    pub version: u64,
    /// Number of committed wake cycles.
    pub wake_count: u64,
    pub last_wake_at: Option<DateTime<Utc>>,
    /// Sequence number assigned to the next created task.
    pub next_task_seq: u64,
    pub tasks: TaskBacklog,
    /// Most-recent-last, bounded by the configured history cap.
    pub history: VecDeque<WakeRecord>,
    #[serde(default)]
    pub ledger: BTreeMap<String, MarketplaceSummary>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self::zero()
    }
}

/// Caller-supplied fields of a new task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDraft {
    pub name: String,
    pub description: String,
    pub priority: Priority,
    pub action: TaskAction,
}

impl AgentState {
    /// The state synthesized when the store holds no document yet.
    pub fn zero() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            version: 0,
            wake_count: 0,
            last_wake_at: None,
            next_task_seq: 0,
            tasks: TaskBacklog::new(),
            history: VecDeque::new(),
            ledger: BTreeMap::new(),
        }
    }

    /// Append a new `pending` task with the given id and return it.
    pub fn add_task(
        &mut self,
        id: String,
        draft: TaskDraft,
        now: DateTime<Utc>,
    ) -> Result<&Task, String> {
        let task = Task {
            id: id.clone(),
            seq: self.next_task_seq,
            name: draft.name,
            description: draft.description,
            priority: draft.priority,
            action: draft.action,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            attempt_count: 0,
            last_error: None,
            result: None,
        };
        self.tasks.push(task)?;
        self.next_task_seq += 1;
        self.tasks
            .get(&id)
            .ok_or_else(|| format!("task '{id}' missing after insert"))
    }
}
