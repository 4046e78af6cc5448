//! Shared deterministic types for the wake-cycle core.
//!
//! These types are the persisted contract of the agent document. They must not
//! depend on external state and must serialize identically across runs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scheduling priority of a task. Higher priorities are selected first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Numeric rank used for ordering (`high` > `normal` > `low`).
    pub fn rank(self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!(
                "unknown priority '{other}' (expected low, normal or high)"
            )),
        }
    }
}

/// Lifecycle status of a task.
///
/// `Completed` is always terminal. `Failed` is only ever persisted once the
/// retry ceiling is reached, so a persisted `Failed` task is terminal too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        match self {
            TaskStatus::Completed | TaskStatus::Failed => true,
            TaskStatus::Pending | TaskStatus::InProgress => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task asks the agent to do; selects the capability port it runs on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskAction {
    /// Ask the planner to break the task description into steps.
    #[default]
    Plan,
    /// Call one tool on a connected tool server.
    Tool {
        server: String,
        tool: String,
        #[serde(default)]
        arguments: Value,
    },
    /// Refresh the earnings summary of a marketplace.
    MarketplaceSync { marketplace: String },
    /// Opaque marketplace write (bid, claim, deliver), idempotent by `job_id`.
    MarketplaceJob {
        marketplace: String,
        operation: String,
        job_id: String,
        #[serde(default)]
        payload: Value,
    },
    /// Propose a source change on the code host.
    ProposeChange { diff: String },
}

impl TaskAction {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskAction::Plan => "plan",
            TaskAction::Tool { .. } => "tool",
            TaskAction::MarketplaceSync { .. } => "marketplace_sync",
            TaskAction::MarketplaceJob { .. } => "marketplace_job",
            TaskAction::ProposeChange { .. } => "propose_change",
        }
    }
}

/// A unit of backlog work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique, immutable identifier (`task-<uuid>`).
    pub id: String,
    /// Creation sequence number; breaks `created_at` ties deterministically.
    pub seq: u64,
    pub name: String,
    pub description: String,
    pub priority: Priority,
    #[serde(default)]
    pub action: TaskAction,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of failed attempts so far.
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Short summary of the successful capability response.
    #[serde(default)]
    pub result: Option<String>,
}

/// Immutable summary of one committed wake cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeRecord {
    pub cycle_number: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub tasks_attempted: u32,
    pub tasks_succeeded: u32,
    pub tasks_failed: u32,
    pub error_summary: Option<String>,
}

/// Last known earnings snapshot for one marketplace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceSummary {
    pub earned_usd: f64,
    pub pending_usd: f64,
    pub jobs_completed: u64,
    pub fetched_at: DateTime<Utc>,
}
