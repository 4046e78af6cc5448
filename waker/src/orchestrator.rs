//! Upward boundary of the agent: status, trigger and enqueue.
//!
//! Every method reads or commits through the state store. There is no
//! in-process lock; concurrent callers are serialized by the store's
//! compare-and-swap alone.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::projection::{StatusProjection, project_status};
use crate::core::state::TaskDraft;
use crate::core::types::{Priority, TaskAction};
use crate::cycle::{CycleError, CycleReport, run_cycle};
use crate::io::config::CycleConfig;
use crate::io::ports::{Capability, PortRegistry};
use crate::io::state_store::{StateStore, StoreError, load_or_init, save_with_timeout};

/// Why a task could not be enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("task not enqueued: lost {attempts} commit race(s) to concurrent writers")]
    ConflictRetriesExhausted { attempts: u32 },
}

/// Status projection plus the capabilities this process has registered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub projection: StatusProjection,
    pub capabilities: Vec<Capability>,
}

pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    ports: PortRegistry,
    config: CycleConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("key", &self.store.key())
            .field("ports", &self.ports)
            .field("config", &self.config)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(store: Arc<dyn StateStore>, ports: PortRegistry, config: CycleConfig) -> Self {
        Self {
            store,
            ports,
            config,
        }
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    /// Project the last committed state. Never mutates or triggers a cycle.
    pub async fn get_status(&self) -> Result<StatusReport, StoreError> {
        let loaded = load_or_init(self.store.as_ref(), self.config.store_timeout).await?;
        Ok(StatusReport {
            projection: project_status(&loaded.state, self.config.recent_history),
            capabilities: self.ports.capabilities(),
        })
    }

    /// Run one wake cycle now.
    pub async fn trigger_cycle(&self) -> Result<CycleReport, CycleError> {
        run_cycle(self.store.as_ref(), &self.ports, &self.config).await
    }

    /// Append a pending planning task and commit it immediately.
    pub async fn enqueue_task(
        &self,
        name: &str,
        description: &str,
        priority: Priority,
    ) -> Result<String, EnqueueError> {
        self.enqueue_task_with_action(name, description, priority, TaskAction::Plan)
            .await
    }

    /// Append a pending task with an explicit action and commit it.
    #[instrument(skip_all, fields(key = self.store.key(), kind = action.kind()))]
    pub async fn enqueue_task_with_action(
        &self,
        name: &str,
        description: &str,
        priority: Priority,
        action: TaskAction,
    ) -> Result<String, EnqueueError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EnqueueError::InvalidTask("task name required".to_string()));
        }
        validate_action(&action)?;

        let id = format!("task-{}", Uuid::new_v4().simple());
        let mut conflicts = 0u32;
        loop {
            let loaded = load_or_init(self.store.as_ref(), self.config.store_timeout).await?;
            let mut state = loaded.state;
            state
                .add_task(
                    id.clone(),
                    TaskDraft {
                        name: name.to_string(),
                        description: description.trim().to_string(),
                        priority,
                        action: action.clone(),
                    },
                    Utc::now(),
                )
                .map_err(EnqueueError::InvalidTask)?;
            state.version = loaded.version + 1;

            match save_with_timeout(
                self.store.as_ref(),
                &state,
                loaded.version,
                self.config.store_timeout,
            )
            .await
            {
                Ok(committed) => {
                    info!(task = %id, version = committed.version, %priority, "task enqueued");
                    return Ok(id);
                }
                Err(StoreError::VersionConflict { expected, found }) => {
                    conflicts += 1;
                    warn!(expected, found, conflicts, "enqueue lost commit race");
                    if conflicts > self.config.commit_retry_limit {
                        return Err(EnqueueError::ConflictRetriesExhausted {
                            attempts: conflicts,
                        });
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn validate_action(action: &TaskAction) -> Result<(), EnqueueError> {
    let missing = |field: &str| EnqueueError::InvalidTask(format!("{} requires {field}", action.kind()));
    match action {
        TaskAction::Plan => Ok(()),
        TaskAction::Tool { server, tool, .. } => {
            if server.trim().is_empty() {
                return Err(missing("a server"));
            }
            if tool.trim().is_empty() {
                return Err(missing("a tool"));
            }
            Ok(())
        }
        TaskAction::MarketplaceSync { marketplace } => {
            if marketplace.trim().is_empty() {
                return Err(missing("a marketplace"));
            }
            Ok(())
        }
        TaskAction::MarketplaceJob {
            marketplace,
            operation,
            job_id,
            ..
        } => {
            if marketplace.trim().is_empty() {
                return Err(missing("a marketplace"));
            }
            if operation.trim().is_empty() {
                return Err(missing("an operation"));
            }
            if job_id.trim().is_empty() {
                return Err(missing("a job id"));
            }
            Ok(())
        }
        TaskAction::ProposeChange { diff } => {
            if diff.trim().is_empty() {
                return Err(missing("a diff"));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::projection::Health;
    use crate::core::types::TaskStatus;
    use crate::io::memory_store::InMemoryStateStore;
    use crate::io::local_ports::LocalPlanner;
    use crate::test_support::test_cycle_config;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            Arc::new(InMemoryStateStore::new("agent")),
            PortRegistry::new().with_planner(Arc::new(LocalPlanner)),
            test_cycle_config(),
        )
    }

    #[tokio::test]
    async fn status_of_empty_store_is_zero_state() {
        let orch = orchestrator();
        let status = orch.get_status().await.expect("status");
        assert_eq!(status.projection.version, 0);
        assert_eq!(status.projection.wake_count, 0);
        assert_eq!(status.projection.health, Health::Healthy);
        assert_eq!(status.capabilities.len(), 1);
        // Status never writes.
        assert!(matches!(
            orch.store().load().await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn enqueue_commits_pending_task_immediately() {
        let orch = orchestrator();
        let id = orch
            .enqueue_task("  Write report ", "weekly numbers", Priority::High)
            .await
            .expect("enqueue");
        assert!(id.starts_with("task-"));

        let loaded = orch.store().load().await.expect("load");
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.state.wake_count, 0);
        let task = loaded.state.tasks.get(&id).expect("task");
        assert_eq!(task.name, "Write report");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.seq, 0);
    }

    #[tokio::test]
    async fn blank_name_is_rejected_without_commit() {
        let orch = orchestrator();
        let err = orch
            .enqueue_task("   ", "", Priority::Normal)
            .await
            .expect_err("blank");
        assert_eq!(err, EnqueueError::InvalidTask("task name required".to_string()));
        assert!(orch.store().load().await.is_err());
    }

    #[tokio::test]
    async fn incomplete_actions_are_rejected() {
        let orch = orchestrator();
        let err = orch
            .enqueue_task_with_action(
                "bid",
                "",
                Priority::Normal,
                TaskAction::MarketplaceJob {
                    marketplace: "clawgig".to_string(),
                    operation: "bid".to_string(),
                    job_id: " ".to_string(),
                    payload: serde_json::Value::Null,
                },
            )
            .await
            .expect_err("missing job id");
        assert_eq!(
            err.to_string(),
            "invalid task: marketplace_job requires a job id"
        );
    }

    #[tokio::test]
    async fn trigger_then_status_reflects_commit() {
        let orch = orchestrator();
        orch.enqueue_task("plan launch", "draft; review", Priority::Normal)
            .await
            .expect("enqueue");
        let report = orch.trigger_cycle().await.expect("cycle");
        assert_eq!(report.version, 2);
        assert_eq!(report.record.tasks_succeeded, 1);

        let status = orch.get_status().await.expect("status");
        assert_eq!(status.projection.version, 2);
        assert_eq!(status.projection.wake_count, 1);
        assert_eq!(status.projection.tasks.completed, 1);
        assert_eq!(status.projection.recent_history, vec![report.record]);
    }

    #[tokio::test]
    async fn status_report_serializes_flat() {
        let orch = orchestrator();
        let json = serde_json::to_value(orch.get_status().await.expect("status")).expect("json");
        assert_eq!(json["wake_count"], serde_json::json!(0));
        assert_eq!(json["health"], serde_json::json!("healthy"));
        assert_eq!(json["capabilities"][0]["kind"], serde_json::json!("planner"));
    }
}
