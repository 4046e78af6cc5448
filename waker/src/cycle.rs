//! One wake cycle: load, select, execute, record, commit.
//!
//! The cycle works on a private copy of the loaded document and commits it
//! with a single compare-and-swap. Nothing is written before that commit, so
//! an interrupted cycle leaves the previous version untouched and the next
//! trigger replays the same selection with the same attempt counters.

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::call_timeout;
use crate::core::history::push_bounded;
use crate::core::selector::select_pending;
use crate::core::state::AgentState;
use crate::core::transition::{begin_attempt, reconcile_interrupted, record_failure, record_success};
use crate::core::types::{TaskAction, TaskStatus, WakeRecord};
use crate::io::config::CycleConfig;
use crate::io::ports::{CapabilityResponse, Invocation, PortFailure, PortRegistry};
use crate::io::state_store::{StateStore, StoreError, load_or_init, save_with_timeout};

const ERROR_SUMMARY_LIMIT: usize = 500;

/// Why a cycle ended without committing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CycleError {
    /// Load or save failed; durable state is unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Every commit attempt lost a version race; the cycle was skipped.
    #[error("cycle skipped: lost {attempts} commit race(s) to concurrent writers")]
    ConflictRetriesExhausted { attempts: u32 },
}

/// What happened to one selected task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskOutcome {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a committed cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub record: WakeRecord,
    /// Version the cycle committed as.
    pub version: u64,
    /// Version conflicts absorbed before the commit succeeded.
    pub conflicts: u32,
    pub outcomes: Vec<TaskOutcome>,
    /// Tasks found `in_progress` on load and returned to `pending`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reconciled: Vec<String>,
    /// Selected tasks left pending because the cycle budget ran out.
    pub deferred: usize,
}

struct Executed {
    state: AgentState,
    record: WakeRecord,
    outcomes: Vec<TaskOutcome>,
    reconciled: Vec<String>,
    deferred: usize,
}

/// Run a wake cycle against `store`, retrying from a fresh load when another
/// writer commits first.
#[instrument(skip_all, fields(key = store.key()))]
pub async fn run_cycle(
    store: &dyn StateStore,
    ports: &PortRegistry,
    config: &CycleConfig,
) -> Result<CycleReport, CycleError> {
    let mut conflicts = 0u32;
    loop {
        let loaded = load_or_init(store, config.store_timeout).await?;
        let base_version = loaded.version;
        let executed = execute(loaded.state, base_version, ports, config).await;

        match save_with_timeout(store, &executed.state, base_version, config.store_timeout).await {
            Ok(committed) => {
                let record = executed.record;
                info!(
                    cycle = record.cycle_number,
                    version = committed.version,
                    attempted = record.tasks_attempted,
                    succeeded = record.tasks_succeeded,
                    failed = record.tasks_failed,
                    duration_ms = record.duration_ms,
                    conflicts,
                    "wake cycle committed"
                );
                return Ok(CycleReport {
                    record,
                    version: committed.version,
                    conflicts,
                    outcomes: executed.outcomes,
                    reconciled: executed.reconciled,
                    deferred: executed.deferred,
                });
            }
            Err(StoreError::VersionConflict { expected, found }) => {
                conflicts += 1;
                warn!(expected, found, conflicts, "wake cycle lost commit race");
                if conflicts > config.commit_retry_limit {
                    return Err(CycleError::ConflictRetriesExhausted {
                        attempts: conflicts,
                    });
                }
            }
            Err(err) => {
                warn!(err = %err, "wake cycle not committed");
                return Err(err.into());
            }
        }
    }
}

/// Apply one cycle's work to `state` in memory.
async fn execute(
    mut state: AgentState,
    base_version: u64,
    ports: &PortRegistry,
    config: &CycleConfig,
) -> Executed {
    let started_at = Utc::now();
    let started = Instant::now();
    let deadline = started + config.cycle_budget;

    let reconciled = reconcile_interrupted(&mut state.tasks, started_at);
    if !reconciled.is_empty() {
        warn!(tasks = ?reconciled, "returned interrupted tasks to pending");
    }

    let selected = select_pending(&state.tasks, config.max_tasks_per_cycle);
    debug!(selected = selected.len(), "tasks selected");

    let mut outcomes = Vec::with_capacity(selected.len());
    let mut failures = Vec::new();
    let mut deferred = 0usize;
    for (index, id) in selected.iter().enumerate() {
        let Some(timeout) = call_timeout(config.task_timeout, deadline) else {
            deferred = selected.len() - index;
            warn!(deferred, "cycle budget spent, leaving remaining tasks pending");
            break;
        };
        let Some(task) = state.tasks.get_mut(id) else {
            continue;
        };
        if let Err(err) = begin_attempt(task, Utc::now()) {
            warn!(err = %err, "skipping task");
            continue;
        }
        let snapshot = task.clone();

        let result = match ports.resolve(&snapshot) {
            Ok((port, request)) => {
                let invocation = Invocation::for_task(&snapshot, request);
                debug!(task = %snapshot.id, port = port.name(), key = %invocation.key, "invoking port");
                invoke_guarded(port.invoke(&invocation), timeout).await
            }
            Err(failure) => Err(failure),
        }
        .and_then(reject_non_finite);

        let now = Utc::now();
        if let (Ok(CapabilityResponse::Summary(summary)), TaskAction::MarketplaceSync { marketplace }) =
            (&result, &snapshot.action)
        {
            state.ledger.insert(marketplace.clone(), summary.clone());
        }
        let Some(task) = state.tasks.get_mut(id) else {
            continue;
        };
        let transition = match &result {
            Ok(response) => record_success(task, Some(response.summary()), now),
            Err(failure) => record_failure(task, failure.to_string(), config.retry_ceiling, now),
        };
        if let Err(err) = transition {
            warn!(err = %err, "task outcome not recorded");
            continue;
        }
        if let Err(failure) = &result {
            warn!(task = %task.id, attempt = task.attempt_count, status = %task.status, err = %failure, "task failed");
            failures.push(format!("{}: {failure}", task.name));
        } else {
            debug!(task = %task.id, "task completed");
        }
        outcomes.push(TaskOutcome {
            id: task.id.clone(),
            name: task.name.clone(),
            status: task.status,
            attempt_count: task.attempt_count,
            result: task.result.clone().filter(|_| result.is_ok()),
            error: result.as_ref().err().map(ToString::to_string),
        });
    }

    let finished_at = Utc::now();
    let record = wake_record(&state, started_at, started, &outcomes, &failures);
    push_bounded(&mut state.history, record.clone(), config.history_cap);
    state.wake_count = record.cycle_number;
    state.last_wake_at = Some(last_wake(&state, finished_at));
    state.version = base_version + 1;

    Executed {
        state,
        record,
        outcomes,
        reconciled,
        deferred,
    }
}

/// Await a port call with a timeout, turning a panic into a task failure.
async fn invoke_guarded<F>(call: F, timeout: std::time::Duration) -> Result<CapabilityResponse, PortFailure>
where
    F: std::future::Future<Output = Result<CapabilityResponse, PortFailure>>,
{
    let started = Instant::now();
    match tokio::time::timeout(timeout, AssertUnwindSafe(call).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(PortFailure::Panicked(panic_message(&*panic))),
        Err(_) => Err(PortFailure::Timeout {
            elapsed_ms: started.elapsed().as_millis() as u64,
        }),
    }
}

/// Earnings must be finite numbers to be recorded in the ledger.
fn reject_non_finite(response: CapabilityResponse) -> Result<CapabilityResponse, PortFailure> {
    if let CapabilityResponse::Summary(summary) = &response
        && !(summary.earned_usd.is_finite() && summary.pending_usd.is_finite())
    {
        return Err(PortFailure::Rejected(format!(
            "non-finite earnings summary (earned {}, pending {})",
            summary.earned_usd, summary.pending_usd
        )));
    }
    Ok(response)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn wake_record(
    state: &AgentState,
    started_at: DateTime<Utc>,
    started: Instant,
    outcomes: &[TaskOutcome],
    failures: &[String],
) -> WakeRecord {
    let failed = failures.len() as u32;
    let attempted = outcomes.len() as u32;
    let error_summary = (!failures.is_empty()).then(|| {
        let joined = failures.join("; ");
        if joined.chars().count() > ERROR_SUMMARY_LIMIT {
            let mut cut: String = joined.chars().take(ERROR_SUMMARY_LIMIT).collect();
            cut.push_str("...");
            cut
        } else {
            joined
        }
    });
    WakeRecord {
        cycle_number: state.wake_count + 1,
        started_at,
        duration_ms: started.elapsed().as_millis() as u64,
        tasks_attempted: attempted,
        tasks_succeeded: attempted - failed,
        tasks_failed: failed,
        error_summary,
    }
}

/// `last_wake_at` never moves backwards, even if the wall clock does.
fn last_wake(state: &AgentState, finished_at: DateTime<Utc>) -> DateTime<Utc> {
    match state.last_wake_at {
        Some(previous) if previous > finished_at => previous,
        _ => finished_at,
    }
}
