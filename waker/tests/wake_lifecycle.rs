//! Lifecycle tests for the wake cycle against shared stores.
//!
//! Each test drives `Orchestrator::trigger_cycle` through several wakes and
//! checks the durable document between them: version monotonicity, commit
//! races, selection fairness, retry ceilings, history bounds and what an
//! uncommitted cycle leaves behind.

use std::sync::Arc;
use std::time::Duration;

use waker::core::types::{Priority, TaskStatus};
use waker::cycle::CycleError;
use waker::exit_codes;
use waker::io::config::CycleConfig;
use waker::io::file_store::FileStateStore;
use waker::io::memory_store::InMemoryStateStore;
use waker::io::ports::{PortFailure, PortRegistry};
use waker::io::state_store::{StateStore, StoreError, load_or_init};
use waker::orchestrator::{EnqueueError, Orchestrator};
use waker::test_support::{FaultyStore, Reply, ScriptedPort, seed_tasks, test_cycle_config};

fn planner(port: &Arc<ScriptedPort>) -> PortRegistry {
    PortRegistry::new().with_planner(port.clone())
}

#[tokio::test]
async fn empty_store_initializes_to_equal_zero_states() {
    let store = InMemoryStateStore::new("agent");
    let first = load_or_init(&store, Duration::from_secs(1)).await.expect("first");
    let second = load_or_init(&store, Duration::from_secs(1)).await.expect("second");

    assert_eq!(first.version, 0);
    assert_eq!(first.state, second.state);
    assert_eq!(first.state.wake_count, 0);
    assert!(first.state.tasks.is_empty());
    assert!(first.state.history.is_empty());
    // Initializing in memory never creates the document.
    assert_eq!(store.stored_version(), None);
}

#[tokio::test]
async fn every_commit_advances_version_by_one() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(FileStateStore::new(temp.path(), "agent", 16));
    let port = Arc::new(ScriptedPort::new("planner"));
    let orch = Orchestrator::new(store.clone(), planner(&port), test_cycle_config());

    orch.enqueue_task("first", "one thing", Priority::Normal)
        .await
        .expect("enqueue");
    let mut last = store.load().await.expect("enqueued").version;
    assert_eq!(last, 1);
    for expected_wake in 1..=3u64 {
        let report = orch.trigger_cycle().await.expect("cycle");
        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.version, last + 1);
        assert_eq!(loaded.version, report.version);
        assert_eq!(loaded.state.version, loaded.version);
        assert_eq!(loaded.state.wake_count, expected_wake);
        last = loaded.version;
    }
    // One enqueue plus three cycles.
    assert_eq!(last, 4);
}

#[tokio::test]
async fn racing_cycles_commit_exactly_once() {
    let store = Arc::new(FaultyStore::new("agent"));
    seed_tasks(store.as_ref(), &[("A", Priority::Normal)]).await;
    store.rendezvous_next_saves(2);

    let config = CycleConfig {
        commit_retry_limit: 0,
        ..test_cycle_config()
    };
    let port = Arc::new(ScriptedPort::new("planner"));
    let left = Orchestrator::new(store.clone(), planner(&port), config.clone());
    let right = Orchestrator::new(store.clone(), planner(&port), config);

    let (a, b) = tokio::join!(left.trigger_cycle(), right.trigger_cycle());
    let results = [a, b];
    let committed: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let skipped: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();

    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].version, 2);
    assert_eq!(
        skipped,
        vec![&CycleError::ConflictRetriesExhausted { attempts: 1 }]
    );
    let loaded = store.load().await.expect("load");
    assert_eq!(loaded.version, 2);
    assert_eq!(loaded.state.wake_count, 1);
}

#[tokio::test]
async fn losing_cycle_retries_from_the_winner() {
    let store = Arc::new(FaultyStore::new("agent"));
    seed_tasks(store.as_ref(), &[("A", Priority::Normal)]).await;
    store.rendezvous_next_saves(2);

    let port = Arc::new(ScriptedPort::new("planner"));
    let left = Orchestrator::new(store.clone(), planner(&port), test_cycle_config());
    let right = Orchestrator::new(store.clone(), planner(&port), test_cycle_config());

    let (a, b) = tokio::join!(left.trigger_cycle(), right.trigger_cycle());
    let a = a.expect("left commits");
    let b = b.expect("right commits");

    let mut versions = [a.version, b.version];
    versions.sort_unstable();
    assert_eq!(versions, [2, 3]);
    assert_eq!(a.conflicts + b.conflicts, 1);

    let loaded = store.load().await.expect("load");
    assert_eq!(loaded.state.wake_count, 2);
    let cycles: Vec<u64> = loaded.state.history.iter().map(|r| r.cycle_number).collect();
    assert_eq!(cycles, vec![1, 2]);
}

#[tokio::test]
async fn cycle_outpaced_by_every_retry_is_skipped() {
    let store = Arc::new(FaultyStore::new("agent"));
    seed_tasks(store.as_ref(), &[("A", Priority::Normal)]).await;
    let config = CycleConfig {
        commit_retry_limit: 2,
        ..test_cycle_config()
    };
    store.interfere_with_next_saves(config.commit_retry_limit + 1);

    let port = Arc::new(ScriptedPort::new("planner"));
    let orchestrator = Orchestrator::new(store.clone(), planner(&port), config);
    let err = orchestrator.trigger_cycle().await.expect_err("skipped");

    assert_eq!(err, CycleError::ConflictRetriesExhausted { attempts: 3 });
    assert_eq!(exit_codes::for_cycle_error(&err), exit_codes::CYCLE_SKIPPED);
    // Only the three foreign commits landed on top of the seed.
    let loaded = store.load().await.expect("load");
    assert_eq!(loaded.version, 4);
    assert_eq!(loaded.state.wake_count, 0);
    assert!(loaded.state.history.is_empty());
    assert_eq!(loaded.state.tasks[0].status, TaskStatus::Pending);
    assert_eq!(loaded.state.tasks[0].attempt_count, 0);
}

#[tokio::test]
async fn enqueue_retries_past_conflicts_until_the_limit() {
    let store = Arc::new(FaultyStore::new("agent"));
    let config = CycleConfig {
        commit_retry_limit: 1,
        ..test_cycle_config()
    };
    let orchestrator = Orchestrator::new(store.clone(), PortRegistry::new(), config);

    store.interfere_with_next_saves(1);
    let kept = orchestrator
        .enqueue_task("kept", "", Priority::Normal)
        .await
        .expect("enqueue after one conflict");
    let loaded = store.load().await.expect("load");
    assert_eq!(loaded.version, 2);
    assert!(loaded.state.tasks.iter().any(|t| t.id == kept));

    store.interfere_with_next_saves(2);
    let err = orchestrator
        .enqueue_task("dropped", "", Priority::Normal)
        .await
        .expect_err("conflicts exhausted");
    assert!(matches!(
        err,
        EnqueueError::ConflictRetriesExhausted { attempts: 2 }
    ));
    let loaded = store.load().await.expect("load");
    assert_eq!(loaded.version, 4);
    assert_eq!(loaded.state.tasks.len(), 1);
    assert!(loaded.state.tasks.iter().all(|t| t.name != "dropped"));
}

#[tokio::test]
async fn selection_prefers_priority_then_age() {
    let store = Arc::new(InMemoryStateStore::new("agent"));
    seed_tasks(
        store.as_ref(),
        &[("A", Priority::High), ("B", Priority::High), ("C", Priority::Low)],
    )
    .await;

    let port = Arc::new(ScriptedPort::new("planner"));
    let config = CycleConfig {
        max_tasks_per_cycle: 2,
        ..test_cycle_config()
    };
    let orch = Orchestrator::new(store.clone(), planner(&port), config);

    let report = orch.trigger_cycle().await.expect("cycle");
    let ids: Vec<&str> = report.outcomes.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, vec!["A", "B"]);
    assert_eq!(port.keys(), vec!["A:1", "B:1"]);

    let loaded = store.load().await.expect("load");
    let c = loaded.state.tasks.get("C").expect("C");
    assert_eq!(c.status, TaskStatus::Pending);
    assert_eq!(c.attempt_count, 0);
}

#[tokio::test]
async fn always_failing_task_fails_terminally_at_the_ceiling() {
    let store = Arc::new(InMemoryStateStore::new("agent"));
    seed_tasks(store.as_ref(), &[("flaky", Priority::Normal)]).await;

    let port = Arc::new(ScriptedPort::new("planner"));
    port.set_fallback(Reply::Fail(PortFailure::Unavailable("planner down".to_string())));
    let config = CycleConfig {
        retry_ceiling: 3,
        ..test_cycle_config()
    };
    let orch = Orchestrator::new(store.clone(), planner(&port), config);

    for _ in 0..5 {
        orch.trigger_cycle().await.expect("cycle");
    }

    assert_eq!(port.keys(), vec!["flaky:1", "flaky:2", "flaky:3"]);
    let loaded = store.load().await.expect("load");
    let task = loaded.state.tasks.get("flaky").expect("task");
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempt_count, 3);
    assert_eq!(
        task.last_error.as_deref(),
        Some("provider unavailable: planner down")
    );
    assert_eq!(loaded.state.wake_count, 5);

    let status = orch.get_status().await.expect("status");
    assert_eq!(status.projection.attention.len(), 1);
}

#[tokio::test]
async fn history_is_bounded_by_the_cap() {
    let store = Arc::new(InMemoryStateStore::new("agent"));
    let config = CycleConfig {
        history_cap: 3,
        ..test_cycle_config()
    };
    let orch = Orchestrator::new(store.clone(), PortRegistry::new(), config);

    for _ in 0..5 {
        orch.trigger_cycle().await.expect("cycle");
    }

    let loaded = store.load().await.expect("load");
    assert_eq!(loaded.state.history.len(), 3);
    let cycles: Vec<u64> = loaded.state.history.iter().map(|r| r.cycle_number).collect();
    assert_eq!(cycles, vec![3, 4, 5]);
    assert_eq!(loaded.state.wake_count, 5);
}

#[tokio::test]
async fn uncommitted_cycle_leaves_previous_version_and_replays() {
    let store = Arc::new(FaultyStore::new("agent"));
    seed_tasks(store.as_ref(), &[("A", Priority::Normal), ("B", Priority::Low)]).await;
    let before = store.load().await.expect("before");

    let port = Arc::new(ScriptedPort::new("planner"));
    port.push(Reply::Fail(PortFailure::Rejected("bad input".to_string())));
    let orch = Orchestrator::new(store.clone(), planner(&port), test_cycle_config());

    store.fail_saves(true);
    let err = orch.trigger_cycle().await.expect_err("save fails");
    assert!(matches!(err, CycleError::Store(StoreError::Unavailable(_))));

    let after = store.load().await.expect("after");
    assert_eq!(after, before);
    for task in after.state.tasks.iter() {
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 0);
    }

    store.fail_saves(false);
    let report = orch.trigger_cycle().await.expect("replay");
    assert_eq!(report.version, before.version + 1);
    // The replay reused the idempotency keys of the lost cycle.
    assert_eq!(port.keys(), vec!["A:1", "B:1", "A:1", "B:1"]);
}

#[tokio::test]
async fn hung_store_is_reported_unavailable() {
    let store = Arc::new(FaultyStore::new("agent"));
    store.hang_saves(true);
    let config = CycleConfig {
        store_timeout: Duration::from_millis(50),
        ..test_cycle_config()
    };
    let orch = Orchestrator::new(store.clone(), PortRegistry::new(), config);

    let err = orch.trigger_cycle().await.expect_err("timeout");
    assert!(matches!(err, CycleError::Store(StoreError::Unavailable(_))));
    assert_eq!(store.inner().stored_version(), None);
}
