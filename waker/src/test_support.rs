//! Test-only builders, scripted ports and fault-injecting stores.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio::sync::Barrier;

use crate::core::state::{AgentState, TaskDraft};
use crate::core::types::{Priority, Task, TaskAction, TaskStatus, WakeRecord};
use crate::io::config::CycleConfig;
use crate::io::memory_store::InMemoryStateStore;
use crate::io::ports::{CapabilityPort, CapabilityResponse, Invocation, PortFailure};
use crate::io::state_store::{Committed, Loaded, StateStore, StoreError};

/// A fixed instant plus `secs` seconds.
pub fn ts(secs: i64) -> DateTime<Utc> {
    let base = Utc
        .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default();
    base + chrono::Duration::seconds(secs)
}

/// A pending planning task created at `ts(seq)`.
pub fn task(id: &str, priority: Priority, seq: u64) -> Task {
    Task {
        id: id.to_string(),
        seq,
        name: id.to_string(),
        description: format!("{id} description"),
        priority,
        action: TaskAction::Plan,
        status: TaskStatus::Pending,
        created_at: ts(seq as i64),
        updated_at: ts(seq as i64),
        attempt_count: 0,
        last_error: None,
        result: None,
    }
}

/// A clean wake record for cycle `n`.
pub fn record(n: u64) -> WakeRecord {
    WakeRecord {
        cycle_number: n,
        started_at: ts(n as i64 * 900),
        duration_ms: 10,
        tasks_attempted: 0,
        tasks_succeeded: 0,
        tasks_failed: 0,
        error_summary: None,
    }
}

/// Zero state holding `tasks`, with `next_task_seq` past the highest seq.
pub fn state_with_tasks(tasks: Vec<Task>) -> AgentState {
    let mut state = AgentState::zero();
    state.next_task_seq = tasks.iter().map(|t| t.seq + 1).max().unwrap_or(0);
    state.tasks = tasks.into_iter().collect();
    state
}

/// Commit planning tasks named by id into `store`, one commit for all.
pub async fn seed_tasks(store: &dyn StateStore, tasks: &[(&str, Priority)]) {
    let (mut state, version) = match store.load().await {
        Ok(loaded) => (loaded.state, loaded.version),
        Err(StoreError::NotFound { .. }) => (AgentState::zero(), 0),
        Err(err) => panic!("seed load failed: {err}"),
    };
    for (offset, (id, priority)) in tasks.iter().enumerate() {
        state
            .add_task(
                id.to_string(),
                TaskDraft {
                    name: id.to_string(),
                    description: format!("{id} description"),
                    priority: *priority,
                    action: TaskAction::Plan,
                },
                ts(offset as i64),
            )
            .expect("seed task");
    }
    state.version = version + 1;
    store.save(&state, version).await.expect("seed commit");
}

/// Cycle defaults with timeouts short enough for tests.
pub fn test_cycle_config() -> CycleConfig {
    CycleConfig {
        task_timeout: Duration::from_secs(5),
        store_timeout: Duration::from_secs(5),
        cycle_budget: Duration::from_secs(60),
        ..CycleConfig::default()
    }
}

/// One scripted port reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(CapabilityResponse),
    Fail(PortFailure),
    /// Never resolves; exercises the caller's timeout.
    Hang,
    Panic(&'static str),
}

/// A port that replays queued replies and records invocation keys.
///
/// Once the queue is empty every call gets `fallback` (initially
/// `NoPlanNeeded`).
#[derive(Debug)]
pub struct ScriptedPort {
    name: String,
    replies: Mutex<VecDeque<Reply>>,
    fallback: Mutex<Reply>,
    keys: Mutex<Vec<String>>,
}

impl ScriptedPort {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            replies: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Reply::Ok(CapabilityResponse::NoPlanNeeded)),
            keys: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().expect("replies").push_back(reply);
    }

    pub fn set_fallback(&self, reply: Reply) {
        *self.fallback.lock().expect("fallback") = reply;
    }

    /// Idempotency keys seen so far, in call order.
    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().expect("keys").clone()
    }
}

#[async_trait]
impl CapabilityPort for ScriptedPort {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<CapabilityResponse, PortFailure> {
        self.keys.lock().expect("keys").push(invocation.key.clone());
        let reply = self
            .replies
            .lock()
            .expect("replies")
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().expect("fallback").clone());
        match reply {
            Reply::Ok(response) => Ok(response),
            Reply::Fail(failure) => Err(failure),
            Reply::Hang => std::future::pending().await,
            Reply::Panic(msg) => panic!("{msg}"),
        }
    }
}

/// In-memory store with switchable faults.
pub struct FaultyStore {
    inner: InMemoryStateStore,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
    hang_saves: AtomicBool,
    interfering_writes: AtomicU32,
    barrier_saves: AtomicU32,
    barrier: Mutex<Option<std::sync::Arc<Barrier>>>,
}

impl FaultyStore {
    pub fn new(key: &str) -> Self {
        Self {
            inner: InMemoryStateStore::new(key),
            fail_loads: AtomicBool::new(false),
            fail_saves: AtomicBool::new(false),
            hang_saves: AtomicBool::new(false),
            interfering_writes: AtomicU32::new(0),
            barrier_saves: AtomicU32::new(0),
            barrier: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &InMemoryStateStore {
        &self.inner
    }

    pub fn fail_loads(&self, on: bool) {
        self.fail_loads.store(on, Ordering::SeqCst);
    }

    pub fn fail_saves(&self, on: bool) {
        self.fail_saves.store(on, Ordering::SeqCst);
    }

    pub fn hang_saves(&self, on: bool) {
        self.hang_saves.store(on, Ordering::SeqCst);
    }

    /// Before each of the next `n` saves, commit a foreign version so the
    /// save loses the race.
    pub fn interfere_with_next_saves(&self, n: u32) {
        self.interfering_writes.store(n, Ordering::SeqCst);
    }

    /// Hold the next `parties` saves until all of them have arrived, so
    /// concurrent cycles are guaranteed to race from the same version.
    pub fn rendezvous_next_saves(&self, parties: u32) {
        *self.barrier.lock().expect("barrier") =
            Some(std::sync::Arc::new(Barrier::new(parties as usize)));
        self.barrier_saves.store(parties, Ordering::SeqCst);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn foreign_commit(&self) {
        let (mut state, version) = match self.inner.load().await {
            Ok(loaded) => (loaded.state, loaded.version),
            Err(_) => (AgentState::zero(), 0),
        };
        state.version = version + 1;
        self.inner
            .save(&state, version)
            .await
            .expect("foreign commit");
    }
}

#[async_trait]
impl StateStore for FaultyStore {
    fn key(&self) -> &str {
        self.inner.key()
    }

    async fn load(&self) -> Result<Loaded, StoreError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected load failure".to_string()));
        }
        self.inner.load().await
    }

    async fn save(
        &self,
        state: &AgentState,
        expected_version: u64,
    ) -> Result<Committed, StoreError> {
        if Self::take(&self.barrier_saves) {
            let barrier = self.barrier.lock().expect("barrier").clone();
            if let Some(barrier) = barrier {
                barrier.wait().await;
            }
        }
        if self.hang_saves.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected save failure".to_string()));
        }
        if Self::take(&self.interfering_writes) {
            self.foreign_commit().await;
        }
        self.inner.save(state, expected_version).await
    }
}

/// A unified diff that appends one line to the `TestRepo` README.
pub const README_DIFF: &str = "\
diff --git a/README.md b/README.md
--- a/README.md
+++ b/README.md
@@ -1 +1,2 @@
 # demo
+Wakes every fifteen minutes.
";

/// Temporary git repository on `main` with one commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("tempdir")?;
        let repo = Self { dir };
        repo.git(&["init", "--quiet", "--initial-branch=main"])?;
        repo.git(&["config", "user.email", "waker@example.com"])?;
        repo.git(&["config", "user.name", "waker tests"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        std::fs::write(repo.path().join("README.md"), "# demo\n").context("write readme")?;
        repo.git(&["add", "README.md"])?;
        repo.git(&["commit", "--quiet", "-m", "init"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        let out = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !out.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(())
    }
}
