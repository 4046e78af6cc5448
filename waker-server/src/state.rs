//! Shared application state for the server.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use waker::orchestrator::Orchestrator;

/// Events broadcast to SSE clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// A cycle triggered by this process committed.
    CycleCommitted { version: u64, cycle: u64 },
    /// A cycle triggered by this process ended without committing.
    CycleFailed { error: String },
    TaskEnqueued { task_id: String },
    /// A new version document appeared in the store directory, whoever
    /// wrote it.
    StateChanged { version: u64 },
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Directory holding the agent's version documents, when the store is
    /// file-backed.
    pub document_dir: Option<PathBuf>,
    /// Broadcast sender for change events.
    pub event_tx: Arc<broadcast::Sender<ChangeEvent>>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, document_dir: Option<PathBuf>) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            orchestrator: Arc::new(orchestrator),
            document_dir,
            event_tx: Arc::new(event_tx),
        }
    }

    /// Broadcast `event`; having no subscribers is fine.
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.event_tx.send(event);
    }
}
