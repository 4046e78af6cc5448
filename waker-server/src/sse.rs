//! Server-Sent Events stream and store-directory watcher.

use std::convert::Infallible;
use std::path::Path;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use waker::io::file_store::parse_version_file_name;

use crate::state::{AppState, ChangeEvent};

#[derive(Serialize)]
struct SsePayload {
    #[serde(rename = "type")]
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cycle: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SsePayload {
    fn of_type(event_type: &'static str) -> Self {
        Self {
            event_type,
            version: None,
            cycle: None,
            task_id: None,
            error: None,
        }
    }
}

impl From<&ChangeEvent> for SsePayload {
    fn from(event: &ChangeEvent) -> Self {
        match event {
            ChangeEvent::CycleCommitted { version, cycle } => SsePayload {
                version: Some(*version),
                cycle: Some(*cycle),
                ..SsePayload::of_type("cycle_committed")
            },
            ChangeEvent::CycleFailed { error } => SsePayload {
                error: Some(error.clone()),
                ..SsePayload::of_type("cycle_failed")
            },
            ChangeEvent::TaskEnqueued { task_id } => SsePayload {
                task_id: Some(task_id.clone()),
                ..SsePayload::of_type("task_enqueued")
            },
            ChangeEvent::StateChanged { version } => SsePayload {
                version: Some(*version),
                ..SsePayload::of_type("state_changed")
            },
        }
    }
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(change_event) => {
                    let payload = SsePayload::from(&change_event);
                    if let Ok(json) = serde_json::to_string(&payload) {
                        yield Ok(Event::default().event("change").data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Start the store-directory watcher in a background task.
///
/// Does nothing for stores without a directory.
pub fn start_file_watcher(state: AppState) {
    if state.document_dir.is_none() {
        debug!("store is not file-backed, no watcher");
        return;
    }
    tokio::spawn(async move {
        if let Err(e) = run_file_watcher(state).await {
            warn!(error = %e, "file watcher failed");
        }
    });
}

async fn run_file_watcher(state: AppState) -> anyhow::Result<()> {
    let Some(document_dir) = state.document_dir.clone() else {
        return Ok(());
    };
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(100);

    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.try_send(event);
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(250)),
    )?;

    // The first commit creates the directory.
    std::fs::create_dir_all(&document_dir)?;
    watcher.watch(&document_dir, RecursiveMode::NonRecursive)?;
    info!(path = %document_dir.display(), "watching store directory");

    let mut pending_events: Vec<NotifyEvent> = Vec::new();
    let mut flush_tick = tokio::time::interval(Duration::from_millis(250));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                pending_events.push(event);
            }
            _ = flush_tick.tick() => {
                if pending_events.is_empty() {
                    continue;
                }
                process_events(&state, &document_dir, &pending_events);
                pending_events.clear();
            }
        }
    }
}

/// Broadcast one `StateChanged` for the newest version document created in
/// this batch. Temp files and pruning are ignored.
fn process_events(state: &AppState, document_dir: &Path, events: &[NotifyEvent]) {
    let newest = events
        .iter()
        .filter(|event| matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)))
        .flat_map(|event| event.paths.iter())
        .filter(|path| path.parent() == Some(document_dir))
        .filter_map(|path| path.file_name().and_then(|n| n.to_str()))
        .filter_map(parse_version_file_name)
        .max();

    if let Some(version) = newest {
        debug!(version, "broadcasting state change");
        state.publish(ChangeEvent::StateChanged { version });
    }
}
