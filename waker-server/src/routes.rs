//! HTTP route handlers for the API.

use axum::Router;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use waker::core::types::{Priority, TaskAction};
use waker::cycle::{CycleError, CycleReport};
use waker::io::state_store::StoreError;
use waker::orchestrator::{EnqueueError, StatusReport};

use crate::state::{AppState, ChangeEvent};

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/tasks", post(enqueue_task))
        .route("/wake", post(trigger_wake))
}

/// Error body `{"error": ..}` with the status chosen from the error kind.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::VersionConflict { .. } => StatusCode::CONFLICT,
            StoreError::NotFound { .. }
            | StoreError::Malformed(_)
            | StoreError::InvalidCommit(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<CycleError> for ApiError {
    fn from(err: CycleError) -> Self {
        match err {
            CycleError::Store(store) => store.into(),
            CycleError::ConflictRetriesExhausted { .. } => Self {
                status: StatusCode::CONFLICT,
                message: err.to_string(),
            },
        }
    }
}

impl From<EnqueueError> for ApiError {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::InvalidTask(_) => Self::bad_request(err.to_string()),
            EnqueueError::Store(store) => store.into(),
            EnqueueError::ConflictRetriesExhausted { .. } => Self {
                status: StatusCode::CONFLICT,
                message: err.to_string(),
            },
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/status - projection of the last committed state.
async fn get_status(State(state): State<AppState>) -> Result<Json<StatusReport>, ApiError> {
    Ok(Json(state.orchestrator.get_status().await?))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    action: TaskAction,
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    id: String,
}

/// POST /api/tasks - append a pending task and commit it.
async fn enqueue_task(
    State(state): State<AppState>,
    body: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let Json(request) = body.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let id = state
        .orchestrator
        .enqueue_task_with_action(
            &request.name,
            &request.description,
            request.priority,
            request.action,
        )
        .await?;
    state.publish(ChangeEvent::TaskEnqueued {
        task_id: id.clone(),
    });
    Ok((StatusCode::CREATED, Json(EnqueueResponse { id })))
}

/// POST /api/wake - run one cycle now and return its report.
async fn trigger_wake(State(state): State<AppState>) -> Result<Json<CycleReport>, ApiError> {
    let result = state.orchestrator.trigger_cycle().await;
    publish_cycle(&state, &result);
    match result {
        Ok(report) => Ok(Json(report)),
        Err(err) => {
            warn!(err = %err, "manual wake did not commit");
            Err(err.into())
        }
    }
}

/// Broadcast the outcome of a cycle, whether manual or timer-driven.
pub fn publish_cycle(state: &AppState, result: &Result<CycleReport, CycleError>) {
    let event = match result {
        Ok(report) => ChangeEvent::CycleCommitted {
            version: report.version,
            cycle: report.record.cycle_number,
        },
        Err(err) => ChangeEvent::CycleFailed {
            error: err.to_string(),
        },
    };
    state.publish(event);
}
