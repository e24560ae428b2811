use crate::buffer::{BufferStatus, DurableBuffer};
use crate::supervisor::{StatusBoard, TaskStatus};
use crate::uploader::{UploadSnapshot, UploadStats};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    pub box_id: String,
    pub buffer: DurableBuffer,
    pub uploads: Arc<UploadStats>,
    pub tasks: StatusBoard,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    box_id: String,
    buffer: BufferStatus,
    uploads: UploadSnapshot,
    tasks: Vec<TaskStatus>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(
    State(state): State<HttpState>,
) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    let buffer = state
        .buffer
        .status()
        .await
        .map_err(|err| (StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;
    Ok(Json(StatusResponse {
        box_id: state.box_id.clone(),
        buffer,
        uploads: state.uploads.snapshot(),
        tasks: state.tasks.snapshot(),
    }))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .with_state(state)
}
