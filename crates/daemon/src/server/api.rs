//! REST handlers for the session registry.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use protocol::{CreateSessionRequest, RenameSessionRequest, SessionSummary};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::state::AppState;
use crate::session::SessionRegistry;

/// Response for `GET /api/health`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub sessions: usize,
}

/// Response for `DELETE /api/sessions/:id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteResponse {
    pub ok: bool,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        sessions: state.registry.count(),
    })
}

pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSummary>> {
    Json(state.registry.list())
}

/// Creates a session. The body is optional; an empty body uses defaults.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<SessionSummary>, ApiError> {
    let request: CreateSessionRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSessionRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))?
    };

    let cwd = request
        .cwd
        .filter(|c| !c.trim().is_empty())
        .map(PathBuf::from);
    let title = request.title.filter(|t| !t.trim().is_empty());

    let summary = state.registry.create(cwd, title).await?;
    Ok(Json(summary))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    let session = state.registry.get(&id)?;
    Ok(Json(session.summary()))
}

pub async fn rename_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<RenameSessionRequest>,
) -> Result<Json<SessionSummary>, ApiError> {
    let title = request.title.trim();
    if title.is_empty() {
        return Err(ApiError::bad_request("title must not be empty"));
    }
    let summary = state.registry.rename(&id, title.to_string())?;
    Ok(Json(summary))
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    state.registry.terminate(&id).await?;
    Ok(Json(DeleteResponse { ok: true }))
}
