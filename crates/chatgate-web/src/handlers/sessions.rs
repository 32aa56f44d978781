//! Session inspection endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;
use std::sync::Arc;

use chatgate_chat::{Session, SessionInfo};
use chatgate_core::Error;

use crate::error::ApiError;
use crate::state::AppState;

/// POST /api/sessions
pub async fn create_session_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let session = state.sessions.create().await;
    (
        StatusCode::CREATED,
        Json(json!({
            "session_id": session.id,
            "created_at": session.created_at,
        })),
    )
}

/// GET /api/sessions
pub async fn list_sessions_handler(State(state): State<Arc<AppState>>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list().await)
}

/// GET /api/sessions/:id - full transcript
pub async fn get_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.sessions.get(&id).await?))
}

/// DELETE /api/sessions/:id
pub async fn delete_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.close(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::session_not_found(id).into())
    }
}
