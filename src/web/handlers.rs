//! HTTP handlers

use super::AppState;
use crate::session::{SessionError, SessionSummary, StatusReport};
use crate::store::SessionRecord;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::json;

/// `SessionError` as an HTTP response
pub struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::Dead(_) | SessionError::InvalidTransition(_) => StatusCode::CONFLICT,
            SessionError::Spawn(_) | SessionError::Process(_) | SessionError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(json!({ "success": false, "error": self.0.to_string() })),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub sessions: usize,
    pub multiplexer: bool,
}

pub async fn api_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.registry.list().await.len(),
        multiplexer: state.registry.has_multiplexer(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListResponse {
    /// Sessions loaded in this server process
    pub sessions: Vec<SessionSummary>,
    /// Active sessions known to the store, including ones not loaded yet
    pub stored: Vec<SessionRecord>,
}

pub async fn api_list_sessions(
    State(state): State<AppState>,
) -> Result<Json<SessionListResponse>, ApiError> {
    Ok(Json(SessionListResponse {
        sessions: state.registry.list().await,
        stored: state.registry.stored_sessions().await?,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputResponse {
    pub session_id: String,
    pub output: String,
}

pub async fn api_get_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OutputResponse>, ApiError> {
    let output = state.registry.buffered_output(&id).await?;
    Ok(Json(OutputResponse {
        session_id: id,
        output,
    }))
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

/// Fire-and-forget save on page unload
pub async fn api_save_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    state.registry.save(&id).await?;
    Ok(Json(ActionResponse {
        success: true,
        message: format!("Output of session {} saved", id),
    }))
}

pub async fn api_kill_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    state.registry.kill(&id).await?;
    Ok(Json(ActionResponse {
        success: true,
        message: format!("Session {} killed", id),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiplexerResponse {
    pub session_id: String,
    pub name: String,
    pub exists: bool,
}

pub async fn api_multiplexer_exists(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<MultiplexerResponse> {
    let exists = state.registry.multiplexer_exists(&id).await;
    Json(MultiplexerResponse {
        name: state.registry.multiplexer_name(&id),
        session_id: id,
        exists,
    })
}

pub async fn api_session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusReport>, ApiError> {
    Ok(Json(state.registry.status(&id).await?))
}
