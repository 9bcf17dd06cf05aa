//! Axum Handlers for the REST API
//!
//! This module contains the logic for handling HTTP requests for the turn
//! endpoint and session management. It uses `utoipa` doc comments to
//! generate OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::error;

use crate::{
    models::{ErrorResponse, HealthResponse, TurnRequest, TurnResponse, TurnStateDto},
    orchestrator::{self, MAX_HINTS},
    state::AppState,
    store::SessionStore,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = format!("Turn failed: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Run one tutoring turn for a session.
#[utoipa::path(
    post,
    path = "/engine/turn",
    request_body = TurnRequest,
    responses(
        (status = 200, description = "Turn processed", body = TurnResponse),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn post_turn(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TurnRequest>,
) -> Result<Json<TurnResponse>, ApiError> {
    if payload.session_key.trim().is_empty() {
        return Err(ApiError::BadRequest("sessionKey is required".to_string()));
    }

    let outcome = orchestrator::run_turn(&state, &payload).await?;
    Ok(Json(TurnResponse {
        message: outcome.message,
        follow_up: outcome.follow_up,
        assessment: outcome.assessment,
        state: TurnStateDto {
            step_idx: outcome.state.step_idx,
            done: outcome.state.done,
            hints_used: outcome.hints_used,
            max_hints: MAX_HINTS,
        },
        step_code: outcome.step_code,
        moment_idx: outcome.moment_idx,
        budget_metrics: outcome.budget_metrics,
    }))
}

/// Get the stored state of a session.
#[utoipa::path(
    get,
    path = "/sessions/{key}",
    responses(
        (status = 200, description = "Session state", body = Object),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("key" = String, Path, description = "The session key")
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .store
        .get(&key)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No session found for key '{key}'")))?;
    Ok(Json(serde_json::to_value(session)?))
}

/// Delete a session and its transcript.
#[utoipa::path(
    delete,
    path = "/sessions/{key}",
    responses(
        (status = 204, description = "Session deleted"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("key" = String, Path, description = "The session key")
    )
)]
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.delete(&key).await?;
    state.store.clear_transcript(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}
