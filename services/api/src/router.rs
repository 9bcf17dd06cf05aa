//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        ClientStateSnapshot, ErrorResponse, HealthResponse, TurnRequest, TurnResponse,
        TurnStateDto,
    },
    state::AppState,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::post_turn,
        handlers::get_session,
        handlers::delete_session,
        handlers::health,
    ),
    components(
        schemas(TurnRequest, TurnResponse, TurnStateDto, ClientStateSnapshot, ErrorResponse, HealthResponse)
    ),
    tags(
        (name = "Mentor API", description = "Turn-based tutoring engine")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/engine/turn", post(handlers::post_turn))
        .route(
            "/sessions/{key}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/health", get(handlers::health))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
