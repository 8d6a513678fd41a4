use crate::controller::ApiResponse;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use service::AppState;

/// GET the health of the server and live counts from the distribution engine
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "API router is up and responding to requests"),
        (status = 500, description = "Internal Server Error")
    )
)]
pub async fn health_check(State(app_state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::new(
        StatusCode::OK.into(),
        app_state.manager.stats(),
    ))
}
