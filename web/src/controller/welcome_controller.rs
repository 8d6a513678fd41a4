use crate::extractors::connection_headers::ClientIdHeader;
use crate::Error;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use service::AppState;

use log::*;

/// GET the welcome a new reader would receive, for rendering history up front
#[utoipa::path(
    get,
    path = "/api/welcome",
    params(
        ("X-Client-Id" = Option<String>, Header, description = "Identity to reuse in the welcome")
    ),
    responses(
        (status = 200, description = "A welcome envelope with the retained history"),
        (status = 503, description = "The publisher did not answer in time")
    )
)]
pub async fn read(
    State(app_state): State<AppState>,
    ClientIdHeader(client_id): ClientIdHeader,
) -> Result<impl IntoResponse, Error> {
    debug!("GET welcome snapshot for {client_id:?}");

    let welcome = app_state.manager.snapshot(client_id).await?;

    Ok(Json(welcome))
}
