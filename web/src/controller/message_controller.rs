use crate::controller::ApiResponse;
use crate::extractors::connection_headers::ClientIdHeader;
use crate::params::message::CreateParams;
use crate::Error;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use service::AppState;

use log::*;

const ANONYMOUS_SENDER: &str = "anonymous";

/// POST publish a new chat message
#[utoipa::path(
    post,
    path = "/api/messages",
    params(
        ("X-Client-Id" = Option<String>, Header, description = "Sender identity, defaults to anonymous")
    ),
    request_body = CreateParams,
    responses(
        (status = 201, description = "Successfully published the message"),
        (status = 422, description = "Unprocessable Entity"),
        (status = 405, description = "Method not allowed")
    )
)]
pub async fn create(
    State(app_state): State<AppState>,
    ClientIdHeader(client_id): ClientIdHeader,
    Json(params): Json<CreateParams>,
) -> Result<impl IntoResponse, Error> {
    let sender_id = client_id.unwrap_or_else(|| ANONYMOUS_SENDER.to_string());
    debug!("POST publish a new message from {sender_id}");

    let message = app_state.publisher.publish(&params.body, &sender_id)?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::new(StatusCode::CREATED.into(), message)),
    ))
}
