use crate::controller::{health_check_controller, message_controller, welcome_controller};
use crate::params;
use crate::sse::handler;
use axum::{
    routing::{get, post},
    Router,
};
use service::AppState;
use utoipa::OpenApi;
use utoipa_rapidoc::RapiDoc;

// This is the global definition of our OpenAPI spec. To be a part
// of the rendered spec, a path and schema must be listed here.
#[derive(OpenApi)]
#[openapi(
        info(
            title = "Chat Relay API"
        ),
        paths(
            handler::messages_handler,
            message_controller::create,
            welcome_controller::read,
            health_check_controller::health_check,
        ),
        components(
            schemas(
                params::message::CreateParams,
            )
        ),
        tags(
            (name = "chat_relay", description = "Real-time chat message distribution")
        )
    )]
struct ApiDoc;

pub fn define_routes(app_state: AppState) -> Router {
    Router::new()
        .merge(message_routes(app_state.clone()))
        .merge(welcome_routes(app_state.clone()))
        .merge(health_routes(app_state))
        .merge(RapiDoc::with_openapi("/api-docs/openapi.json", ApiDoc::openapi()).path("/rapidoc"))
}

fn message_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/api/messages", get(handler::messages_handler))
        .route("/api/messages", post(message_controller::create))
        .with_state(app_state)
}

fn welcome_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/api/welcome", get(welcome_controller::read))
        .with_state(app_state)
}

fn health_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check_controller::health_check))
        .with_state(app_state)
}
