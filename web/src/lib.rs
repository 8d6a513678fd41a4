use axum::http::{header, HeaderName, HeaderValue, Method};
use events::message::{CLIENT_ID_HEADER, LAST_EVENT_ID_HEADER};
use log::*;
use service::AppState;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

mod controller;
mod error;
mod extractors;
mod params;
pub mod router;
mod sse;

pub use self::error::{Error, Result};

pub async fn init_server(app_state: AppState) -> std::io::Result<()> {
    let interface = app_state
        .config
        .interface
        .clone()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let listen_addr = format!("{interface}:{}", app_state.config.port);

    info!("Server starting... listening for connections on http://{listen_addr}");

    let cors_layer = cors_layer(&app_state.config.allowed_origins);
    let listener = TcpListener::bind(listen_addr).await?;
    axum::serve(listener, router::define_routes(app_state).layer(cors_layer)).await
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring invalid CORS origin {origin}: {e}");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_credentials(true)
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(LAST_EVENT_ID_HEADER),
            HeaderName::from_static(CLIENT_ID_HEADER),
        ])
        .allow_origin(origins)
}
