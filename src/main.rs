use log::{error, info};
use service::{config::Config, logging::Logger, AppState};

#[tokio::main]
async fn main() {
    let config = Config::new();
    if let Err(e) = Logger::init_logger(&config as &Config) {
        eprintln!("Failed to initialize logging: {e}");
    }

    info!("Starting chat relay [{}]...", config.runtime_env());

    let app_state = AppState::new(config);

    if let Err(e) = web::init_server(app_state).await {
        error!("Server exited with an error: {e}");
        std::process::exit(1);
    }
}
