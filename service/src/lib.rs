use config::Config;
use events::channel::{Channel, LocalChannel};
use events::clock::{Clock, TokioClock};
use log::info;
use sse::{Manager, Publisher};
use std::sync::Arc;

pub mod config;
pub mod logging;

// Service-level state shared by every request handler.
// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub manager: Manager,
    pub publisher: Publisher,
}

impl AppState {
    /// Wires a publisher and a distribution engine together over an
    /// in-process channel. Must be called from within a Tokio runtime.
    pub fn new(app_config: Config) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        Self::with_clock(app_config, clock)
    }

    pub fn with_clock(app_config: Config, clock: Arc<dyn Clock>) -> Self {
        let channel: Arc<dyn Channel> = Arc::new(LocalChannel::new());
        let engine_config = app_config.engine_config();

        let publisher = Publisher::new(
            Arc::clone(&clock),
            Arc::clone(&channel),
            app_config.history_retention(),
        );
        let manager = Manager::new(clock, channel, engine_config);
        info!(
            "Distribution engine ready: keep-alive {:?}, long-poll minimum wait {:?}",
            engine_config.keep_alive, engine_config.longpoll_min_wait
        );

        Self {
            config: app_config,
            manager,
            publisher,
        }
    }
}
