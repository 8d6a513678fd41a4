//! Terminal logging for the relay server.

use crate::config::{Config, RustEnv};
use log::{LevelFilter, SetLoggerError};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

/// Dependencies whose records are dropped unless the level is `TRACE`.
const NOISY_DEPENDENCIES: &[&str] = &[
    "tower", "tower_http", "tracing", "hyper", "axum", "mio", "reqwest",
];

pub struct Logger {}

impl Logger {
    /// Installs the global terminal logger.
    ///
    /// Fails if a logger has already been installed for this process.
    pub fn init_logger(config: &Config) -> Result<(), SetLoggerError> {
        let level = config.log_level_filter;
        TermLogger::init(
            level,
            Self::log_config(level),
            TerminalMode::Mixed,
            Self::color_choice(&config.runtime_env()),
        )
    }

    fn log_config(level: LevelFilter) -> simplelog::Config {
        let mut builder = ConfigBuilder::new();
        builder.set_time_format_rfc3339();
        for module in Self::ignored_modules(level) {
            builder.add_filter_ignore_str(module);
        }
        builder.build()
    }

    fn ignored_modules(level: LevelFilter) -> &'static [&'static str] {
        if level == LevelFilter::Trace {
            &[]
        } else {
            NOISY_DEPENDENCIES
        }
    }

    // No ANSI escapes in production output.
    fn color_choice(env: &RustEnv) -> ColorChoice {
        match env {
            RustEnv::Production => ColorChoice::Never,
            RustEnv::Development | RustEnv::Staging => ColorChoice::Auto,
        }
    }
}
