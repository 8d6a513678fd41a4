use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use sse::handshake::HandshakeTimeouts;
use sse::EngineConfig;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum RustEnv {
    Development,
    Production,
    Staging,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RustEnvParseError;

impl FromStr for RustEnv {
    type Err = RustEnvParseError;
    fn from_str(level: &str) -> Result<RustEnv, Self::Err> {
        match level.to_lowercase().as_str() {
            "development" => Ok(RustEnv::Development),
            "production" => Ok(RustEnv::Production),
            "staging" => Ok(RustEnv::Staging),
            _ => Err(RustEnvParseError),
        }
    }
}

impl fmt::Display for RustEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RustEnv::Development => write!(f, "development"),
            RustEnv::Production => write!(f, "production"),
            RustEnv::Staging => write!(f, "staging"),
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// A list of full CORS origin URLs that allowed to receive server responses.
    #[arg(
        long,
        env,
        value_delimiter = ',',
        use_value_delimiter = true,
        default_value = "http://localhost:3000,https://localhost:3000"
    )]
    pub allowed_origins: Vec<String>,

    /// The host interface to listen for incoming connections
    #[arg(short, long, env, default_value = "127.0.0.1")]
    pub interface: Option<String>,

    /// The host TCP port to listen for incoming connections
    #[arg(short, long, env, default_value_t = 4000)]
    pub port: u16,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap_or(LevelFilter::Info)),
        )]
    pub log_level_filter: LevelFilter,

    /// Set the Rust runtime environment to use.
    #[arg(
    short,
    long,
    env,
    default_value_t = RustEnv::Development,
    value_parser = clap::builder::PossibleValuesParser::new([
        "DEVELOPMENT", "PRODUCTION", "STAGING",
        "development", "production", "staging"
    ])
        .map(|s| s.parse::<RustEnv>().unwrap_or(RustEnv::Development)),
    )]
    pub runtime_env: RustEnv,

    /// Milliseconds without traffic before push subscribers get a keep-alive.
    /// Also the longest an idle long-poll is held.
    #[arg(long, env, default_value_t = 15_000)]
    pub keep_alive_ms: u64,

    /// Milliseconds a long-poll with pending messages is held to batch them.
    #[arg(long, env, default_value_t = 2_000)]
    pub longpoll_min_wait_ms: u64,

    /// Handshake deadline once the publisher has been seen answering.
    #[arg(long, env, default_value_t = 1_500)]
    pub reply_timeout_ms: u64,

    /// Long-poll handshake deadline before the publisher has ever answered.
    #[arg(long, env, default_value_t = 15_000)]
    pub cold_start_timeout_ms: u64,

    /// Welcome snapshot deadline before the publisher has ever answered.
    #[arg(long, env, default_value_t = 300)]
    pub snapshot_cold_timeout_ms: u64,

    /// How long the publisher keeps history for reconnecting readers.
    #[arg(long, env, default_value_t = 3_600_000)]
    pub history_retention_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }

    pub fn is_production(&self) -> bool {
        self.runtime_env() == RustEnv::Production
    }

    pub fn history_retention(&self) -> Duration {
        Duration::from_millis(self.history_retention_ms)
    }

    /// Timing knobs of the distribution engine.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            keep_alive: Duration::from_millis(self.keep_alive_ms),
            longpoll_min_wait: Duration::from_millis(self.longpoll_min_wait_ms),
            handshake: HandshakeTimeouts {
                reply: Duration::from_millis(self.reply_timeout_ms),
                poll_cold_start: Duration::from_millis(self.cold_start_timeout_ms),
                snapshot_cold_start: Duration::from_millis(self.snapshot_cold_timeout_ms),
            },
        }
    }
}
