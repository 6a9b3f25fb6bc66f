//! Opt-in `tracing` output for applications embedding the container
//!
//! The container itself only emits events. Binaries without a subscriber of
//! their own, such as the `chat_room` demo, install one here.

use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

const MODE_VAR: &str = "LISTENER_LOG_MODE";
const LEVEL_VAR: &str = "LISTENER_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Leave the global subscriber alone
    Silent,
    /// One line per event, `info` and up
    Development,
    /// Multi-line events with thread names and source locations, `debug` and up
    Debug,
}

impl LoggingMode {
    /// Parse a `LISTENER_LOG_MODE` value; anything unknown is `Silent`
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("development") => Self::Development,
            Some("debug") => Self::Debug,
            _ => Self::Silent,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to install tracing subscriber: {0}")]
    TracingInit(String),
}

/// Install a global subscriber for `mode`.
///
/// Events are filtered by `LISTENER_LOG_LEVEL`, else `RUST_LOG`, else the
/// mode's default level. Fails if a global subscriber is already set.
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    let (default_level, output): (&str, Box<dyn Layer<Registry> + Send + Sync>) = match mode {
        LoggingMode::Silent => return Ok(()),
        LoggingMode::Development => ("info", fmt::layer().with_target(false).compact().boxed()),
        LoggingMode::Debug => (
            "debug",
            fmt::layer()
                .pretty()
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .boxed(),
        ),
    };

    Registry::default()
        .with(output)
        .with(filter(default_level))
        .try_init()
        .map_err(|e| LoggingError::TracingInit(e.to_string()))
}

/// [`init_logging`] with the mode read from `LISTENER_LOG_MODE`
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let mode = std::env::var(MODE_VAR).ok();
    init_logging(LoggingMode::from_env_value(mode.as_deref()))
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LEVEL_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level))
}
