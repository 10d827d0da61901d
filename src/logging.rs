//! Logging setup.
//!
//! The crate only emits `tracing` events; embedders either install their own
//! subscriber or call [`init_logging`] once at startup.
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{LoggingError, LoggingResult};

/// Configuration for log output.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level filter. `None` reads `RUST_LOG`, falling back to INFO.
    pub level: Option<LevelFilter>,
    /// Write to stderr.
    pub console: bool,
    /// Colored console output.
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            console: true,
            ansi: true,
        }
    }
}

/// Console logging at `level`.
pub fn init_console_logging(level: LevelFilter) -> LoggingResult<()> {
    init_logging(LoggingConfig {
        level: Some(level),
        ..LoggingConfig::default()
    })
}

/// Install the global subscriber described by `config`.
///
/// With console output disabled nothing is installed and the tracing macros
/// stay no-ops. A second successful call reports
/// [`LoggingError::AlreadyInitialized`].
pub fn init_logging(config: LoggingConfig) -> LoggingResult<()> {
    if !config.console {
        return Ok(());
    }
    let filter = match config.level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string())),
    };
    let console = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_ansi(config.ansi);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)
}

/// Parse a level name (`trace`, `debug`, `info`, `warn`, `error`, `off`).
pub fn parse_level(name: &str) -> LoggingResult<LevelFilter> {
    name.parse::<LevelFilter>()
        .map_err(|_| LoggingError::Filter(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_rejected() {
        let first = init_console_logging(LevelFilter::WARN);
        // Another test may already have installed a subscriber.
        if first.is_ok() {
            assert!(matches!(
                init_console_logging(LevelFilter::INFO),
                Err(LoggingError::AlreadyInitialized)
            ));
        }
    }

    #[test]
    fn disabled_console_installs_nothing() {
        let config = LoggingConfig {
            console: false,
            ..LoggingConfig::default()
        };
        assert!(init_logging(config).is_ok());
    }

    #[test]
    fn parses_level_names() {
        assert_eq!(parse_level("debug").ok(), Some(LevelFilter::DEBUG));
        assert!(matches!(parse_level("loud"), Err(LoggingError::Filter(_))));
    }
}
