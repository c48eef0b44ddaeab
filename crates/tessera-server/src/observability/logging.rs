//! Subscriber setup for the `tracing` events the backends emit.
//!
//! JSON output carries one object per event, e.g.
//!
//! ```json
//! {"timestamp":"2024-01-15T10:30:00.000Z","level":"DEBUG","target":"tessera_storage::memory::objects","fields":{"message":"memory storage transaction started"}}
//! ```

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

use crate::config::{ConfigLoadError, LoggingSettings};

/// Parses a level name such as `info` or `DEBUG`.
pub fn parse_level(raw: &str) -> Result<Level, ConfigLoadError> {
    Level::from_str(raw)
        .map_err(|_| ConfigLoadError::invalid(format!("logging.level {raw:?} is not a log level")))
}

fn span_events(settings: &LoggingSettings) -> FmtSpan {
    if settings.spans {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Installs the global subscriber described by `settings`. `RUST_LOG`
/// overrides the configured level.
///
/// Only the first call installs a subscriber; later calls have no effect.
pub fn init_logging(settings: &LoggingSettings) -> Result<(), ConfigLoadError> {
    let level = parse_level(&settings.level)?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let layer = if settings.json {
        fmt::layer()
            .json()
            .with_span_events(span_events(settings))
            .with_current_span(true)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_span_events(span_events(settings))
            .with_target(true)
            .boxed()
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(layer);
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("global subscriber already installed");
    }
    Ok(())
}
