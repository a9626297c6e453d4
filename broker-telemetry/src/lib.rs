//! Log output for broker processes.
//!
//! Every subscriber installed here writes to stderr, leaving stdout free for
//! the stdio agent channel.

#![warn(missing_docs, clippy::pedantic)]

use broker_config::{LogFormat, LoggingConfig};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Variable whose directive overrides the configured level.
pub const FILTER_ENV: &str = "RUST_LOG";

/// Result alias for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directive could not be parsed.
    #[error("invalid log filter `{directive}`: {reason}")]
    InvalidFilter {
        /// Directive as supplied.
        directive: String,
        /// Parser message.
        reason: String,
    },
    /// A global subscriber was already set.
    #[error("failed to install log subscriber: {0}")]
    Install(String),
}

/// Builds the filter: `RUST_LOG` when set, otherwise `level`.
///
/// # Errors
///
/// Returns [`TelemetryError::InvalidFilter`] when the chosen directive does
/// not parse.
pub fn filter(level: &str) -> TelemetryResult<EnvFilter> {
    let from_env = std::env::var(FILTER_ENV).ok();
    filter_from(from_env.as_deref(), level)
}

fn filter_from(from_env: Option<&str>, level: &str) -> TelemetryResult<EnvFilter> {
    let directive = from_env
        .filter(|directive| !directive.trim().is_empty())
        .unwrap_or(level);
    EnvFilter::try_new(directive).map_err(|err| TelemetryError::InvalidFilter {
        directive: directive.to_owned(),
        reason: err.to_string(),
    })
}

/// Installs the global subscriber described by `config`.
///
/// # Errors
///
/// Returns [`TelemetryError::InvalidFilter`] for a bad directive or
/// [`TelemetryError::Install`] if a subscriber is already installed.
pub fn init(config: &LoggingConfig) -> TelemetryResult<()> {
    let filter = filter(&config.level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|err| TelemetryError::Install(err.to_string()))
}
