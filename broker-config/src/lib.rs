//! Configuration for the tool broker.
//!
//! [`ConfigLoader`] layers built-in defaults, an optional TOML file and
//! `TOOL_BROKER_*` environment variables into a [`BrokerConfig`].

#![warn(missing_docs, clippy::pedantic)]

pub mod loader;
pub mod schema;

use std::path::PathBuf;

use thiserror::Error;

pub use loader::{ConfigLoader, ENV_PREFIX};
pub use schema::{
    AgentConfig, AgentTransport, BrokerConfig, CallConfig, KnownApp, ListenerConfig, LogFormat,
    LoggingConfig,
};

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("configuration file not found: {}", path.display())]
    MissingFile {
        /// Requested path.
        path: PathBuf,
    },
    /// A source could not be parsed or did not match the schema.
    #[error("failed to load configuration: {0}")]
    Load(#[source] Box<figment::Error>),
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
    /// A known app entry has an unusable name.
    #[error("invalid known app `{name}`: {reason}")]
    InvalidKnownApp {
        /// Name as written in the file.
        name: String,
        /// Why it was rejected.
        reason: String,
    },
}
