//! Shared error definitions for broker primitives.

use thiserror::Error;

/// Result alias used throughout the broker workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while validating primitive types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// App name failed validation.
    #[error("invalid app name `{name}`: {reason}")]
    InvalidAppName {
        /// The offending name.
        name: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Tool name failed validation.
    #[error("invalid tool name `{name}`: {reason}")]
    InvalidToolName {
        /// The offending name.
        name: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Tool name carries the namespace prefix of a different app.
    #[error("tool `{tool}` does not belong to app `{app}`")]
    ForeignNamespace {
        /// Fully qualified tool name as declared.
        tool: String,
        /// App that attempted to declare it.
        app: String,
    },
}
